//! Tracking control loop: per-axis PID and the state machine that turns a
//! detection stream (or its absence) into gimbal commands.

pub mod controller;
pub mod pid;

pub use controller::{TickReport, TrackerConfig, TrackingController, TrackingState};
pub use pid::{AxisPid, PidGains};
