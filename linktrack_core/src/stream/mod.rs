//! Stream-side plumbing: the bulk/request reader worker, the latest-frame
//! mailbox, and the frame health monitor.

pub mod health;
pub mod reader;

pub use health::{FrameHealthMonitor, HealthConfig};
pub use reader::{FrameMailbox, ReaderConfig, StreamReader};
