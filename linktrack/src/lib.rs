//! Face-tracking control loop for UVC gimbal cameras.
//!
//! Builds on `linktrack_core` (transport, UVC protocol, session and stream
//! plumbing) and adds the vision-to-motion half: detection tensor decoding,
//! the tracking state machine with its PID loop, and the service surface a
//! UI or bridge talks to.

pub mod detect;
pub mod service;
pub mod tracking;

pub use detect::{decode, DecoderConfig, Detection, Detector, InferenceOutput, TargetPolicy};
pub use service::{ServiceConfig, TickInterval, TrackerService};
pub use tracking::{PidGains, TrackerConfig, TrackingController, TrackingState};

/// The names most integrations need
pub mod prelude {
    pub use crate::detect::{DecoderConfig, Detection, Detector, InferenceOutput, TargetPolicy};
    pub use crate::service::{ServiceConfig, TrackerService};
    pub use crate::tracking::{PidGains, TrackerConfig, TrackingState};
    pub use linktrack_core::{
        ChannelSink, EventSink, LinkError, LinkResult, StateStatus, TrackerEvent,
        TransportProvider, UsbTransport,
    };
}
