//! Device-side core for UVC gimbal cameras: descriptor parsing, stream
//! negotiation, pan-tilt-zoom control, and the stream reader worker.
//!
//! The crate is host-stack agnostic. Everything talks to the device
//! through the [`transport::UsbTransport`] trait; the platform glue that
//! enumerates devices and produces transports lives outside.

pub mod error;
pub mod events;
pub mod session;
pub mod stream;
pub mod testing;
pub mod transport;
pub mod uvc;

pub use error::{LinkError, LinkResult};
pub use events::{ChannelSink, EventSink, NullSink, StateStatus, TrackerEvent};
pub use session::{ActiveStream, DeviceSession};
pub use stream::{FrameHealthMonitor, FrameMailbox, HealthConfig, ReaderConfig, StreamReader};
pub use transport::{
    DeviceSummary, Direction, EndpointDesc, InterfaceDesc, TransferKind, TransportProvider,
    UsbTransport,
};
pub use uvc::{
    parse_descriptors, probe_commit, ptz_entity_candidates, select_stream, DescriptorEntry,
    GimbalPosition, PtzDrive, StreamParams,
};
