//! Unified error handling for linktrack.
//!
//! One error type covers every layer: device discovery, control/bulk
//! transfers, stream negotiation and the tracking runtime. Protocol
//! failures are converted into state events at component boundaries and
//! never unwind past the controller.

use thiserror::Error;

/// Main error type for linktrack operations
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No device matched the requested VID/PID
    #[error("Device not found: vid={vid:#06x} pid={pid:#06x}")]
    DeviceNotFound { vid: u16, pid: u16 },

    /// Access was requested but not yet granted; caller retries after the grant
    #[error("Permission pending: {0}")]
    PermissionPending(String),

    /// No transport is bound (connect was never called or disconnect ran)
    #[error("No USB connection")]
    NoConnection,

    /// The device exposes no video-control interface
    #[error("No video control interface")]
    NoControlInterface,

    /// A single control or bulk transfer was rejected or timed out.
    /// Always non-fatal: the operation aborts for that call only.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Both probe/commit buffer lengths were rejected; the stream cannot start
    #[error("Stream negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The inference collaborator is unavailable; tracking cannot start
    /// but manual control remains usable
    #[error("No detector model loaded: {0}")]
    NoDetectorModel(String),

    /// Health-monitor signal; triggers the recovery state, never a hard failure
    #[error("Stream degenerate: {0}")]
    StreamDegenerate(String),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using LinkError
pub type LinkResult<T> = std::result::Result<T, LinkError>;

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Config(format!("JSON error: {}", err))
    }
}

impl LinkError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        LinkError::Config(msg.into())
    }

    /// Create a transfer error with a custom message
    pub fn transfer<S: Into<String>>(msg: S) -> Self {
        LinkError::TransferFailed(msg.into())
    }

    /// True for errors the runtime swallows and retries on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::TransferFailed(_) | LinkError::StreamDegenerate(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LinkError::transfer("device busy").is_transient());
        assert!(LinkError::StreamDegenerate("green frames".into()).is_transient());
        assert!(!LinkError::NoConnection.is_transient());
        assert!(!LinkError::PermissionPending("awaiting grant".into()).is_transient());
    }

    #[test]
    fn test_device_not_found_display() {
        let err = LinkError::DeviceNotFound {
            vid: 0x2bdf,
            pid: 0x0101,
        };
        assert_eq!(err.to_string(), "Device not found: vid=0x2bdf pid=0x0101");
    }

    #[test]
    fn test_json_errors_map_to_config() {
        let bad: std::result::Result<u32, serde_json::Error> = serde_json::from_str("not json");
        let err: LinkError = bad.unwrap_err().into();
        assert!(matches!(err, LinkError::Config(_)));
    }
}
