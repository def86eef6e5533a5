//! Outbound events for whatever UI or bridge is driving the tracker.
//!
//! Events are plain serde values so the consumer can forward them as JSON
//! without knowing anything about the producer side.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Coarse session status carried by `TrackerEvent::State`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStatus {
    Ready,
    Connected,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrackerEvent {
    /// Session status change, with a human-readable message
    State {
        status: StateStatus,
        message: String,
    },
    /// Stream throughput counters, published at 1 Hz
    #[serde(rename_all = "camelCase")]
    Stream {
        packets: u64,
        bytes: u64,
        payload_bytes: u64,
        frames: u64,
        kbps: f64,
    },
    /// Control-loop telemetry, published per tick
    #[serde(rename_all = "camelCase")]
    Telemetry {
        fps: f32,
        latency_ms: f32,
        pan: f32,
        tilt: f32,
        patrol: bool,
    },
    /// Most recent accepted detection, normalized image coordinates
    Face {
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        score: f32,
    },
}

/// Where events go. Implementations must be cheap and non-blocking; the
/// control tick and the stream reader both publish from their own threads.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: TrackerEvent);
}

/// Sink backed by an unbounded crossbeam channel
pub struct ChannelSink {
    tx: Sender<TrackerEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<TrackerEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: TrackerEvent) {
        // Receiver dropped means nobody is listening anymore; not an error
        let _ = self.tx.send(event);
    }
}

/// Sink that drops everything, for tests and headless runs
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: TrackerEvent) {}
}
