//! Face detection output handling.
//!
//! The inference runtime itself lives behind [`Detector`]; this module owns
//! everything after the forward pass: tensor layout inference, candidate
//! decoding, NMS, and target selection.

pub mod decoder;

pub use decoder::{decode, resolve_layout, DecoderConfig, TensorLayout};

use linktrack_core::LinkResult;

/// One detection in normalized image coordinates, `x,y` top-left
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub score: f32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }
}

/// Which surviving box becomes the tracking target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetPolicy {
    /// Largest box by area
    #[default]
    Largest,
    /// Box nearest the image center
    Nearest,
}

/// Inference result for one frame: the raw output tensor plus a small
/// decoded-RGB preview for stream health checks.
pub struct InferenceOutput {
    pub tensor: Vec<f32>,
    pub shape: Vec<usize>,
    pub preview_rgb: Vec<u8>,
}

/// Inference boundary. Implementations own frame decode, resize to the
/// model's square input, and the forward pass.
pub trait Detector: Send {
    fn run(&mut self, frame: &[u8]) -> LinkResult<InferenceOutput>;
}
