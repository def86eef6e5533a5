//! Raw detection-tensor decoding.
//!
//! Different export pipelines produce transposed tensors, logit or
//! probability activations, and pixel or normalized coordinates, none of it
//! carried as metadata. The decoder infers all three per tensor and reduces
//! the candidates to at most one target box.

use log::debug;

use super::{Detection, TargetPolicy};

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub score_threshold: f32,
    pub iou_threshold: f32,
    /// Model input side length, for rescaling pixel-space outputs
    pub input_size: f32,
    /// Minimum side for the low-confidence fallback pool
    pub fallback_min_side: f32,
    pub policy: TargetPolicy,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.02,
            iou_threshold: 0.45,
            input_size: 320.0,
            fallback_min_side: 0.03,
            policy: TargetPolicy::Largest,
        }
    }
}

/// How candidate attributes are laid out in the flat tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[count, attrs]`: one candidate's attributes are contiguous
    AttrsMinor { count: usize, attrs: usize },
    /// `[attrs, count]`: one attribute's values are contiguous
    AttrsMajor { count: usize, attrs: usize },
}

impl TensorLayout {
    pub fn count(&self) -> usize {
        match self {
            Self::AttrsMinor { count, .. } | Self::AttrsMajor { count, .. } => *count,
        }
    }

    pub fn attrs(&self) -> usize {
        match self {
            Self::AttrsMinor { attrs, .. } | Self::AttrsMajor { attrs, .. } => *attrs,
        }
    }

    fn value(&self, tensor: &[f32], candidate: usize, attr: usize) -> f32 {
        match self {
            Self::AttrsMinor { attrs, .. } => tensor[candidate * attrs + attr],
            Self::AttrsMajor { count, .. } => tensor[attr * count + candidate],
        }
    }
}

/// Attribute-dimension bounds used by the layout heuristic: 4 box values
/// plus objectness plus at most a small closed class set.
const ATTR_DIM_MIN: usize = 5;
const ATTR_DIM_MAX: usize = 64;

/// Infer the tensor layout from its shape alone. This is a heuristic over
/// shapes with no embedded metadata; the precedence below is load-bearing
/// and getting it wrong yields nonsense boxes.
///
/// - 2-D `[count, attrs]` is taken at face value (attrs-minor).
/// - 3-D with the middle dimension in `[5,64]` and smaller than the last
///   is attrs-major (`[1, attrs, count]`, the common transposed export).
/// - 3-D with the last dimension in that range and smaller is attrs-minor.
/// - Anything else defaults to attrs-minor over the trailing two dims.
pub fn resolve_layout(shape: &[usize]) -> Option<TensorLayout> {
    if shape.len() < 2 {
        return None;
    }
    if shape.len() == 2 {
        return Some(TensorLayout::AttrsMinor {
            count: shape[0],
            attrs: shape[1],
        });
    }
    let mid = shape[shape.len() - 2];
    let last = shape[shape.len() - 1];
    let in_attr_range = |d: usize| (ATTR_DIM_MIN..=ATTR_DIM_MAX).contains(&d);
    if in_attr_range(mid) && mid < last {
        Some(TensorLayout::AttrsMajor {
            count: last,
            attrs: mid,
        })
    } else if in_attr_range(last) && last < mid {
        Some(TensorLayout::AttrsMinor {
            count: mid,
            attrs: last,
        })
    } else {
        Some(TensorLayout::AttrsMinor {
            count: mid,
            attrs: last,
        })
    }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Sigmoid only when the value is not already a probability; raw logits and
/// pre-activated outputs are both seen in the wild.
fn normalize(v: f32) -> f32 {
    if (0.0..=1.0).contains(&v) {
        v
    } else {
        sigmoid(v)
    }
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Decode a raw output tensor down to at most one target box.
pub fn decode(tensor: &[f32], shape: &[usize], config: &DecoderConfig) -> Option<Detection> {
    let layout = resolve_layout(shape)?;
    let (count, attrs) = (layout.count(), layout.attrs());
    if attrs < 5 || count == 0 || count * attrs > tensor.len() {
        return None;
    }

    let mut scored = Vec::new();
    let mut fallback_pool = Vec::new();
    for i in 0..count {
        let raw = [
            layout.value(tensor, i, 0),
            layout.value(tensor, i, 1),
            layout.value(tensor, i, 2),
            layout.value(tensor, i, 3),
        ];
        let mut score = normalize(layout.value(tensor, i, 4));

        // 1-8 extras model a small closed class set; more than that is
        // landmark-style output and must not scale the score
        let extras = attrs - 5;
        if (1..=8).contains(&extras) {
            let best_class = (5..attrs)
                .map(|a| normalize(layout.value(tensor, i, a)))
                .fold(0.0f32, f32::max);
            score *= best_class;
        }

        // Outputs already normalized never exceed ~2; larger means pixel
        // space and everything rescales by the model input size. Signed
        // on purpose: a large negative value is a logit, not a pixel.
        let pixel_space = raw.iter().any(|v| *v > 2.0);
        let [cx, cy, w, h] = if pixel_space {
            [
                raw[0] / config.input_size,
                raw[1] / config.input_size,
                raw[2] / config.input_size,
                raw[3] / config.input_size,
            ]
        } else {
            [
                normalize(raw[0]),
                normalize(raw[1]),
                normalize(raw[2]),
                normalize(raw[3]),
            ]
        };

        let x = (cx - w / 2.0).clamp(0.0, 1.0);
        let y = (cy - h / 2.0).clamp(0.0, 1.0);
        let w = w.min(1.0 - x);
        let h = h.min(1.0 - y);
        if w <= 0.0 || h <= 0.0 {
            continue;
        }
        let det = Detection { x, y, w, h, score };
        if w >= config.fallback_min_side && h >= config.fallback_min_side {
            fallback_pool.push(det);
        }
        if score >= config.score_threshold {
            scored.push(det);
        }
    }

    let survivors = nms(scored, config.iou_threshold);
    if survivors.is_empty() {
        // Under-confident but spatially consistent detectors thrash
        // between "something" and "nothing"; the size-gated pool keeps
        // a stable target through that
        let fallback = largest(&fallback_pool);
        if fallback.is_some() {
            debug!("decode: score floor missed, using largest-area fallback");
        }
        return fallback;
    }
    match config.policy {
        TargetPolicy::Largest => largest(&survivors),
        TargetPolicy::Nearest => survivors
            .iter()
            .min_by(|a, b| {
                center_distance(a)
                    .total_cmp(&center_distance(b))
            })
            .copied(),
    }
}

fn center_distance(d: &Detection) -> f32 {
    let (cx, cy) = d.center();
    (cx - 0.5).hypot(cy - 0.5)
}

fn largest(pool: &[Detection]) -> Option<Detection> {
    pool.iter()
        .max_by(|a, b| a.area().total_cmp(&b.area()))
        .copied()
}

/// Greedy NMS ordered by descending score
fn nms(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::new();
    for det in candidates {
        if kept.iter().all(|k| iou(k, &det) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}
