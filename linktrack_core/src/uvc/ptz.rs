//! Pan-tilt-zoom drive over UVC camera-terminal controls.
//!
//! Gimbal cameras disagree on how pan/tilt is addressed: some expose the
//! standard absolute control with sane GET_MIN/GET_MAX ranges, some accept
//! absolute writes but report nothing useful, some only honor relative
//! direction/speed packets. The drive runs a calibration ladder on the first
//! real move, pins the first `(entity, addressing)` pair that takes a
//! SET_CUR, and reuses it for the rest of the session.

use std::sync::Arc;

use log::{debug, info, warn};

use super::{PANTILT_ABSOLUTE, PANTILT_RELATIVE, ZOOM_RELATIVE};
use crate::transport::{
    UsbTransport, GET_MAX, GET_MIN, REQ_TYPE_CLASS_IN, REQ_TYPE_CLASS_OUT, SET_CUR,
};

/// Device-calibrated absolute span, in device units
pub const PAN_RANGE: (i32, i32) = (-522_000, 522_000);
pub const TILT_RANGE: (i32, i32) = (-324_000, 360_000);

/// Device units per full-scale normalized move. Calibration facts for the
/// supported gimbal family, not tunables.
const PAN_MOVE_SCALE: f32 = 90_000.0;
const TILT_MOVE_SCALE: f32 = 68_400.0;

/// Joint input deadzone for unforced moves
const MOVE_DEADZONE: f32 = 0.08;
const ZOOM_DEADZONE: f32 = 0.02;

const PTZ_TIMEOUT_MS: u32 = 300;

/// Entities probed when the descriptors named no PTZ candidates
const FALLBACK_ENTITIES: std::ops::RangeInclusive<u8> = 1..=6;

/// Probe magnitudes for absolute writes on devices that report no range,
/// largest plausible first
const TRIAL_SCALES: [i32; 3] = [36_000, 648_000, 3_600];

/// The drive's believed absolute position. Advances on every commanded
/// move, including failed sends; see `PtzDrive::move_relative`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GimbalPosition {
    pub pan: i32,
    pub tilt: i32,
}

impl GimbalPosition {
    fn clamped(pan: i32, tilt: i32) -> Self {
        Self {
            pan: pan.clamp(PAN_RANGE.0, PAN_RANGE.1),
            tilt: tilt.clamp(TILT_RANGE.0, TILT_RANGE.1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addressing {
    /// Believed position lerped from the documented span into the
    /// device-reported GET_MIN/GET_MAX span
    RangeMapped {
        pan: (i32, i32),
        tilt: (i32, i32),
    },
    /// Believed position written as-is
    Absolute,
    /// Direction/speed packets; the device keeps its own position
    Relative,
}

#[derive(Debug, Clone, Copy)]
struct Pinned {
    entity: u8,
    addressing: Addressing,
}

/// Pan-tilt-zoom transport bound to one control interface of one device.
/// Single-writer by construction: the owning session hands out `&mut`.
pub struct PtzDrive {
    transport: Arc<dyn UsbTransport>,
    vc_interface: u8,
    candidates: Vec<u8>,
    pinned: Option<Pinned>,
    zoom_entity: Option<u8>,
    position: GimbalPosition,
    /// Soft accumulator for telemetry; never used for clamping
    zoom_level: f32,
}

impl PtzDrive {
    pub fn new(transport: Arc<dyn UsbTransport>, vc_interface: u8, candidates: Vec<u8>) -> Self {
        let candidates = if candidates.is_empty() {
            FALLBACK_ENTITIES.collect()
        } else {
            candidates
        };
        Self {
            transport,
            vc_interface,
            candidates,
            pinned: None,
            zoom_entity: None,
            position: GimbalPosition::default(),
            zoom_level: 0.0,
        }
    }

    pub fn position(&self) -> GimbalPosition {
        self.position
    }

    pub fn zoom_level(&self) -> f32 {
        self.zoom_level
    }

    /// Normalized relative move. Inputs inside the deadzone are reported as
    /// success without touching the device unless `force` is set.
    ///
    /// The believed position advances before the transfer and is not rolled
    /// back on failure: a failed send usually means the device is momentarily
    /// busy, and drift-correcting against it causes oscillating catch-up
    /// loops. `center()` re-syncs.
    pub fn move_relative(&mut self, pan: f32, tilt: f32, duration_ms: u32, force: bool) -> bool {
        if !force && pan.abs() < MOVE_DEADZONE && tilt.abs() < MOVE_DEADZONE {
            return true;
        }
        let pan = pan.clamp(-1.0, 1.0);
        let tilt = tilt.clamp(-1.0, 1.0);
        self.position = GimbalPosition::clamped(
            self.position.pan + (pan * PAN_MOVE_SCALE) as i32,
            self.position.tilt + (tilt * TILT_MOVE_SCALE) as i32,
        );
        match self.pinned {
            Some(pinned) => self.send_move(pinned, pan, tilt, duration_ms),
            None => self.calibrate(pan, tilt, duration_ms),
        }
    }

    /// Relative zoom. The first successful write pins the zoom entity.
    pub fn zoom(&mut self, z: f32, _duration_ms: u32) -> bool {
        if z.abs() < ZOOM_DEADZONE {
            return true;
        }
        let z = z.clamp(-1.0, 1.0);
        self.zoom_level = (self.zoom_level + z * 0.1).clamp(0.0, 1.0);
        let payload = zoom_payload(z);
        if let Some(entity) = self.zoom_entity {
            return self.set_cur(entity, ZOOM_RELATIVE, &payload) >= 0;
        }
        let candidates = self.candidates.clone();
        for entity in candidates {
            if self.set_cur(entity, ZOOM_RELATIVE, &payload) >= 0 {
                info!("ptz: zoom entity pinned at {}", entity);
                self.zoom_entity = Some(entity);
                return true;
            }
        }
        warn!("ptz: no entity accepted relative zoom");
        false
    }

    /// Forced move home. The believed position resets to `(0,0)` regardless
    /// of the transfer outcome; centering is how physical and logical
    /// position get back in sync.
    pub fn center(&mut self) -> bool {
        self.position = GimbalPosition::default();
        let sent = match self.pinned {
            Some(pinned) => self.send_move(pinned, 0.0, 0.0, 200),
            None => self.calibrate(0.0, 0.0, 200),
        };
        if !sent {
            warn!("ptz: center transfer failed, position reset anyway");
        }
        sent
    }

    /// Try every candidate entity down the addressing ladder until one
    /// SET_CUR succeeds, then pin that pair for the session.
    fn calibrate(&mut self, pan: f32, tilt: f32, duration_ms: u32) -> bool {
        let candidates = self.candidates.clone();
        for entity in candidates {
            if let Some(ranges) = self.read_ranges(entity) {
                let pinned = Pinned {
                    entity,
                    addressing: Addressing::RangeMapped {
                        pan: ranges.0,
                        tilt: ranges.1,
                    },
                };
                if self.send_move(pinned, pan, tilt, duration_ms) {
                    info!("ptz: entity {} pinned, range-mapped absolute", entity);
                    self.pinned = Some(pinned);
                    return true;
                }
            }
            // No usable range: probe raw absolute writes at trial magnitudes
            for scale in TRIAL_SCALES {
                let target = GimbalPosition::clamped(
                    self.position.pan + sign(pan) * scale,
                    self.position.tilt + sign(tilt) * scale,
                );
                if self.send_absolute(entity, target) {
                    info!("ptz: entity {} pinned, absolute (trial {})", entity, scale);
                    self.pinned = Some(Pinned {
                        entity,
                        addressing: Addressing::Absolute,
                    });
                    self.position = target;
                    return true;
                }
            }
            let pinned = Pinned {
                entity,
                addressing: Addressing::Relative,
            };
            if self.send_move(pinned, pan, tilt, duration_ms) {
                info!("ptz: entity {} pinned, relative", entity);
                self.pinned = Some(pinned);
                return true;
            }
        }
        warn!("ptz: calibration exhausted all entities");
        false
    }

    fn send_move(&mut self, pinned: Pinned, pan: f32, tilt: f32, duration_ms: u32) -> bool {
        match pinned.addressing {
            Addressing::RangeMapped {
                pan: pan_span,
                tilt: tilt_span,
            } => {
                let target = GimbalPosition {
                    pan: lerp_span(self.position.pan, PAN_RANGE, pan_span),
                    tilt: lerp_span(self.position.tilt, TILT_RANGE, tilt_span),
                };
                self.send_absolute(pinned.entity, target)
            }
            Addressing::Absolute => self.send_absolute(pinned.entity, self.position),
            Addressing::Relative => {
                let payload = relative_payload(pan, tilt, duration_ms);
                self.set_cur(pinned.entity, PANTILT_RELATIVE, &payload) >= 0
            }
        }
    }

    fn send_absolute(&self, entity: u8, target: GimbalPosition) -> bool {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&target.pan.to_le_bytes());
        payload[4..8].copy_from_slice(&target.tilt.to_le_bytes());
        let rc = self.set_cur(entity, PANTILT_ABSOLUTE, &payload);
        debug!(
            "ptz: abs entity={} pan={} tilt={} rc={}",
            entity, target.pan, target.tilt, rc
        );
        rc >= 0
    }

    /// GET_MIN/GET_MAX for the absolute control. `None` when the device
    /// rejects the reads or reports a degenerate span.
    fn read_ranges(&self, entity: u8) -> Option<((i32, i32), (i32, i32))> {
        let min = self.get_range(entity, GET_MIN)?;
        let max = self.get_range(entity, GET_MAX)?;
        if min.0 >= max.0 || min.1 >= max.1 {
            return None;
        }
        Some(((min.0, max.0), (min.1, max.1)))
    }

    fn get_range(&self, entity: u8, request: u8) -> Option<(i32, i32)> {
        let mut buf = [0u8; 8];
        let rc = self.transport.control_transfer(
            REQ_TYPE_CLASS_IN,
            request,
            (PANTILT_ABSOLUTE as u16) << 8,
            self.ptz_index(entity),
            &mut buf,
            PTZ_TIMEOUT_MS,
        );
        if rc < 8 {
            return None;
        }
        let pan = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let tilt = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some((pan, tilt))
    }

    fn set_cur(&self, entity: u8, selector: u8, payload: &[u8]) -> i32 {
        let mut data = payload.to_vec();
        self.transport.control_transfer(
            REQ_TYPE_CLASS_OUT,
            SET_CUR,
            (selector as u16) << 8,
            self.ptz_index(entity),
            &mut data,
            PTZ_TIMEOUT_MS,
        )
    }

    fn ptz_index(&self, entity: u8) -> u16 {
        ((entity as u16) << 8) | self.vc_interface as u16
    }
}

fn sign(v: f32) -> i32 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

fn lerp_span(value: i32, from: (i32, i32), to: (i32, i32)) -> i32 {
    let t = (value - from.0) as f64 / (from.1 - from.0) as f64;
    (to.0 as f64 + t * (to.1 - to.0) as f64).round() as i32
}

fn relative_payload(pan: f32, tilt: f32, duration_ms: u32) -> [u8; 4] {
    let speed = |v: f32| -> u8 {
        let scaled = 1.0 + v.abs() * 6.0 * (duration_ms as f32 / 200.0).clamp(0.5, 2.0);
        (scaled.round() as i64).clamp(1, 7) as u8
    };
    let dir = |v: f32| -> u8 {
        if v > 0.0 {
            0x01
        } else if v < 0.0 {
            0xFF
        } else {
            0x00
        }
    };
    [dir(pan), speed(pan), dir(tilt), speed(tilt)]
}

fn zoom_payload(z: f32) -> [u8; 3] {
    let direction = if z > 0.0 { 0x01 } else { 0xFF };
    let speed = (1.0 + z.abs() * 7.0).round().clamp(1.0, 255.0) as u8;
    [direction, 0, speed]
}
