//! Single-axis PID with output filtering.

use serde::{Deserialize, Serialize};

/// Per-axis gains, updatable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.015,
            ki: 0.0,
            kd: 0.004,
        }
    }
}

/// Low-pass coefficients for the command output. Heavy smoothing: the
/// gimbal resonates on step inputs.
const LOWPASS_KEEP: f32 = 0.72;
const LOWPASS_BLEND: f32 = 0.28;

/// Commands below this become exactly zero, not merely small; tiny
/// commands make the gimbal hunt around center
const OUTPUT_DEADZONE: f32 = 0.05;

const INTEGRAL_CLAMP: f32 = 1.0;

/// One axis of the tracking loop: PID, output clamp, low-pass, deadzone
#[derive(Debug, Clone)]
pub struct AxisPid {
    gains: PidGains,
    integral: f32,
    last_error: Option<f32>,
    filtered: f32,
}

impl AxisPid {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: None,
            filtered: 0.0,
        }
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn filtered(&self) -> f32 {
        self.filtered
    }

    /// Step the controller. The sign flip turns an error toward the image
    /// edge into a command that re-centers the target.
    pub fn update(&mut self, error: f32, dt: f32, output_clamp: f32) -> f32 {
        let dt = dt.max(1e-3);
        self.integral = (self.integral + error * dt).clamp(-INTEGRAL_CLAMP, INTEGRAL_CLAMP);
        let derivative = match self.last_error {
            Some(last) => (error - last) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        let raw = -(self.gains.kp * error
            + self.gains.ki * self.integral
            + self.gains.kd * derivative);
        let clamped = raw.clamp(-output_clamp, output_clamp);
        self.filtered = self.filtered * LOWPASS_KEEP + clamped * LOWPASS_BLEND;
        if self.filtered.abs() < OUTPUT_DEADZONE {
            0.0
        } else {
            self.filtered
        }
    }

    /// Drop integral, derivative history and filter state
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.filtered = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_error_holds_zero_output() {
        let mut pid = AxisPid::new(PidGains::default());
        for _ in 0..20 {
            assert_eq!(pid.update(0.0, 0.18, 0.6), 0.0);
        }
    }

    #[test]
    fn test_output_opposes_error_sign() {
        let mut pid = AxisPid::new(PidGains {
            kp: 2.0,
            ki: 0.0,
            kd: 0.0,
        });
        let mut out = 0.0;
        for _ in 0..30 {
            out = pid.update(0.4, 0.18, 0.6);
        }
        assert!(out < 0.0);
    }

    #[test]
    fn test_output_clamped_per_axis() {
        let mut pid = AxisPid::new(PidGains {
            kp: 100.0,
            ki: 0.0,
            kd: 0.0,
        });
        let mut out = 0.0;
        for _ in 0..100 {
            out = pid.update(0.5, 0.18, 0.45);
        }
        assert!(out >= -0.45 - 1e-6);
    }

    #[test]
    fn test_integral_windup_clamped() {
        let mut pid = AxisPid::new(PidGains {
            kp: 0.0,
            ki: 1.0,
            kd: 0.0,
        });
        for _ in 0..1000 {
            pid.update(1.0, 0.18, 0.6);
        }
        assert!((pid.integral() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_deadzone_returns_exact_zero() {
        let mut pid = AxisPid::new(PidGains {
            kp: 0.02,
            ki: 0.0,
            kd: 0.0,
        });
        // kp*err = 0.004, far under the deadzone after filtering
        let out = pid.update(0.2, 0.18, 0.6);
        assert_eq!(out, 0.0);
        assert!(pid.filtered().abs() > 0.0);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut pid = AxisPid::new(PidGains::default());
        pid.update(0.5, 0.18, 0.6);
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.filtered(), 0.0);
    }
}
