//! Tracking state machine.
//!
//! One tick per control period: the caller hands in the newest decoded
//! detection (or none) plus the tick timestamp, and the controller drives
//! the PTZ transport. Timestamps are injected rather than sampled so the
//! whole machine runs deterministically under test.

use std::time::{Duration, Instant};

use linktrack_core::PtzDrive;
use log::{debug, info};

use super::pid::{AxisPid, PidGains};
use crate::detect::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Idle,
    Acquiring,
    Tracking,
    /// Brief detector dropout: keep commanding from the remembered center
    Coasting,
    /// Sweeping for a target after a sustained loss
    Patrolling,
    /// Waiting out a stream reinitialization
    Recovering,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Detections below this area are noise
    pub min_area: f32,
    /// How long after the last detection coasting keeps commanding
    pub coast_window: Duration,
    /// Per-tick decay of the remembered center toward image center
    pub coast_decay: f32,
    /// Detection gap that starts a patrol
    pub patrol_after: Duration,
    /// Normalized pan step per patrol command
    pub patrol_step: f32,
    /// Absolute pan (device units) at which the sweep reverses
    pub patrol_reverse_pan: i32,
    /// Absolute tilt (device units) beyond which patrol nudges home
    pub patrol_tilt_limit: i32,
    pub patrol_tilt_step: f32,
    pub patrol_interval: Duration,
    /// Minimum spacing between physical PTZ sends
    pub min_send_spacing: Duration,
    pub pan_clamp: f32,
    pub tilt_clamp: f32,
    /// A detection static for this long while small is a false positive
    pub static_window: Duration,
    pub static_max_area: f32,
    pub static_motion_eps: f32,
    /// Fallback dt for the first tick
    pub default_dt: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_area: 0.02,
            coast_window: Duration::from_millis(900),
            coast_decay: 0.005,
            patrol_after: Duration::from_millis(1200),
            patrol_step: 0.34,
            patrol_reverse_pan: 480_000,
            patrol_tilt_limit: 50_000,
            patrol_tilt_step: 0.2,
            patrol_interval: Duration::from_millis(420),
            min_send_spacing: Duration::from_millis(220),
            pan_clamp: 0.60,
            tilt_clamp: 0.45,
            static_window: Duration::from_millis(1800),
            static_max_area: 0.08,
            static_motion_eps: 0.01,
            default_dt: 0.18,
        }
    }
}

/// What one tick did, for telemetry
#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub state: TrackingState,
    pub pan: f32,
    pub tilt: f32,
    pub patrol: bool,
    pub face: Option<Detection>,
}

pub struct TrackingController {
    config: TrackerConfig,
    state: TrackingState,
    pan_pid: AxisPid,
    tilt_pid: AxisPid,
    /// Last accepted face center, decayed while coasting
    remembered: Option<(f32, f32)>,
    last_seen: Option<Instant>,
    /// When Acquiring began; gap basis before anything was ever seen
    watch_start: Option<Instant>,
    last_send: Option<Instant>,
    last_tick: Option<Instant>,
    patrol_dir: f32,
    last_patrol: Option<Instant>,
    last_box: Option<Detection>,
    static_since: Option<Instant>,
}

impl TrackingController {
    pub fn new(config: TrackerConfig, pan_gains: PidGains, tilt_gains: PidGains) -> Self {
        Self {
            config,
            state: TrackingState::Idle,
            pan_pid: AxisPid::new(pan_gains),
            tilt_pid: AxisPid::new(tilt_gains),
            remembered: None,
            last_seen: None,
            watch_start: None,
            last_send: None,
            last_tick: None,
            patrol_dir: 1.0,
            last_patrol: None,
            last_box: None,
            static_since: None,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn pan_pid(&self) -> &AxisPid {
        &self.pan_pid
    }

    pub fn tilt_pid(&self) -> &AxisPid {
        &self.tilt_pid
    }

    /// One snapshot per tick; the service passes both axes together so a
    /// concurrent gain update cannot tear across them.
    pub fn set_gains(&mut self, pan: PidGains, tilt: PidGains) {
        self.pan_pid.set_gains(pan);
        self.tilt_pid.set_gains(tilt);
    }

    pub fn start(&mut self, now: Instant) {
        info!("tracker: acquiring");
        self.state = TrackingState::Acquiring;
        self.pan_pid.reset();
        self.tilt_pid.reset();
        self.remembered = None;
        self.last_seen = None;
        self.watch_start = Some(now);
        self.last_send = None;
        self.last_tick = None;
        self.patrol_dir = 1.0;
        self.last_patrol = None;
        self.last_box = None;
        self.static_since = None;
    }

    pub fn stop(&mut self) {
        info!("tracker: stopped");
        self.state = TrackingState::Idle;
        self.pan_pid.reset();
        self.tilt_pid.reset();
    }

    /// Health monitor verdict: stream is degenerate, stop commanding until
    /// the session has been rebuilt.
    pub fn on_stream_degenerate(&mut self) {
        info!("tracker: degenerate stream, entering recovery");
        self.state = TrackingState::Recovering;
        self.pan_pid.reset();
        self.tilt_pid.reset();
    }

    /// Reinit sequence finished (well or badly); resume from scratch
    pub fn on_recovered(&mut self, now: Instant) {
        if self.state == TrackingState::Recovering {
            self.state = TrackingState::Acquiring;
            self.watch_start = Some(now);
            self.last_seen = None;
            self.remembered = None;
        }
    }

    pub fn tick(
        &mut self,
        detection: Option<Detection>,
        now: Instant,
        ptz: &mut PtzDrive,
    ) -> TickReport {
        if matches!(self.state, TrackingState::Idle | TrackingState::Recovering) {
            return self.report(0.0, 0.0, None);
        }
        let dt = match self.last_tick.replace(now) {
            Some(last) => now.duration_since(last).as_secs_f32(),
            None => self.config.default_dt,
        };

        match self.gate(detection, now) {
            Some(face) => {
                self.last_seen = Some(now);
                self.remembered = Some(face.center());
                if self.state != TrackingState::Tracking {
                    // Patrol-era (and acquisition-era) control history must
                    // not leak into live tracking
                    if matches!(
                        self.state,
                        TrackingState::Patrolling | TrackingState::Acquiring
                    ) {
                        self.pan_pid.reset();
                        self.tilt_pid.reset();
                    }
                    info!("tracker: target locked, area {:.3}", face.area());
                    self.state = TrackingState::Tracking;
                }
                let (pan, tilt) = self.drive(now, dt, ptz);
                self.report(pan, tilt, Some(face))
            }
            None => self.tick_absent(now, dt, ptz),
        }
    }

    fn tick_absent(&mut self, now: Instant, dt: f32, ptz: &mut PtzDrive) -> TickReport {
        let basis = self.last_seen.or(self.watch_start);
        let gap = basis.map(|t| now.duration_since(t)).unwrap_or_default();

        if matches!(self.state, TrackingState::Tracking | TrackingState::Coasting) {
            if gap <= self.config.coast_window {
                if self.state == TrackingState::Tracking {
                    debug!("tracker: coasting");
                    self.state = TrackingState::Coasting;
                }
                if let Some((cx, cy)) = self.remembered {
                    self.remembered = Some((
                        cx + (0.5 - cx) * self.config.coast_decay,
                        cy + (0.5 - cy) * self.config.coast_decay,
                    ));
                }
                let (pan, tilt) = self.drive(now, dt, ptz);
                return self.report(pan, tilt, None);
            }
            if gap < self.config.patrol_after {
                // Coast window over, patrol not yet due: hold position
                return self.report(0.0, 0.0, None);
            }
        }
        if gap >= self.config.patrol_after {
            if self.state != TrackingState::Patrolling {
                info!("tracker: target lost for {:?}, patrolling", gap);
                self.state = TrackingState::Patrolling;
            }
            let (pan, tilt) = self.patrol(now, ptz);
            return self.report(pan, tilt, None);
        }
        self.report(0.0, 0.0, None)
    }

    /// PID step on the remembered center plus the rate-limited send
    fn drive(&mut self, now: Instant, dt: f32, ptz: &mut PtzDrive) -> (f32, f32) {
        let Some((cx, cy)) = self.remembered else {
            return (0.0, 0.0);
        };
        let pan = self.pan_pid.update(cx - 0.5, dt, self.config.pan_clamp);
        let tilt = self.tilt_pid.update(cy - 0.5, dt, self.config.tilt_clamp);
        let due = self
            .last_send
            .map_or(true, |t| now.duration_since(t) >= self.config.min_send_spacing);
        if due && (pan != 0.0 || tilt != 0.0) {
            ptz.move_relative(pan, tilt, 120, false);
            self.last_send = Some(now);
        }
        (pan, tilt)
    }

    /// One throttled sweep step: pan in the current direction, reversing
    /// at the sweep limits, with a tilt nudge home when tilt has drifted.
    fn patrol(&mut self, now: Instant, ptz: &mut PtzDrive) -> (f32, f32) {
        let due = self
            .last_patrol
            .map_or(true, |t| now.duration_since(t) >= self.config.patrol_interval);
        if !due {
            return (0.0, 0.0);
        }
        let pos = ptz.position();
        if pos.pan >= self.config.patrol_reverse_pan {
            self.patrol_dir = -1.0;
        } else if pos.pan <= -self.config.patrol_reverse_pan {
            self.patrol_dir = 1.0;
        }
        let pan = self.config.patrol_step * self.patrol_dir;
        let tilt = if pos.tilt > self.config.patrol_tilt_limit {
            -self.config.patrol_tilt_step
        } else if pos.tilt < -self.config.patrol_tilt_limit {
            self.config.patrol_tilt_step
        } else {
            0.0
        };
        ptz.move_relative(pan, tilt, 150, false);
        self.last_patrol = Some(now);
        (pan, tilt)
    }

    /// Area gate plus static-small suppression. A high-score box that has
    /// not moved for a long time while staying small is a poster or a
    /// pattern on the wall, not a face.
    fn gate(&mut self, detection: Option<Detection>, now: Instant) -> Option<Detection> {
        let det = detection?;
        if det.area() < self.config.min_area {
            return None;
        }
        let moved = match self.last_box {
            Some(prev) => {
                let (cx, cy) = det.center();
                let (px, py) = prev.center();
                (cx - px).abs() > self.config.static_motion_eps
                    || (cy - py).abs() > self.config.static_motion_eps
                    || (det.w - prev.w).abs() > self.config.static_motion_eps
            }
            None => true,
        };
        self.last_box = Some(det);
        if moved {
            self.static_since = Some(now);
            return Some(det);
        }
        let since = *self.static_since.get_or_insert(now);
        if now.duration_since(since) >= self.config.static_window
            && det.area() < self.config.static_max_area
        {
            debug!("tracker: suppressing static small detection");
            return None;
        }
        Some(det)
    }

    fn report(&self, pan: f32, tilt: f32, face: Option<Detection>) -> TickReport {
        TickReport {
            state: self.state,
            pan,
            tilt,
            patrol: self.state == TrackingState::Patrolling,
            face,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linktrack_core::testing::MockTransport;
    use linktrack_core::uvc::PANTILT_ABSOLUTE;
    use std::sync::Arc;

    fn test_ptz() -> (Arc<MockTransport>, PtzDrive) {
        let transport = Arc::new(MockTransport::new());
        transport.accept_absolute(1);
        let ptz = PtzDrive::new(transport.clone(), 0, vec![1]);
        (transport, ptz)
    }

    fn controller() -> TrackingController {
        TrackingController::new(
            TrackerConfig::default(),
            PidGains::default(),
            PidGains::default(),
        )
    }

    fn face_at(cx: f32, cy: f32, side: f32) -> Detection {
        Detection {
            x: cx - side / 2.0,
            y: cy - side / 2.0,
            w: side,
            h: side,
            score: 0.9,
        }
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_idle_until_started() {
        let (_, mut ptz) = test_ptz();
        let mut tracker = controller();
        let report = tracker.tick(Some(face_at(0.5, 0.5, 0.2)), Instant::now(), &mut ptz);
        assert_eq!(report.state, TrackingState::Idle);
    }

    #[test]
    fn test_acquire_needs_minimum_area() {
        let (_, mut ptz) = test_ptz();
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        let report = tracker.tick(Some(face_at(0.5, 0.5, 0.1)), at(base, 180), &mut ptz);
        assert_eq!(report.state, TrackingState::Acquiring);
        let report = tracker.tick(Some(face_at(0.5, 0.5, 0.2)), at(base, 360), &mut ptz);
        assert_eq!(report.state, TrackingState::Tracking);
    }

    #[test]
    fn test_centered_target_converges_to_zero_command() {
        let (_, mut ptz) = test_ptz();
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        let mut report = tracker.tick(None, base, &mut ptz);
        for i in 1..=10 {
            report = tracker.tick(Some(face_at(0.5, 0.5, 0.2)), at(base, i * 180), &mut ptz);
        }
        assert_eq!(report.state, TrackingState::Tracking);
        assert_eq!(report.pan, 0.0);
        assert_eq!(report.tilt, 0.0);
    }

    #[test]
    fn test_brief_dropout_coasts_then_holds() {
        let (_, mut ptz) = test_ptz();
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        tracker.tick(Some(face_at(0.7, 0.5, 0.2)), base, &mut ptz);
        let report = tracker.tick(None, at(base, 400), &mut ptz);
        assert_eq!(report.state, TrackingState::Coasting);
        // Past the coast window but before patrol: hold still
        let report = tracker.tick(None, at(base, 1000), &mut ptz);
        assert_eq!(report.pan, 0.0);
        assert_eq!(report.state, TrackingState::Coasting);
    }

    #[test]
    fn test_sustained_loss_patrols_and_redetection_resets() {
        let (transport, mut ptz) = test_ptz();
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        tracker.tick(Some(face_at(0.7, 0.5, 0.2)), base, &mut ptz);
        let report = tracker.tick(None, at(base, 1300), &mut ptz);
        assert_eq!(report.state, TrackingState::Patrolling);
        assert!(report.patrol);
        assert!((report.pan - 0.34).abs() < 1e-6);
        assert!(!transport.sent_with_selector(PANTILT_ABSOLUTE).is_empty());

        // Second patrol command respects the throttle
        let report = tracker.tick(None, at(base, 1400), &mut ptz);
        assert_eq!(report.pan, 0.0);
        let report = tracker.tick(None, at(base, 1800), &mut ptz);
        assert!((report.pan - 0.34).abs() < 1e-6);

        // Redetection snaps back to tracking with clean control state
        let report = tracker.tick(Some(face_at(0.5, 0.5, 0.2)), at(base, 2000), &mut ptz);
        assert_eq!(report.state, TrackingState::Tracking);
        assert_eq!(tracker.pan_pid().integral(), 0.0);
        assert_eq!(tracker.pan_pid().filtered(), 0.0);
    }

    #[test]
    fn test_patrol_reverses_at_pan_limit() {
        let (transport, mut ptz) = test_ptz();
        // Park the gimbal past the sweep limit
        for _ in 0..10 {
            ptz.move_relative(1.0, 0.0, 200, false);
        }
        assert!(ptz.position().pan >= 480_000);
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        let report = tracker.tick(None, at(base, 1300), &mut ptz);
        assert_eq!(report.state, TrackingState::Patrolling);
        assert!((report.pan + 0.34).abs() < 1e-6);
        drop(transport);
    }

    #[test]
    fn test_static_small_detection_suppressed() {
        let (_, mut ptz) = test_ptz();
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        // Same small box, never moving, for over 1.8s
        let same = face_at(0.6, 0.5, 0.2); // area 0.04 < 0.08
        let mut report = tracker.tick(Some(same), base, &mut ptz);
        assert_eq!(report.state, TrackingState::Tracking);
        for i in 1..=10 {
            report = tracker.tick(Some(same), at(base, i * 200), &mut ptz);
        }
        // Suppression treats it as absent: tracking has fallen away
        assert_ne!(report.state, TrackingState::Tracking);
    }

    #[test]
    fn test_moving_small_detection_not_suppressed() {
        let (_, mut ptz) = test_ptz();
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        let mut report = tracker.tick(Some(face_at(0.6, 0.5, 0.2)), base, &mut ptz);
        for i in 1..=10 {
            let cx = 0.6 + 0.02 * (i % 2) as f32;
            report = tracker.tick(Some(face_at(cx, 0.5, 0.2)), at(base, i * 200), &mut ptz);
        }
        assert_eq!(report.state, TrackingState::Tracking);
    }

    #[test]
    fn test_send_spacing_throttles_transfers() {
        let (transport, mut ptz) = test_ptz();
        let mut tracker = TrackingController::new(
            TrackerConfig::default(),
            PidGains {
                kp: 1.0,
                ki: 0.0,
                kd: 0.0,
            },
            PidGains::default(),
        );
        let base = Instant::now();
        tracker.start(base);
        // 11 ticks at 100ms with a hard-right target; sends allowed at
        // 0, 300, 600, 900 only
        for i in 0..=10 {
            tracker.tick(Some(face_at(0.9, 0.5, 0.2)), at(base, i * 100), &mut ptz);
        }
        let sends = transport
            .sent_with_selector(PANTILT_ABSOLUTE)
            .into_iter()
            .filter(|r| r.request == linktrack_core::transport::SET_CUR)
            .count();
        assert_eq!(sends, 4);
    }

    #[test]
    fn test_recovery_pauses_and_reacquires() {
        let (_, mut ptz) = test_ptz();
        let mut tracker = controller();
        let base = Instant::now();
        tracker.start(base);
        tracker.tick(Some(face_at(0.5, 0.5, 0.2)), base, &mut ptz);
        tracker.on_stream_degenerate();
        let report = tracker.tick(Some(face_at(0.5, 0.5, 0.2)), at(base, 200), &mut ptz);
        assert_eq!(report.state, TrackingState::Recovering);
        tracker.on_recovered(at(base, 400));
        let report = tracker.tick(Some(face_at(0.5, 0.5, 0.2)), at(base, 600), &mut ptz);
        assert_eq!(report.state, TrackingState::Tracking);
    }
}
