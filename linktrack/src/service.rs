//! Tracker service: the command surface a UI or bridge drives.
//!
//! One service per process side. Commands may arrive from any thread;
//! everything mutable sits behind one lock, and the control tick takes
//! that lock for its whole body, which is what makes ticks single-flight:
//! a tick cannot overlap itself or any command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use linktrack_core::{
    DeviceSession, DeviceSummary, EventSink, FrameHealthMonitor, FrameMailbox, HealthConfig,
    LinkError, LinkResult, ReaderConfig, StateStatus, StreamReader, TrackerEvent,
    TransportProvider,
};
use log::{info, warn};
use parking_lot::Mutex;

use crate::detect::{decode, DecoderConfig, Detection, Detector, TargetPolicy};
use crate::tracking::{PidGains, TrackerConfig, TrackingController, TrackingState};

#[derive(Clone, Default)]
pub struct ServiceConfig {
    pub tick_interval: TickInterval,
    pub reader: ReaderConfig,
    pub decoder: DecoderConfig,
    pub tracker: TrackerConfig,
    pub health: HealthConfig,
}

/// Control tick cadence, independent of frame arrival rate. A zero
/// interval disables the periodic thread; the embedder then drives
/// [`TrackerService::tick_once`] from its own scheduler.
#[derive(Clone, Copy, Debug)]
pub struct TickInterval(pub Duration);

impl Default for TickInterval {
    fn default() -> Self {
        Self(Duration::from_millis(180))
    }
}

struct Inner {
    session: Option<DeviceSession>,
    reader: Option<StreamReader>,
    controller: TrackingController,
    detector: Option<Box<dyn Detector>>,
    health: FrameHealthMonitor,
    decoder: DecoderConfig,
    reader_config: ReaderConfig,
    tracking: bool,
    paused: bool,
    fps: f32,
    last_frame_at: Option<Instant>,
}

pub struct TrackerService {
    provider: Arc<dyn TransportProvider>,
    sink: Arc<dyn EventSink>,
    mailbox: Arc<FrameMailbox>,
    inner: Arc<Mutex<Inner>>,
    /// Gains live outside `Inner` so updates never contend with a tick;
    /// the tick copies both axes in one lock acquisition
    gains: Arc<Mutex<(PidGains, PidGains)>>,
    tick_interval: Duration,
    tick_running: Arc<AtomicBool>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TrackerService {
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        sink: Arc<dyn EventSink>,
        config: ServiceConfig,
    ) -> Self {
        let controller = TrackingController::new(
            config.tracker.clone(),
            PidGains::default(),
            PidGains::default(),
        );
        Self {
            provider,
            sink,
            mailbox: Arc::new(FrameMailbox::new()),
            inner: Arc::new(Mutex::new(Inner {
                session: None,
                reader: None,
                controller,
                detector: None,
                health: FrameHealthMonitor::new(config.health),
                decoder: config.decoder,
                reader_config: config.reader,
                tracking: false,
                paused: false,
                fps: 0.0,
                last_frame_at: None,
            })),
            gains: Arc::new(Mutex::new((PidGains::default(), PidGains::default()))),
            tick_interval: config.tick_interval.0,
            tick_running: Arc::new(AtomicBool::new(false)),
            tick_thread: Mutex::new(None),
        }
    }

    /// Install the inference collaborator. Without one, tracking cannot
    /// start but manual PTZ control still works.
    pub fn set_detector(&self, detector: Box<dyn Detector>) {
        self.inner.lock().detector = Some(detector);
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        self.provider.list()
    }

    pub fn connect(&self, vid: u16, pid: u16) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        if let Some(mut old) = inner.session.take() {
            old.close();
        }
        match DeviceSession::open(self.provider.as_ref(), vid, pid) {
            Ok(session) => {
                inner.session = Some(session);
                drop(inner);
                self.emit_state(StateStatus::Connected, format!("{:04x}:{:04x}", vid, pid));
                Ok(())
            }
            Err(err) => {
                drop(inner);
                self.emit_state(StateStatus::Error, err.to_string());
                Err(err)
            }
        }
    }

    /// Negotiate and start the stream reader
    pub fn activate_stream(&self) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        if let Some(reader) = inner.reader.take() {
            reader.stop();
        }
        let result = start_stream(&mut inner, &self.mailbox, &self.sink, false);
        drop(inner);
        match result {
            Ok((format_index, frame_index)) => {
                self.emit_state(
                    StateStatus::Connected,
                    format!("stream active fmt={} frame={}", format_index, frame_index),
                );
                Ok(())
            }
            Err(err) => {
                self.emit_state(StateStatus::Error, err.to_string());
                Err(err)
            }
        }
    }

    pub fn start_tracking(&self) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            drop(inner);
            self.emit_state(StateStatus::Error, "no device connected".into());
            return Err(LinkError::NoConnection);
        }
        if inner.detector.is_none() {
            drop(inner);
            self.emit_state(StateStatus::Error, "no detector model loaded".into());
            return Err(LinkError::NoDetectorModel(
                "install a detector before starting".into(),
            ));
        }
        inner.paused = false;
        if inner.controller.state() == TrackingState::Idle {
            inner.controller.start(Instant::now());
        }
        inner.tracking = true;
        drop(inner);
        self.ensure_tick_thread();
        self.emit_state(StateStatus::Running, "tracking started".into());
        Ok(())
    }

    pub fn stop_tracking(&self) {
        let mut inner = self.inner.lock();
        inner.tracking = false;
        inner.paused = false;
        inner.controller.stop();
        let connected = inner.session.is_some();
        drop(inner);
        let status = if connected {
            StateStatus::Connected
        } else {
            StateStatus::Ready
        };
        self.emit_state(status, "tracking stopped".into());
    }

    /// Keep tracker state but emit no commands until resumed
    pub fn pause_tracking(&self) {
        self.inner.lock().paused = true;
        self.emit_state(StateStatus::Connected, "tracking paused".into());
    }

    pub fn manual_move(&self, pan: f32, tilt: f32, duration_ms: u32) -> bool {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) => session.ptz_mut().move_relative(pan, tilt, duration_ms, false),
            None => false,
        }
    }

    pub fn manual_zoom(&self, zoom: f32, duration_ms: u32) -> bool {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) => session.ptz_mut().zoom(zoom, duration_ms),
            None => false,
        }
    }

    pub fn set_pid(&self, pan: PidGains, tilt: PidGains) {
        *self.gains.lock() = (pan, tilt);
    }

    pub fn set_target_policy(&self, policy: TargetPolicy) {
        self.inner.lock().decoder.policy = policy;
    }

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.tracking = false;
        inner.controller.stop();
        if let Some(reader) = inner.reader.take() {
            reader.stop();
        }
        if let Some(mut session) = inner.session.take() {
            session.close();
        }
        drop(inner);
        self.emit_state(StateStatus::Ready, "disconnected".into());
    }

    /// Run one control tick at an injected timestamp. The periodic thread
    /// calls the same path; tests call this directly with synthesized
    /// clocks.
    pub fn tick_once(&self, now: Instant) {
        run_tick(&self.inner, &self.gains, &self.mailbox, &self.sink, now);
    }

    fn ensure_tick_thread(&self) {
        if self.tick_interval.is_zero() {
            return;
        }
        let mut slot = self.tick_thread.lock();
        if slot.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        self.tick_running.store(true, Ordering::SeqCst);
        let running = self.tick_running.clone();
        let interval = self.tick_interval;
        let inner = self.inner.clone();
        let gains = self.gains.clone();
        let mailbox = self.mailbox.clone();
        let sink = self.sink.clone();
        *slot = thread::Builder::new()
            .name("lt-control-tick".into())
            .spawn(move || {
                info!("service: control tick up at {:?}", interval);
                while running.load(Ordering::SeqCst) {
                    let started = Instant::now();
                    run_tick(&inner, &gains, &mailbox, &sink, started);
                    let elapsed = started.elapsed();
                    if elapsed < interval {
                        thread::sleep(interval - elapsed);
                    }
                }
            })
            .ok();
    }

    /// Stop the tick thread and the reader; the session stays connected
    pub fn shutdown(&self) {
        self.tick_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.tick_thread.lock().take() {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock();
        if let Some(reader) = inner.reader.take() {
            reader.stop();
        }
    }

    fn emit_state(&self, status: StateStatus, message: String) {
        self.sink.publish(TrackerEvent::State { status, message });
    }
}

impl Drop for TrackerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Activate the session's stream and spawn a reader for it.
/// Returns the negotiated (format, frame) pair for the status event.
fn start_stream(
    inner: &mut Inner,
    mailbox: &Arc<FrameMailbox>,
    sink: &Arc<dyn EventSink>,
    reinit: bool,
) -> LinkResult<(u8, u8)> {
    let reader_config = inner.reader_config.clone();
    let session = inner.session.as_mut().ok_or(LinkError::NoConnection)?;
    let stream = if reinit {
        session.reactivate_stream()?
    } else {
        session.activate_stream()?
    };
    let endpoint = stream.endpoint;
    let params = stream.params;
    inner.reader = Some(StreamReader::spawn(
        session.transport(),
        endpoint,
        mailbox.clone(),
        sink.clone(),
        reader_config,
    ));
    Ok((params.format_index, params.frame_index))
}

/// The control tick body, shared by the periodic thread and `tick_once`
fn run_tick(
    inner: &Mutex<Inner>,
    gains: &Mutex<(PidGains, PidGains)>,
    mailbox: &Arc<FrameMailbox>,
    sink: &Arc<dyn EventSink>,
    now: Instant,
) {
    let mut guard = inner.lock();
    let inner = &mut *guard;
    if !inner.tracking || inner.paused {
        return;
    }
    let (pan_gains, tilt_gains) = *gains.lock();
    inner.controller.set_gains(pan_gains, tilt_gains);

    let mut detection: Option<Detection> = None;
    let mut latency_ms = 0.0f32;
    let mut degenerate = false;
    if let Some(frame) = mailbox.take() {
        if let Some(last) = inner.last_frame_at.replace(now) {
            let dt = now.duration_since(last).as_secs_f32();
            if dt > 0.0 {
                inner.fps = inner.fps * 0.8 + (1.0 / dt) * 0.2;
            }
        }
        if let Some(detector) = inner.detector.as_mut() {
            let started = Instant::now();
            match detector.run(&frame) {
                Ok(output) => {
                    latency_ms = started.elapsed().as_secs_f32() * 1000.0;
                    if inner.health.observe(&output.preview_rgb, now) {
                        degenerate = true;
                    } else {
                        detection = decode(&output.tensor, &output.shape, &inner.decoder);
                    }
                }
                Err(err) => {
                    warn!("service: inference failed: {}", err);
                    sink.publish(TrackerEvent::State {
                        status: StateStatus::Error,
                        message: err.to_string(),
                    });
                }
            }
        }
    }
    if degenerate {
        recover(inner, mailbox, sink, now);
        return;
    }

    let Some(session) = inner.session.as_mut() else {
        return;
    };
    let report = inner.controller.tick(detection, now, session.ptz_mut());
    if let Some(face) = report.face {
        sink.publish(TrackerEvent::Face {
            x: face.x,
            y: face.y,
            w: face.w,
            h: face.h,
            score: face.score,
        });
    }
    sink.publish(TrackerEvent::Telemetry {
        fps: inner.fps,
        latency_ms,
        pan: report.pan,
        tilt: report.tilt,
        patrol: report.patrol,
    });
}

/// Full stream reinitialization after a degenerate-stream verdict.
/// Best effort: tracking resumes from Acquiring whether or not the
/// rebuild worked.
fn recover(inner: &mut Inner, mailbox: &Arc<FrameMailbox>, sink: &Arc<dyn EventSink>, now: Instant) {
    inner.controller.on_stream_degenerate();
    sink.publish(TrackerEvent::State {
        status: StateStatus::Error,
        message: "stream degenerate, reinitializing".into(),
    });
    if let Some(reader) = inner.reader.take() {
        reader.stop();
    }
    match start_stream(inner, mailbox, sink, true) {
        Ok(_) => info!("service: stream reinitialized"),
        Err(err) => warn!("service: stream reinit failed: {}", err),
    }
    inner.health.reset();
    inner.controller.on_recovered(now);
}
