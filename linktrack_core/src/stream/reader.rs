//! Video stream reader worker.
//!
//! One thread per active stream. It reads UVC payload packets off the
//! negotiated IN endpoint, strips payload headers, assembles frames, and
//! drops each completed frame into a single-slot mailbox where the control
//! tick picks it up. Throughput counters go out as 1 Hz stream events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::events::{EventSink, TrackerEvent};
use crate::transport::{EndpointDesc, UsbTransport};

/// Latest-frame mailbox: the producer overwrites, the consumer takes.
/// A slow consumer sees the newest frame and never a backlog.
#[derive(Default)]
pub struct FrameMailbox {
    slot: Mutex<Option<Vec<u8>>>,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Vec<u8>) {
        *self.slot.lock() = Some(frame);
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.slot.lock().take()
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Per-read buffer size; large enough for several bulk packets
    pub read_len: usize,
    /// Blocking bulk read timeout
    pub bulk_timeout_ms: u32,
    /// Consecutive failed bulk reads before the permanent switch to
    /// request/completion mode
    pub max_bulk_timeouts: u32,
    /// Stream-stats publish interval
    pub stats_interval: Duration,
    /// Bounded wait for the worker thread on stop
    pub join_wait: Duration,
    /// Upper bound on an assembling frame; larger means a lost EOF bit
    pub max_frame_len: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_len: 16 * 1024,
            bulk_timeout_ms: 1000,
            max_bulk_timeouts: 5,
            stats_interval: Duration::from_secs(1),
            join_wait: Duration::from_millis(300),
            max_frame_len: 4 * 1024 * 1024,
        }
    }
}

/// Split one UVC payload packet into its payload slice and end-of-frame
/// flag. Returns `None` for packets with a nonsensical header length.
pub fn split_payload(packet: &[u8]) -> Option<(&[u8], bool)> {
    let header_len = *packet.first()? as usize;
    if header_len < 2 || header_len > packet.len() {
        return None;
    }
    let eof = packet[1] & 0x02 != 0;
    Some((&packet[header_len..], eof))
}

/// Handle to a running stream reader thread
pub struct StreamReader {
    running: Arc<AtomicBool>,
    request_mode: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    join_wait: Duration,
}

impl StreamReader {
    pub fn spawn(
        transport: Arc<dyn UsbTransport>,
        endpoint: EndpointDesc,
        mailbox: Arc<FrameMailbox>,
        sink: Arc<dyn EventSink>,
        config: ReaderConfig,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let request_mode = Arc::new(AtomicBool::new(false));
        let join_wait = config.join_wait;
        let worker = Worker {
            transport,
            endpoint,
            mailbox,
            sink,
            config,
            running: running.clone(),
            request_mode: request_mode.clone(),
        };
        let handle = thread::Builder::new()
            .name("lt-stream-reader".into())
            .spawn(move || worker.run())
            .ok();
        if handle.is_none() {
            warn!("stream: reader thread failed to spawn");
            running.store(false, Ordering::SeqCst);
        }
        Self {
            running,
            request_mode,
            handle,
            join_wait,
        }
    }

    /// True once the worker has given up on blocking bulk reads
    pub fn is_request_mode(&self) -> bool {
        self.request_mode.load(Ordering::SeqCst)
    }

    /// Signal the worker and wait up to the configured bound. A worker
    /// stuck in a blocking transfer is abandoned to finish on its own.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + self.join_wait;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            debug!("stream: reader still in transfer at stop, detaching");
        }
    }
}

struct Worker {
    transport: Arc<dyn UsbTransport>,
    endpoint: EndpointDesc,
    mailbox: Arc<FrameMailbox>,
    sink: Arc<dyn EventSink>,
    config: ReaderConfig,
    running: Arc<AtomicBool>,
    request_mode: Arc<AtomicBool>,
}

#[derive(Default)]
struct Counters {
    packets: u64,
    bytes: u64,
    payload_bytes: u64,
    frames: u64,
}

impl Worker {
    fn run(&self) {
        let mut buf = vec![0u8; self.config.read_len];
        let mut assembling: Vec<u8> = Vec::new();
        let mut counters = Counters::default();
        let mut consecutive_failures = 0u32;
        let mut window_start = Instant::now();

        info!(
            "stream: reader up, endpoint 0x{:02X} ({:?})",
            self.endpoint.address, self.endpoint.kind
        );
        while self.running.load(Ordering::SeqCst) {
            let rc = self.read(&mut buf);
            if rc > 0 {
                consecutive_failures = 0;
                let packet = &buf[..rc as usize];
                counters.packets += 1;
                counters.bytes += packet.len() as u64;

                if let Some((payload, eof)) = split_payload(packet) {
                    counters.payload_bytes += payload.len() as u64;
                    assembling.extend_from_slice(payload);
                    if assembling.len() > self.config.max_frame_len {
                        warn!("stream: frame exceeded {} bytes, dropping", assembling.len());
                        assembling.clear();
                    } else if eof && !assembling.is_empty() {
                        counters.frames += 1;
                        self.mailbox.publish(std::mem::take(&mut assembling));
                    }
                }
            } else {
                if !self.request_mode.load(Ordering::SeqCst) {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_bulk_timeouts {
                        // One-way switch: some endpoints silently stop
                        // answering plain bulk reads but still complete
                        // queued requests
                        info!(
                            "stream: {} consecutive bulk timeouts, switching to request mode",
                            consecutive_failures
                        );
                        self.request_mode.store(true, Ordering::SeqCst);
                    }
                }
                thread::sleep(Duration::from_millis(5));
            }

            // Reports fire on the interval whether or not anything arrived;
            // a stalled stream shows up as zero-count windows, not silence.
            let elapsed = window_start.elapsed();
            if elapsed >= self.config.stats_interval {
                let kbps = (counters.bytes as f64 * 8.0 / 1000.0) / elapsed.as_secs_f64();
                self.sink.publish(TrackerEvent::Stream {
                    packets: counters.packets,
                    bytes: counters.bytes,
                    payload_bytes: counters.payload_bytes,
                    frames: counters.frames,
                    kbps,
                });
                counters = Counters::default();
                window_start = Instant::now();
            }
        }
        debug!("stream: reader down");
    }

    fn read(&self, buf: &mut [u8]) -> i32 {
        if self.request_mode.load(Ordering::SeqCst) {
            if !self.transport.submit_read(self.endpoint.address, buf.len()) {
                return -1;
            }
            self.transport
                .wait_read(buf, self.config.bulk_timeout_ms)
        } else {
            self.transport
                .bulk_transfer(self.endpoint.address, buf, self.config.bulk_timeout_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, NullSink};
    use crate::testing::{BulkStep, MockTransport};
    use crate::transport::{Direction, TransferKind};

    fn test_endpoint() -> EndpointDesc {
        EndpointDesc {
            address: 0x81,
            direction: Direction::In,
            kind: TransferKind::Bulk,
            max_packet_size: 512,
        }
    }

    fn packet(header_flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![2, header_flags];
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn test_split_payload_strips_header() {
        let p = packet(0x02, b"abc");
        let (payload, eof) = split_payload(&p).unwrap();
        assert_eq!(payload, b"abc");
        assert!(eof);
    }

    #[test]
    fn test_split_payload_rejects_bad_header_len() {
        assert!(split_payload(&[]).is_none());
        assert!(split_payload(&[0, 0]).is_none());
        // Header claims more bytes than the packet holds
        assert!(split_payload(&[10, 0, 1]).is_none());
    }

    #[test]
    fn test_reader_assembles_frames_across_packets() {
        let transport = Arc::new(MockTransport::new());
        transport.push_bulk(BulkStep::Data(packet(0x00, b"hello ")));
        transport.push_bulk(BulkStep::Data(packet(0x02, b"world")));
        let mailbox = Arc::new(FrameMailbox::new());
        let reader = StreamReader::spawn(
            transport,
            test_endpoint(),
            mailbox.clone(),
            Arc::new(NullSink),
            ReaderConfig::default(),
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        let frame = loop {
            if let Some(frame) = mailbox.take() {
                break frame;
            }
            assert!(Instant::now() < deadline, "no frame assembled");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(frame, b"hello world");
        reader.stop();
    }

    #[test]
    fn test_bulk_timeouts_trigger_permanent_request_mode() {
        let transport = Arc::new(MockTransport::new());
        // No queued data: every read fails immediately
        let mailbox = Arc::new(FrameMailbox::new());
        let reader = StreamReader::spawn(
            transport,
            test_endpoint(),
            mailbox,
            Arc::new(NullSink),
            ReaderConfig::default(),
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        while !reader.is_request_mode() {
            assert!(Instant::now() < deadline, "never switched to request mode");
            thread::sleep(Duration::from_millis(5));
        }
        reader.stop();
    }

    fn fast_stats_config() -> ReaderConfig {
        ReaderConfig {
            stats_interval: Duration::from_millis(50),
            ..ReaderConfig::default()
        }
    }

    #[test]
    fn test_stream_stats_count_per_window_not_cumulative() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..3 {
            transport.push_bulk(BulkStep::Data(packet(0x00, b"abc")));
        }
        let (sink, events) = ChannelSink::new();
        let reader = StreamReader::spawn(
            transport.clone(),
            test_endpoint(),
            Arc::new(FrameMailbox::new()),
            Arc::new(sink),
            fast_stats_config(),
        );
        thread::sleep(Duration::from_millis(120));
        for _ in 0..2 {
            transport.push_bulk(BulkStep::Data(packet(0x00, b"abc")));
        }
        thread::sleep(Duration::from_millis(120));
        reader.stop();

        let reports: Vec<u64> = events
            .try_iter()
            .filter_map(|e| match e {
                TrackerEvent::Stream { packets, .. } => Some(packets),
                _ => None,
            })
            .collect();
        assert!(reports.len() >= 2, "expected multiple reports: {:?}", reports);
        // Each window counts only its own packets; a running total would
        // put all five in the last report
        assert!(reports.iter().all(|&p| p <= 3), "reports {:?}", reports);
        assert_eq!(reports.iter().sum::<u64>(), 5);
    }

    #[test]
    fn test_stalled_stream_still_reports_zero_windows() {
        let transport = Arc::new(MockTransport::new());
        let (sink, events) = ChannelSink::new();
        let reader = StreamReader::spawn(
            transport,
            test_endpoint(),
            Arc::new(FrameMailbox::new()),
            Arc::new(sink),
            fast_stats_config(),
        );
        thread::sleep(Duration::from_millis(150));
        reader.stop();
        assert!(events.try_iter().any(|e| matches!(
            e,
            TrackerEvent::Stream { packets: 0, .. }
        )));
    }

    #[test]
    fn test_mailbox_overwrites_and_clears_on_take() {
        let mailbox = FrameMailbox::new();
        mailbox.publish(vec![1]);
        mailbox.publish(vec![2]);
        assert_eq!(mailbox.take(), Some(vec![2]));
        assert_eq!(mailbox.take(), None);
    }
}
