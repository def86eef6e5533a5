//! Scripted USB transport for tests.
//!
//! [`MockTransport`] plays back descriptor bytes and canned control-transfer
//! results, records everything sent, and enforces the probe/commit verbatim
//! rule: a COMMIT whose payload differs from the last GET_CUR response is
//! rejected like a picky device would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LinkError, LinkResult};
use crate::transport::{
    Direction, EndpointDesc, InterfaceDesc, TransferKind, TransportProvider, UsbTransport,
    GET_CUR, GET_INFO, GET_MAX, GET_MIN, REQ_TYPE_CLASS_IN, REQ_TYPE_CLASS_OUT, SET_CUR,
};
use crate::uvc::{PANTILT_ABSOLUTE, PANTILT_RELATIVE, VS_COMMIT_CONTROL, VS_PROBE_CONTROL,
    ZOOM_RELATIVE};

/// One recorded control transfer
#[derive(Debug, Clone)]
pub struct ControlRecord {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

impl ControlRecord {
    /// Control selector (high byte of wValue)
    pub fn selector(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Entity id (high byte of wIndex)
    pub fn entity(&self) -> u8 {
        (self.index >> 8) as u8
    }
}

/// Scripted result of one bulk read
#[derive(Debug, Clone)]
pub enum BulkStep {
    Data(Vec<u8>),
    Timeout,
}

#[derive(Default)]
struct MockState {
    descriptors: Option<Vec<u8>>,
    interfaces: Vec<InterfaceDesc>,
    /// Probe/commit lengths the device rejects outright
    rejected_probe_lengths: HashSet<usize>,
    /// Interval the device clamps the probe to, if any
    clamped_interval: Option<u32>,
    /// Last GET_CUR(probe) response, for the verbatim-commit check
    last_probe_response: Option<Vec<u8>>,
    /// Entities accepting absolute pan/tilt SET_CUR
    abs_entities: HashSet<u8>,
    /// Entities accepting relative pan/tilt SET_CUR
    rel_entities: HashSet<u8>,
    /// Entities accepting relative zoom SET_CUR
    zoom_entities: HashSet<u8>,
    /// Pan/tilt GET_MIN/GET_MAX ranges per entity: (pan_min, pan_max, tilt_min, tilt_max)
    ranges: HashMap<u8, (i32, i32, i32, i32)>,
    /// Scripted bulk reads, consumed front to back
    bulk_steps: VecDeque<BulkStep>,
    /// Queued async reads, completed by `wait_read`
    pending_reads: VecDeque<usize>,
    sent: Vec<ControlRecord>,
    claimed: Vec<u8>,
    selected: Vec<(u8, u8)>,
}

/// Scripted in-memory transport
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_descriptors(&self, raw: Vec<u8>) {
        self.state.lock().descriptors = Some(raw);
    }

    pub fn set_interfaces(&self, interfaces: Vec<InterfaceDesc>) {
        self.state.lock().interfaces = interfaces;
    }

    /// Make the device reject every probe-phase transfer of this buffer length
    pub fn reject_probe_length(&self, len: usize) {
        self.state.lock().rejected_probe_lengths.insert(len);
    }

    /// Make the device clamp the probed frame interval to `interval`
    pub fn clamp_interval(&self, interval: u32) {
        self.state.lock().clamped_interval = Some(interval);
    }

    /// Accept absolute pan/tilt commands on `entity`
    pub fn accept_absolute(&self, entity: u8) {
        self.state.lock().abs_entities.insert(entity);
    }

    /// Accept relative pan/tilt commands on `entity`
    pub fn accept_relative(&self, entity: u8) {
        self.state.lock().rel_entities.insert(entity);
    }

    /// Accept relative zoom commands on `entity`
    pub fn accept_zoom(&self, entity: u8) {
        self.state.lock().zoom_entities.insert(entity);
    }

    /// Report a pan/tilt range from GET_MIN/GET_MAX on `entity`
    pub fn set_range(&self, entity: u8, pan: (i32, i32), tilt: (i32, i32)) {
        self.state
            .lock()
            .ranges
            .insert(entity, (pan.0, pan.1, tilt.0, tilt.1));
    }

    /// Append a scripted bulk-read result
    pub fn push_bulk(&self, step: BulkStep) {
        self.state.lock().bulk_steps.push_back(step);
    }

    /// All control transfers sent so far
    pub fn sent(&self) -> Vec<ControlRecord> {
        self.state.lock().sent.clone()
    }

    /// Interface ids claimed, in order
    pub fn claimed(&self) -> Vec<u8> {
        self.state.lock().claimed.clone()
    }

    /// `(interface, alternate)` selections, in order
    pub fn selected_alternates(&self) -> Vec<(u8, u8)> {
        self.state.lock().selected.clone()
    }

    /// Control transfers matching a selector, OUT direction only
    pub fn sent_with_selector(&self, selector: u8) -> Vec<ControlRecord> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|r| r.request_type == REQ_TYPE_CLASS_OUT && r.selector() == selector)
            .cloned()
            .collect()
    }

    /// Convenience: a streaming-capable interface table with one control
    /// alternate and one bulk IN streaming alternate.
    pub fn uvc_interface_table() -> Vec<InterfaceDesc> {
        vec![
            InterfaceDesc {
                id: 0,
                alternate: 0,
                class: crate::transport::CLASS_VIDEO,
                subclass: crate::transport::SUBCLASS_VIDEO_CONTROL,
                endpoints: Vec::new(),
            },
            InterfaceDesc {
                id: 1,
                alternate: 0,
                class: crate::transport::CLASS_VIDEO,
                subclass: crate::transport::SUBCLASS_VIDEO_STREAMING,
                endpoints: Vec::new(),
            },
            InterfaceDesc {
                id: 1,
                alternate: 1,
                class: crate::transport::CLASS_VIDEO,
                subclass: crate::transport::SUBCLASS_VIDEO_STREAMING,
                endpoints: vec![EndpointDesc {
                    address: 0x81,
                    direction: Direction::In,
                    kind: TransferKind::Bulk,
                    max_packet_size: 512,
                }],
            },
        ]
    }

    fn handle_in(&self, state: &mut MockState, record: &ControlRecord, data: &mut [u8]) -> i32 {
        let selector = record.selector();
        match record.request {
            GET_CUR if selector == VS_PROBE_CONTROL => {
                if state.rejected_probe_lengths.contains(&data.len()) {
                    return -1;
                }
                // Echo the host's proposal with device adjustments applied
                let mut response = state
                    .sent
                    .iter()
                    .rev()
                    .find(|r| {
                        r.request == SET_CUR
                            && r.selector() == VS_PROBE_CONTROL
                            && r.data.len() == data.len()
                    })
                    .map(|r| r.data.clone())
                    .unwrap_or_else(|| vec![0u8; data.len()]);
                if let Some(interval) = state.clamped_interval {
                    response[4..8].copy_from_slice(&interval.to_le_bytes());
                }
                if response.len() >= 26 {
                    // dwMaxPayloadTransferSize, filled in by the device
                    response[22..26].copy_from_slice(&16384u32.to_le_bytes());
                }
                data.copy_from_slice(&response);
                state.last_probe_response = Some(response);
                data.len() as i32
            }
            GET_INFO => {
                if data.is_empty() {
                    return -1;
                }
                data[0] = 0x03;
                1
            }
            GET_MIN | GET_MAX if selector == PANTILT_ABSOLUTE => {
                let entity = record.entity();
                let Some(&(pan_min, pan_max, tilt_min, tilt_max)) = state.ranges.get(&entity)
                else {
                    return -1;
                };
                if data.len() < 8 {
                    return -1;
                }
                let (pan, tilt) = if record.request == GET_MIN {
                    (pan_min, tilt_min)
                } else {
                    (pan_max, tilt_max)
                };
                data[0..4].copy_from_slice(&pan.to_le_bytes());
                data[4..8].copy_from_slice(&tilt.to_le_bytes());
                8
            }
            _ => -1,
        }
    }

    fn handle_out(&self, state: &mut MockState, record: &ControlRecord) -> i32 {
        let selector = record.selector();
        let len = record.data.len() as i32;
        match selector {
            VS_PROBE_CONTROL => {
                if state.rejected_probe_lengths.contains(&record.data.len()) {
                    -1
                } else {
                    len
                }
            }
            VS_COMMIT_CONTROL => {
                // A well-behaved host commits the GET_CUR buffer verbatim
                match &state.last_probe_response {
                    Some(expected) if expected.as_slice() == record.data.as_slice() => len,
                    _ => -1,
                }
            }
            PANTILT_ABSOLUTE => {
                if state.abs_entities.contains(&record.entity()) {
                    len
                } else {
                    -1
                }
            }
            PANTILT_RELATIVE => {
                if state.rel_entities.contains(&record.entity()) {
                    len
                } else {
                    -1
                }
            }
            ZOOM_RELATIVE => {
                if state.zoom_entities.contains(&record.entity()) {
                    len
                } else {
                    -1
                }
            }
            _ => -1,
        }
    }
}

impl UsbTransport for MockTransport {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> i32 {
        let mut state = self.state.lock();
        let record = ControlRecord {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        };
        let rc = if request_type == REQ_TYPE_CLASS_IN {
            self.handle_in(&mut state, &record, data)
        } else {
            self.handle_out(&mut state, &record)
        };
        state.sent.push(record);
        rc
    }

    fn bulk_transfer(&self, _endpoint: u8, buf: &mut [u8], _timeout_ms: u32) -> i32 {
        let mut state = self.state.lock();
        match state.bulk_steps.pop_front() {
            Some(BulkStep::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                n as i32
            }
            Some(BulkStep::Timeout) | None => -1,
        }
    }

    fn submit_read(&self, _endpoint: u8, len: usize) -> bool {
        self.state.lock().pending_reads.push_back(len);
        true
    }

    fn wait_read(&self, buf: &mut [u8], _timeout_ms: u32) -> i32 {
        let mut state = self.state.lock();
        if state.pending_reads.pop_front().is_none() {
            return -1;
        }
        match state.bulk_steps.pop_front() {
            Some(BulkStep::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                n as i32
            }
            Some(BulkStep::Timeout) | None => -1,
        }
    }

    fn raw_descriptors(&self) -> Option<Vec<u8>> {
        self.state.lock().descriptors.clone()
    }

    fn interfaces(&self) -> Vec<InterfaceDesc> {
        self.state.lock().interfaces.clone()
    }

    fn claim_interface(&self, id: u8) -> bool {
        self.state.lock().claimed.push(id);
        true
    }

    fn release_interface(&self, _id: u8) -> bool {
        true
    }

    fn select_alternate(&self, id: u8, alternate: u8) -> bool {
        self.state.lock().selected.push((id, alternate));
        true
    }
}

/// Provider handing out one pre-built mock device
pub struct MockProvider {
    vid: u16,
    pid: u16,
    transport: Arc<MockTransport>,
}

impl MockProvider {
    pub fn new(vid: u16, pid: u16, transport: Arc<MockTransport>) -> Self {
        Self {
            vid,
            pid,
            transport,
        }
    }
}

impl TransportProvider for MockProvider {
    fn open(&self, vid: u16, pid: u16) -> LinkResult<Arc<dyn UsbTransport>> {
        if vid == self.vid && pid == self.pid {
            Ok(self.transport.clone() as Arc<dyn UsbTransport>)
        } else {
            Err(LinkError::DeviceNotFound { vid, pid })
        }
    }

    fn list(&self) -> Vec<crate::transport::DeviceSummary> {
        let interfaces = self.transport.interfaces();
        vec![crate::transport::DeviceSummary {
            name: "mock gimbal".into(),
            vid: self.vid,
            pid: self.pid,
            device_class: 0,
            interface_count: interfaces.len(),
            is_uvc: crate::transport::is_likely_uvc(0, &interfaces),
        }]
    }
}
