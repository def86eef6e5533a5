//! Per-device session.
//!
//! One `DeviceSession` per connected camera: it owns the transport handle,
//! the parsed descriptor table, the PTZ drive, and whatever stream is
//! currently committed. Constructed on connect, dropped on disconnect; no
//! process-wide current-device state anywhere.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{LinkError, LinkResult};
use crate::transport::{EndpointDesc, InterfaceDesc, TransportProvider, UsbTransport};
use crate::uvc::descriptor::{parse_descriptors, ptz_entity_candidates, DescriptorEntry};
use crate::uvc::negotiate::{choose_stream_endpoint, probe_commit, select_stream, StreamParams};
use crate::uvc::ptz::PtzDrive;

/// A committed, endpoint-selected stream
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub params: StreamParams,
    /// Device-adjusted probe buffer as committed
    pub committed: Vec<u8>,
    /// Streaming alternate carrying the chosen endpoint
    pub interface: InterfaceDesc,
    pub endpoint: EndpointDesc,
}

pub struct DeviceSession {
    transport: Arc<dyn UsbTransport>,
    vid: u16,
    pid: u16,
    entries: Vec<DescriptorEntry>,
    vc_interface: u8,
    vs_interface: u8,
    stream: Option<ActiveStream>,
    ptz: PtzDrive,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("vid", &self.vid)
            .field("pid", &self.pid)
            .field("vc_interface", &self.vc_interface)
            .field("vs_interface", &self.vs_interface)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Open the device and build a fresh session. The gimbal position
    /// starts at `(0,0)`; nothing carries over from previous sessions.
    pub fn open(provider: &dyn TransportProvider, vid: u16, pid: u16) -> LinkResult<Self> {
        let transport = provider.open(vid, pid)?;
        let interfaces = transport.interfaces();
        let vc_interface = interfaces
            .iter()
            .find(|i| i.is_video_control())
            .map(|i| i.id)
            .ok_or(LinkError::NoControlInterface)?;
        let vs_interface = interfaces
            .iter()
            .find(|i| i.is_video_streaming())
            .map(|i| i.id)
            .unwrap_or(vc_interface + 1);

        let entries = match transport.raw_descriptors() {
            Some(raw) => parse_descriptors(&raw),
            None => {
                warn!("session: no cached descriptors, falling back to defaults");
                Vec::new()
            }
        };
        let candidates = ptz_entity_candidates(&entries);
        info!(
            "session: {:04x}:{:04x} vc={} vs={} entries={} ptz candidates={:?}",
            vid,
            pid,
            vc_interface,
            vs_interface,
            entries.len(),
            candidates
        );
        let ptz = PtzDrive::new(transport.clone(), vc_interface, candidates);
        Ok(Self {
            transport,
            vid,
            pid,
            entries,
            vc_interface,
            vs_interface,
            stream: None,
            ptz,
        })
    }

    pub fn vid(&self) -> u16 {
        self.vid
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn transport(&self) -> Arc<dyn UsbTransport> {
        self.transport.clone()
    }

    pub fn ptz(&self) -> &PtzDrive {
        &self.ptz
    }

    pub fn ptz_mut(&mut self) -> &mut PtzDrive {
        &mut self.ptz
    }

    pub fn stream(&self) -> Option<&ActiveStream> {
        self.stream.as_ref()
    }

    /// Claim the video interfaces, negotiate PROBE/COMMIT, and select the
    /// best streaming alternate.
    pub fn activate_stream(&mut self) -> LinkResult<&ActiveStream> {
        if !self.transport.claim_interface(self.vc_interface) {
            return Err(LinkError::transfer("video control interface claim rejected"));
        }
        if !self.transport.claim_interface(self.vs_interface) {
            return Err(LinkError::transfer(
                "video streaming interface claim rejected",
            ));
        }

        let params = select_stream(&self.entries);
        info!(
            "session: negotiating fmt={} frame={} interval={}",
            params.format_index, params.frame_index, params.frame_interval_100ns
        );
        let committed = probe_commit(self.transport.as_ref(), self.vs_interface, params)?;

        let (interface, endpoint) =
            choose_stream_endpoint(&self.transport.interfaces(), self.vs_interface).ok_or_else(
                || LinkError::NegotiationFailed("no IN endpoint on streaming interface".into()),
            )?;
        if !self
            .transport
            .select_alternate(interface.id, interface.alternate)
        {
            warn!(
                "session: alternate {} select rejected, continuing on current setting",
                interface.alternate
            );
        }
        self.kick_bulk_endpoint(&endpoint);

        self.stream = Some(ActiveStream {
            params,
            committed,
            interface,
            endpoint,
        });
        self.stream.as_ref().ok_or(LinkError::NoConnection)
    }

    /// Tear down and redo the whole stream setup, for recovery after a
    /// degenerate-stream signal. Best effort.
    pub fn reactivate_stream(&mut self) -> LinkResult<&ActiveStream> {
        debug!("session: reactivating stream");
        self.stream = None;
        self.transport.release_interface(self.vs_interface);
        self.activate_stream()
    }

    /// Release claimed interfaces. Dropping the session afterwards closes
    /// the transport.
    pub fn close(&mut self) {
        self.stream = None;
        self.transport.release_interface(self.vs_interface);
        self.transport.release_interface(self.vc_interface);
    }

    /// Some bulk endpoints only start producing after seeing a first read
    /// attempt; issue one short throwaway read.
    fn kick_bulk_endpoint(&self, endpoint: &EndpointDesc) {
        if endpoint.kind != crate::transport::TransferKind::Bulk {
            return;
        }
        let mut scratch = vec![0u8; endpoint.max_packet_size as usize];
        let rc = self.transport.bulk_transfer(endpoint.address, &mut scratch, 200);
        debug!("session: bulk kick rc={}", rc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProvider, MockTransport};

    fn cs_record(subtype: u8, body: &[u8]) -> Vec<u8> {
        let mut record = vec![(body.len() + 3) as u8, 0x24, subtype];
        record.extend_from_slice(body);
        record
    }

    fn descriptor_blob() -> Vec<u8> {
        let mut raw = Vec::new();
        // Camera input terminal, entity 1
        raw.extend(cs_record(0x02, &[1, 0x01, 0x02, 0, 0]));
        // Uncompressed format 1 with one frame
        raw.extend(cs_record(0x04, &[1]));
        raw.extend(cs_record(0x05, &[1]));
        // MJPEG format 2 with one frame
        raw.extend(cs_record(0x06, &[2]));
        raw.extend(cs_record(0x07, &[1]));
        raw
    }

    fn mock_device() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.set_descriptors(descriptor_blob());
        transport.set_interfaces(MockTransport::uvc_interface_table());
        transport.accept_absolute(1);
        transport
    }

    #[test]
    fn test_open_rejects_devices_without_video_control() {
        let transport = Arc::new(MockTransport::new());
        let provider = MockProvider::new(0x1234, 0x5678, transport);
        let err = DeviceSession::open(&provider, 0x1234, 0x5678).unwrap_err();
        assert!(matches!(err, LinkError::NoControlInterface));
    }

    #[test]
    fn test_open_unknown_device_maps_to_not_found() {
        let provider = MockProvider::new(0x1234, 0x5678, mock_device());
        let err = DeviceSession::open(&provider, 0xdead, 0xbeef).unwrap_err();
        assert!(matches!(err, LinkError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_activate_stream_negotiates_mjpeg_and_selects_alternate() {
        let transport = mock_device();
        let provider = MockProvider::new(0x1234, 0x5678, transport.clone());
        let mut session = DeviceSession::open(&provider, 0x1234, 0x5678).unwrap();
        let stream = session.activate_stream().unwrap();
        assert_eq!(stream.params.format_index, 2);
        assert_eq!(stream.params.frame_index, 1);
        assert_eq!(stream.endpoint.address, 0x81);
        assert_eq!(stream.interface.alternate, 1);
        // Control interface claimed before streaming, then the streaming
        // alternate selected
        assert_eq!(transport.claimed(), vec![0, 1]);
        assert_eq!(transport.selected_alternates(), vec![(1, 1)]);
    }

    #[test]
    fn test_ptz_candidates_come_from_descriptors() {
        let transport = mock_device();
        let provider = MockProvider::new(0x1234, 0x5678, transport.clone());
        let mut session = DeviceSession::open(&provider, 0x1234, 0x5678).unwrap();
        assert!(session.ptz_mut().move_relative(0.5, 0.0, 200, false));
        // Entity 1 came from the camera terminal record, not the fallback
        let abs = transport.sent_with_selector(crate::uvc::PANTILT_ABSOLUTE);
        assert_eq!(abs.first().map(|r| r.entity()), Some(1));
    }

    #[test]
    fn test_reactivate_rebuilds_stream_state() {
        let transport = mock_device();
        let provider = MockProvider::new(0x1234, 0x5678, transport);
        let mut session = DeviceSession::open(&provider, 0x1234, 0x5678).unwrap();
        session.activate_stream().unwrap();
        let stream = session.reactivate_stream().unwrap();
        assert_eq!(stream.params.format_index, 2);
    }
}
