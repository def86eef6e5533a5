//! UVC stream negotiation: candidate selection, PROBE/COMMIT handshake,
//! streaming endpoint scoring.

use log::{debug, info, warn};

use super::descriptor::{DescriptorEntry, DEFAULT_FRAME_INTERVAL};
use super::{u32_le, VS_COMMIT_CONTROL, VS_PROBE_CONTROL};
use crate::error::{LinkError, LinkResult};
use crate::transport::{
    Direction, EndpointDesc, InterfaceDesc, TransferKind, UsbTransport, GET_CUR,
    REQ_TYPE_CLASS_IN, REQ_TYPE_CLASS_OUT, SET_CUR,
};

/// Negotiated stream selection, chosen once per connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval_100ns: u32,
}

impl Default for StreamParams {
    /// 30 fps placeholder used when no frame candidates exist at all
    fn default() -> Self {
        Self {
            format_index: 1,
            frame_index: 1,
            frame_interval_100ns: DEFAULT_FRAME_INTERVAL,
        }
    }
}

/// Pick stream parameters from parsed descriptor entries.
/// MJPEG frames win over uncompressed; otherwise the first frame seen.
pub fn select_stream(entries: &[DescriptorEntry]) -> StreamParams {
    let frames = entries.iter().filter_map(|e| match e {
        DescriptorEntry::Frame {
            format_index,
            frame_index,
            interval_100ns,
            is_mjpeg,
        } => Some((*format_index, *frame_index, *interval_100ns, *is_mjpeg)),
        _ => None,
    });
    let mut first = None;
    for candidate @ (format_index, frame_index, interval, is_mjpeg) in frames {
        if is_mjpeg {
            return StreamParams {
                format_index,
                frame_index,
                frame_interval_100ns: interval,
            };
        }
        first.get_or_insert(candidate);
    }
    match first {
        Some((format_index, frame_index, interval, _)) => StreamParams {
            format_index,
            frame_index,
            frame_interval_100ns: interval,
        },
        None => StreamParams::default(),
    }
}

/// Control-transfer timeout for the handshake
const PROBE_TIMEOUT_MS: u32 = 500;

/// Probe/commit buffer lengths, tried in order. 26 is the UVC 1.0/1.1
/// layout; some devices only accept the 34-byte UVC 1.5 layout.
const PROBE_LENGTHS: [usize; 2] = [26, 34];

/// Run the PROBE/COMMIT handshake on the video-streaming interface.
///
/// The buffer returned by GET_CUR carries device-adjusted values (clamped
/// interval, payload size) and is re-sent verbatim on COMMIT; re-deriving
/// fields client-side is a protocol violation the device may reject.
///
/// Returns the committed buffer; fails with `NegotiationFailed` only when
/// both lengths are rejected end to end.
pub fn probe_commit(
    transport: &dyn UsbTransport,
    vs_interface: u8,
    params: StreamParams,
) -> LinkResult<Vec<u8>> {
    for len in PROBE_LENGTHS {
        let mut probe = vec![0u8; len];
        probe[0] = 1; // bmHint: honor dwFrameInterval
        probe[2] = params.format_index;
        probe[3] = params.frame_index;
        probe[4..8].copy_from_slice(&params.frame_interval_100ns.to_le_bytes());

        let set_probe = transport.control_transfer(
            REQ_TYPE_CLASS_OUT,
            SET_CUR,
            (VS_PROBE_CONTROL as u16) << 8,
            vs_interface as u16,
            &mut probe,
            PROBE_TIMEOUT_MS,
        );
        let mut current = vec![0u8; len];
        let get_probe = transport.control_transfer(
            REQ_TYPE_CLASS_IN,
            GET_CUR,
            (VS_PROBE_CONTROL as u16) << 8,
            vs_interface as u16,
            &mut current,
            PROBE_TIMEOUT_MS,
        );
        debug!(
            "probe_commit: len={} set_probe_rc={} get_probe_rc={}",
            len, set_probe, get_probe
        );
        if set_probe < 0 || get_probe < 0 {
            continue;
        }
        info!("probe_commit: device offer {}", summarize_probe(&current));

        let mut commit = current.clone();
        let set_commit = transport.control_transfer(
            REQ_TYPE_CLASS_OUT,
            SET_CUR,
            (VS_COMMIT_CONTROL as u16) << 8,
            vs_interface as u16,
            &mut commit,
            PROBE_TIMEOUT_MS,
        );
        debug!("probe_commit: len={} set_commit_rc={}", len, set_commit);
        if set_commit >= 0 {
            return Ok(current);
        }
        warn!("probe_commit: commit rejected at len={}", len);
    }
    Err(LinkError::NegotiationFailed(format!(
        "device rejected probe lengths {:?}",
        PROBE_LENGTHS
    )))
}

/// Human-readable summary of a probe/commit buffer for logs
pub fn summarize_probe(buf: &[u8]) -> String {
    let fmt = buf.get(2).copied().map(i32::from).unwrap_or(-1);
    let frame = buf.get(3).copied().map(i32::from).unwrap_or(-1);
    let interval = u32_le(buf, 4).map(i64::from).unwrap_or(-1);
    let max_payload = u32_le(buf, 22).map(i64::from).unwrap_or(-1);
    format!(
        "fmt={} frame={} interval={} maxPayload={} len={}",
        fmt,
        frame,
        interval,
        max_payload,
        buf.len()
    )
}

/// Isochronous IN endpoints outrank everything; within a transfer kind the
/// larger max packet size wins, so bulk-only devices still get a pick.
fn endpoint_score(ep: &EndpointDesc) -> i32 {
    let iso_bonus = if ep.kind == TransferKind::Isochronous {
        100_000
    } else {
        0
    };
    ep.max_packet_size as i32 + iso_bonus
}

/// Choose the streaming alternate setting and IN endpoint for `vs_interface`
/// after a successful COMMIT. Alternates without endpoints are the control
/// alternate and never stream.
pub fn choose_stream_endpoint(
    interfaces: &[InterfaceDesc],
    vs_interface: u8,
) -> Option<(InterfaceDesc, EndpointDesc)> {
    let mut best: Option<(InterfaceDesc, EndpointDesc)> = None;
    let mut best_score = -1;
    for iface in interfaces {
        if iface.id != vs_interface || iface.endpoints.is_empty() {
            continue;
        }
        for ep in &iface.endpoints {
            if ep.direction != Direction::In {
                continue;
            }
            let score = endpoint_score(ep);
            if score > best_score {
                best_score = score;
                best = Some((iface.clone(), *ep));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn frame(format_index: u8, frame_index: u8, is_mjpeg: bool) -> DescriptorEntry {
        DescriptorEntry::Frame {
            format_index,
            frame_index,
            interval_100ns: DEFAULT_FRAME_INTERVAL,
            is_mjpeg,
        }
    }

    #[test]
    fn test_select_prefers_mjpeg_over_uncompressed() {
        let entries = vec![frame(1, 1, false), frame(2, 1, true)];
        let params = select_stream(&entries);
        assert_eq!((params.format_index, params.frame_index), (2, 1));
    }

    #[test]
    fn test_select_falls_back_to_first_frame() {
        let entries = vec![frame(1, 2, false), frame(1, 3, false)];
        let params = select_stream(&entries);
        assert_eq!((params.format_index, params.frame_index), (1, 2));
    }

    #[test]
    fn test_select_defaults_without_candidates() {
        assert_eq!(select_stream(&[]), StreamParams::default());
    }

    #[test]
    fn test_probe_commit_reuses_device_adjusted_buffer() {
        let transport = MockTransport::new();
        transport.clamp_interval(400_000);
        let committed = probe_commit(&transport, 1, StreamParams::default()).unwrap();
        // The device clamped the interval; the committed buffer carries it
        assert_eq!(u32_le(&committed, 4), Some(400_000));
        // The mock rejects a COMMIT that differs from its GET_CUR response,
        // so reaching Ok proves the verbatim rule held.
    }

    #[test]
    fn test_probe_commit_falls_back_to_34_bytes() {
        let transport = MockTransport::new();
        transport.reject_probe_length(26);
        let committed = probe_commit(&transport, 1, StreamParams::default()).unwrap();
        assert_eq!(committed.len(), 34);
    }

    #[test]
    fn test_probe_commit_fails_when_both_lengths_rejected() {
        let transport = MockTransport::new();
        transport.reject_probe_length(26);
        transport.reject_probe_length(34);
        let err = probe_commit(&transport, 1, StreamParams::default()).unwrap_err();
        assert!(matches!(err, LinkError::NegotiationFailed(_)));
    }

    fn ep(kind: TransferKind, mps: u16) -> EndpointDesc {
        EndpointDesc {
            address: 0x81,
            direction: Direction::In,
            kind,
            max_packet_size: mps,
        }
    }

    fn alt(id: u8, alternate: u8, endpoints: Vec<EndpointDesc>) -> InterfaceDesc {
        InterfaceDesc {
            id,
            alternate,
            class: crate::transport::CLASS_VIDEO,
            subclass: crate::transport::SUBCLASS_VIDEO_STREAMING,
            endpoints,
        }
    }

    #[test]
    fn test_endpoint_scoring_prefers_isochronous() {
        let interfaces = vec![
            alt(1, 0, Vec::new()),
            alt(1, 1, vec![ep(TransferKind::Bulk, 3072)]),
            alt(1, 2, vec![ep(TransferKind::Isochronous, 1024)]),
        ];
        let (iface, chosen) = choose_stream_endpoint(&interfaces, 1).unwrap();
        assert_eq!(iface.alternate, 2);
        assert_eq!(chosen.kind, TransferKind::Isochronous);
    }

    #[test]
    fn test_bulk_only_device_wins_by_packet_size() {
        let interfaces = vec![
            alt(1, 1, vec![ep(TransferKind::Bulk, 512)]),
            alt(1, 2, vec![ep(TransferKind::Bulk, 1024)]),
        ];
        let (iface, chosen) = choose_stream_endpoint(&interfaces, 1).unwrap();
        assert_eq!(iface.alternate, 2);
        assert_eq!(chosen.max_packet_size, 1024);
    }

    #[test]
    fn test_other_interface_ids_ignored() {
        let interfaces = vec![alt(2, 1, vec![ep(TransferKind::Bulk, 512)])];
        assert!(choose_stream_endpoint(&interfaces, 1).is_none());
    }
}
