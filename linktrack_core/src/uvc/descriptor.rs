//! USB configuration-descriptor walker.
//!
//! A configuration descriptor is a flat byte stream of records, each
//! starting with a one-byte length and a one-byte type. Only class-specific
//! interface records (type 0x24) are interpreted; everything else is
//! skipped by length. Truncated or corrupt input never fails the parse:
//! the walk stops at the first bad record and returns what was found.
//!
//! A single pass yields both the stream-negotiation table (formats and
//! frames) and the PTZ addressing candidates (camera terminals and
//! extension units), so callers parse once per connect.

use super::{u16_le, u32_le};

/// Class-specific interface descriptor type
const CS_INTERFACE: u8 = 0x24;

/// VC_INPUT_TERMINAL subtype
const VC_INPUT_TERMINAL: u8 = 0x02;
/// VC_EXTENSION_UNIT subtype (same value as VS_FORMAT_MJPEG; disambiguated
/// by which interface's descriptors are being walked, which the raw stream
/// does not carry — so both interpretations are recorded)
const VC_EXTENSION_UNIT: u8 = 0x06;
/// VS_FORMAT_UNCOMPRESSED subtype
const VS_FORMAT_UNCOMPRESSED: u8 = 0x04;
/// VS_FRAME_UNCOMPRESSED subtype
const VS_FRAME_UNCOMPRESSED: u8 = 0x05;
/// VS_FORMAT_MJPEG subtype
const VS_FORMAT_MJPEG: u8 = 0x06;
/// VS_FRAME_MJPEG subtype
const VS_FRAME_MJPEG: u8 = 0x07;

/// Camera/pan-tilt input terminal type (ITT_CAMERA)
const TERMINAL_TYPE_CAMERA: u16 = 0x0201;

/// Default frame interval when the frame record is too short to carry one:
/// 333333 × 100 ns ≈ 30 fps
pub const DEFAULT_FRAME_INTERVAL: u32 = 333_333;

/// One interpreted record of the configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorEntry {
    /// VS format record; `is_mjpeg` is sticky for the frames that follow it
    Format { format_index: u8, is_mjpeg: bool },
    /// VS frame record, tagged with the format it belongs to
    Frame {
        format_index: u8,
        frame_index: u8,
        interval_100ns: u32,
        is_mjpeg: bool,
    },
    /// Camera input terminal (pan/tilt capable entity candidate)
    PtzTerminal { entity_id: u8 },
    /// Extension unit with its control-capability bitmap
    ExtensionUnit {
        entity_id: u8,
        guid: [u8; 16],
        controls: Vec<u8>,
    },
}

/// Walk a raw configuration descriptor and interpret the class-specific
/// interface records. Returns partial results on truncated input.
pub fn parse_descriptors(raw: &[u8]) -> Vec<DescriptorEntry> {
    let mut entries = Vec::new();
    let mut format_index = 1u8;
    let mut is_mjpeg = false;

    let mut i = 0usize;
    while i + 2 < raw.len() {
        let len = raw[i] as usize;
        if len == 0 || i + len > raw.len() {
            break;
        }
        let dtype = raw[i + 1];
        if dtype == CS_INTERFACE && len >= 4 {
            let record = &raw[i..i + len];
            let subtype = record[2];
            match subtype {
                VS_FORMAT_MJPEG => {
                    // 0x06 doubles as VC_EXTENSION_UNIT on the control
                    // interface; record both readings and let the caller
                    // pick by context.
                    is_mjpeg = true;
                    format_index = record[3];
                    entries.push(DescriptorEntry::Format {
                        format_index,
                        is_mjpeg: true,
                    });
                    if let Some(unit) = parse_extension_unit(record) {
                        entries.push(unit);
                    }
                }
                VS_FORMAT_UNCOMPRESSED => {
                    is_mjpeg = false;
                    format_index = record[3];
                    entries.push(DescriptorEntry::Format {
                        format_index,
                        is_mjpeg: false,
                    });
                }
                VS_FRAME_MJPEG | VS_FRAME_UNCOMPRESSED => {
                    let interval = if len >= 25 {
                        u32_le(record, 21).unwrap_or(DEFAULT_FRAME_INTERVAL)
                    } else {
                        DEFAULT_FRAME_INTERVAL
                    };
                    entries.push(DescriptorEntry::Frame {
                        format_index,
                        frame_index: record[3],
                        interval_100ns: interval,
                        is_mjpeg,
                    });
                }
                VC_INPUT_TERMINAL if len >= 8 => {
                    if u16_le(record, 4) == Some(TERMINAL_TYPE_CAMERA) {
                        entries.push(DescriptorEntry::PtzTerminal {
                            entity_id: record[3],
                        });
                    }
                }
                _ => {}
            }
        }
        i += len;
    }
    entries
}

/// Extension-unit layout: bUnitID at 3, guidExtensionCode at 4..20,
/// bNumControls at 20, bNrInPins at 21, baSourceID pins, then
/// bControlSize at 22 + pins followed by the control bitmap.
fn parse_extension_unit(record: &[u8]) -> Option<DescriptorEntry> {
    if record.len() < 24 {
        return None;
    }
    let entity_id = record[3];
    let mut guid = [0u8; 16];
    guid.copy_from_slice(record.get(4..20)?);
    let pins = record[21] as usize;
    let size_offset = 22 + pins;
    let control_size = *record.get(size_offset)? as usize;
    let bitmap_start = size_offset + 1;
    // Clamp to the record; a lying bControlSize must not read past it
    let bitmap_end = (bitmap_start + control_size).min(record.len());
    let controls = record.get(bitmap_start..bitmap_end)?.to_vec();
    Some(DescriptorEntry::ExtensionUnit {
        entity_id,
        guid,
        controls,
    })
}

/// Entity ids worth trying for pan/tilt control, in descriptor order:
/// camera terminals first, then extension units.
pub fn ptz_entity_candidates(entries: &[DescriptorEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        if let DescriptorEntry::PtzTerminal { entity_id } = entry {
            if !out.contains(entity_id) {
                out.push(*entity_id);
            }
        }
    }
    for entry in entries {
        if let DescriptorEntry::ExtensionUnit { entity_id, .. } = entry {
            if !out.contains(entity_id) {
                out.push(*entity_id);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one class-specific record with the given subtype and body
    fn cs_record(subtype: u8, body: &[u8]) -> Vec<u8> {
        let mut rec = vec![0u8, CS_INTERFACE, subtype];
        rec.extend_from_slice(body);
        rec[0] = rec.len() as u8;
        rec
    }

    fn frame_record(subtype: u8, frame_index: u8, interval: u32) -> Vec<u8> {
        // 25-byte frame record with the interval at offset 21
        let mut body = vec![frame_index];
        body.extend_from_slice(&[0u8; 17]);
        body.extend_from_slice(&interval.to_le_bytes());
        cs_record(subtype, &body)
    }

    #[test]
    fn test_format_then_frames_inherit_mjpeg_flag() {
        let mut raw = Vec::new();
        raw.extend(cs_record(VS_FORMAT_UNCOMPRESSED, &[1]));
        raw.extend(frame_record(VS_FRAME_UNCOMPRESSED, 1, 666_666));
        raw.extend(cs_record(VS_FORMAT_MJPEG, &[2]));
        raw.extend(frame_record(VS_FRAME_MJPEG, 1, 333_333));

        let entries = parse_descriptors(&raw);
        let frames: Vec<_> = entries
            .iter()
            .filter_map(|e| match e {
                DescriptorEntry::Frame {
                    format_index,
                    is_mjpeg,
                    interval_100ns,
                    ..
                } => Some((*format_index, *is_mjpeg, *interval_100ns)),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![(1, false, 666_666), (2, true, 333_333)]);
    }

    #[test]
    fn test_short_frame_record_defaults_interval() {
        let raw = cs_record(VS_FRAME_UNCOMPRESSED, &[3]);
        let entries = parse_descriptors(&raw);
        assert!(matches!(
            entries.as_slice(),
            [DescriptorEntry::Frame {
                frame_index: 3,
                interval_100ns: DEFAULT_FRAME_INTERVAL,
                ..
            }]
        ));
    }

    #[test]
    fn test_camera_terminal_becomes_ptz_candidate() {
        // bTerminalID=2, wTerminalType=0x0201, bAssocTerminal + extras
        let raw = cs_record(VC_INPUT_TERMINAL, &[2, 0x01, 0x02, 0, 0]);
        let entries = parse_descriptors(&raw);
        assert_eq!(ptz_entity_candidates(&entries), vec![2]);
    }

    #[test]
    fn test_non_camera_terminal_ignored() {
        // wTerminalType=0x0101 (streaming terminal)
        let raw = cs_record(VC_INPUT_TERMINAL, &[2, 0x01, 0x01, 0, 0]);
        assert!(parse_descriptors(&raw).is_empty());
    }

    #[test]
    fn test_extension_unit_bitmap_clamped_to_record() {
        let mut body = vec![9u8]; // bUnitID
        body.extend_from_slice(&[0xAA; 16]); // guid
        body.push(4); // bNumControls
        body.push(0); // bNrInPins
        body.push(3); // bControlSize claims 3 bytes...
        body.extend_from_slice(&[0x0F, 0x01]); // ...but only 2 are present
        let raw = cs_record(VC_EXTENSION_UNIT, &body);

        let entries = parse_descriptors(&raw);
        let unit = entries
            .iter()
            .find_map(|e| match e {
                DescriptorEntry::ExtensionUnit {
                    entity_id,
                    controls,
                    ..
                } => Some((*entity_id, controls.clone())),
                _ => None,
            })
            .expect("extension unit parsed");
        assert_eq!(unit, (9, vec![0x0F, 0x01]));
    }

    #[test]
    fn test_zero_length_record_stops_parse() {
        let mut raw = cs_record(VS_FORMAT_MJPEG, &[1]);
        raw.push(0); // zero-length record
        raw.extend(frame_record(VS_FRAME_MJPEG, 1, 333_333));
        let entries = parse_descriptors(&raw);
        // Everything after the zero-length record is unreachable
        assert!(entries
            .iter()
            .all(|e| !matches!(e, DescriptorEntry::Frame { .. })));
    }

    #[test]
    fn test_truncated_record_returns_partial_results() {
        let mut raw = frame_record(VS_FRAME_MJPEG, 1, 333_333);
        raw.extend_from_slice(&[30, CS_INTERFACE, VS_FRAME_MJPEG]); // claims 30 bytes, has 3
        let entries = parse_descriptors(&raw);
        assert_eq!(
            entries
                .iter()
                .filter(|e| matches!(e, DescriptorEntry::Frame { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_non_class_records_skipped_by_length() {
        let mut raw = vec![9, 0x02, 0, 0, 0, 0, 0, 0, 0]; // configuration descriptor
        raw.extend(cs_record(VS_FORMAT_MJPEG, &[5]));
        let entries = parse_descriptors(&raw);
        assert!(entries
            .iter()
            .any(|e| matches!(e, DescriptorEntry::Format { format_index: 5, .. })));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_descriptors(&[]).is_empty());
    }
}
