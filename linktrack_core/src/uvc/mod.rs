//! UVC protocol layer: descriptor parsing, stream negotiation, PTZ drive.

pub mod descriptor;
pub mod negotiate;
pub mod ptz;

pub use descriptor::{parse_descriptors, ptz_entity_candidates, DescriptorEntry};
pub use negotiate::{choose_stream_endpoint, probe_commit, select_stream, StreamParams};
pub use ptz::{GimbalPosition, PtzDrive, PAN_RANGE, TILT_RANGE};

/// VS_PROBE_CONTROL selector
pub const VS_PROBE_CONTROL: u8 = 0x01;
/// VS_COMMIT_CONTROL selector
pub const VS_COMMIT_CONTROL: u8 = 0x02;
/// CT_ZOOM_RELATIVE_CONTROL selector
pub const ZOOM_RELATIVE: u8 = 0x0C;
/// CT_PANTILT_ABSOLUTE_CONTROL selector
pub const PANTILT_ABSOLUTE: u8 = 0x0D;
/// CT_PANTILT_RELATIVE_CONTROL selector
pub const PANTILT_RELATIVE: u8 = 0x0E;

/// Little-endian u32 read with a truncation guard
pub(crate) fn u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Little-endian u16 read with a truncation guard
pub(crate) fn u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}
