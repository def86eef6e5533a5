//! USB transport boundary.
//!
//! The host side (device enumeration, permission prompts, file-descriptor
//! plumbing) lives outside this crate. Everything in here talks to the
//! device through [`UsbTransport`], which mirrors the two primitives every
//! USB host stack provides: a control transfer and a bulk transfer, plus
//! read access to the cached configuration descriptor and interface table.

use std::sync::Arc;

use crate::error::LinkResult;

/// USB class code for video devices
pub const CLASS_VIDEO: u8 = 0x0E;
/// Video-control interface subclass
pub const SUBCLASS_VIDEO_CONTROL: u8 = 0x01;
/// Video-streaming interface subclass
pub const SUBCLASS_VIDEO_STREAMING: u8 = 0x02;

/// Class-specific host-to-device request type
pub const REQ_TYPE_CLASS_OUT: u8 = 0x21;
/// Class-specific device-to-host request type
pub const REQ_TYPE_CLASS_IN: u8 = 0xA1;

/// UVC SET_CUR request
pub const SET_CUR: u8 = 0x01;
/// UVC GET_CUR request
pub const GET_CUR: u8 = 0x81;
/// UVC GET_MIN request
pub const GET_MIN: u8 = 0x82;
/// UVC GET_MAX request
pub const GET_MAX: u8 = 0x83;
/// UVC GET_INFO request
pub const GET_INFO: u8 = 0x86;

/// Endpoint transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Endpoint transfer kind, as reported by the endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint of an interface alternate setting
#[derive(Debug, Clone, Copy)]
pub struct EndpointDesc {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

/// One interface alternate setting
#[derive(Debug, Clone)]
pub struct InterfaceDesc {
    /// Interface number (shared across alternates)
    pub id: u8,
    /// Alternate setting number
    pub alternate: u8,
    pub class: u8,
    pub subclass: u8,
    pub endpoints: Vec<EndpointDesc>,
}

impl InterfaceDesc {
    /// True for UVC video-streaming alternates
    pub fn is_video_streaming(&self) -> bool {
        self.class == CLASS_VIDEO && self.subclass == SUBCLASS_VIDEO_STREAMING
    }

    /// True for UVC video-control alternates
    pub fn is_video_control(&self) -> bool {
        self.class == CLASS_VIDEO && self.subclass == SUBCLASS_VIDEO_CONTROL
    }
}

/// Blocking USB transfer primitives.
///
/// Transfer methods return bytes transferred, or a negative value on
/// rejection/timeout — matching the host-stack convention so status checks
/// stay `rc >= 0` throughout the protocol code.
pub trait UsbTransport: Send + Sync {
    /// Issue a control transfer. For IN requests `data` is filled with the
    /// device response; for OUT requests `data` is the payload to send.
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> i32;

    /// Issue a blocking bulk read/write on `endpoint`
    fn bulk_transfer(&self, endpoint: u8, buf: &mut [u8], timeout_ms: u32) -> i32;

    /// Queue an asynchronous read request on `endpoint`.
    /// Returns false when the endpoint cannot accept queued requests.
    fn submit_read(&self, endpoint: u8, len: usize) -> bool;

    /// Wait for a previously queued request to complete, copying the
    /// completed data into `buf`.
    /// Returns bytes transferred, or negative on timeout/error.
    fn wait_read(&self, buf: &mut [u8], timeout_ms: u32) -> i32;

    /// Raw configuration descriptor bytes, if the host stack cached them
    fn raw_descriptors(&self) -> Option<Vec<u8>>;

    /// Interface table (every alternate setting of every interface)
    fn interfaces(&self) -> Vec<InterfaceDesc>;

    /// Claim an interface for exclusive use
    fn claim_interface(&self, id: u8) -> bool;

    /// Release a previously claimed interface
    fn release_interface(&self, id: u8) -> bool;

    /// Select an alternate setting on a claimed interface
    fn select_alternate(&self, id: u8, alternate: u8) -> bool;
}

/// Opens a transport for a VID/PID pair.
///
/// Implemented by the host glue; failures surface as `DeviceNotFound` or
/// `PermissionPending`.
pub trait TransportProvider: Send + Sync {
    fn open(&self, vid: u16, pid: u16) -> LinkResult<Arc<dyn UsbTransport>>;

    /// Enumerate attached devices. Hosts without enumeration support may
    /// leave the default empty list.
    fn list(&self) -> Vec<DeviceSummary> {
        Vec::new()
    }
}

/// Summary of an attached device, for the `list` command surface
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub name: String,
    pub vid: u16,
    pub pid: u16,
    pub device_class: u8,
    pub interface_count: usize,
    pub is_uvc: bool,
}

/// Video-class heuristic: a device counts as UVC when the device class or
/// any interface class is video.
pub fn is_likely_uvc(device_class: u8, interfaces: &[InterfaceDesc]) -> bool {
    device_class == CLASS_VIDEO || interfaces.iter().any(|i| i.class == CLASS_VIDEO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(class: u8, subclass: u8) -> InterfaceDesc {
        InterfaceDesc {
            id: 0,
            alternate: 0,
            class,
            subclass,
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn test_is_likely_uvc_by_device_class() {
        assert!(is_likely_uvc(CLASS_VIDEO, &[]));
        assert!(!is_likely_uvc(0x03, &[]));
    }

    #[test]
    fn test_is_likely_uvc_by_interface_class() {
        let ifaces = vec![iface(0x03, 0), iface(CLASS_VIDEO, 1)];
        assert!(is_likely_uvc(0x00, &ifaces));
    }

    #[test]
    fn test_interface_role_predicates() {
        assert!(iface(CLASS_VIDEO, SUBCLASS_VIDEO_CONTROL).is_video_control());
        assert!(iface(CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING).is_video_streaming());
        assert!(!iface(CLASS_VIDEO, SUBCLASS_VIDEO_CONTROL).is_video_streaming());
    }
}
