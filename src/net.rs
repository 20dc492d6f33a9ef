//! Network-class functions
//!
//! Two functions present an Ethernet link to the host:
//!
//! - [`NcmFunction`] implements CDC-NCM, which bundles datagrams into NCM
//!   Transfer Blocks (NTBs).
//! - [`NetDevice`] implements CDC-ECM, which moves one raw frame per
//!   transfer, or RNDIS, which wraps each frame in a packet message, and
//!   configures the link with [`rndis`] control messages.
//!
//! Both are [`ClassDriver`](crate::control::ClassDriver)s. They own a
//! communication interface `n` with its notification endpoint, and a data
//! interface `n + 1` with a bulk endpoint pair.

pub mod ncm;
pub mod rndis;

mod ecm_rndis;

pub use ecm_rndis::{Mode, NetDevice, NetMemory};
pub use ncm::{NcmFunction, NcmMemory};

use crate::{
    control::{Descriptors, Request},
    hw::{EndpointDescriptor, HardwareBackend},
};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// CDC notification codes
pub(crate) mod notification {
    pub const NETWORK_CONNECTION: u8 = 0x00;
    pub const RESPONSE_AVAILABLE: u8 = 0x01;
    pub const CONNECTION_SPEED_CHANGE: u8 = 0x2A;
}

/// CDC class request codes shared by the network functions
pub(crate) mod request {
    pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
    pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;
    pub const SET_ETHERNET_PACKET_FILTER: u8 = 0x43;
}

/// Size of a notification header
pub(crate) const NOTIFICATION_LEN: usize = 8;
/// Size of a connection speed change notification
pub(crate) const SPEED_CHANGE_LEN: usize = NOTIFICATION_LEN + 8;

/// Class, interface recipient, device to host
const NOTIFICATION_REQUEST_TYPE: u8 = 0xA1;

/// Produce a notification header for `interface`
pub(crate) fn notification_header(interface: u8, code: u8, value: u16, length: u16) -> [u8; 8] {
    Request {
        request_type: NOTIFICATION_REQUEST_TYPE,
        request: code,
        value,
        index: interface as u16,
        length,
    }
    .to_bytes()
}

/// Produce a connection speed change notification
pub(crate) fn speed_change(interface: u8, bits_per_second: u32) -> [u8; SPEED_CHANGE_LEN] {
    let mut notify = [0; SPEED_CHANGE_LEN];
    notify[..NOTIFICATION_LEN].copy_from_slice(&notification_header(
        interface,
        notification::CONNECTION_SPEED_CHANGE,
        0,
        8,
    ));
    // Downlink, then uplink.
    notify[8..12].copy_from_slice(&bits_per_second.to_le_bytes());
    notify[12..16].copy_from_slice(&bits_per_second.to_le_bytes());
    notify
}

/// Read a little-endian `u16`, if it's in bounds
pub(crate) fn get_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32`, if it's in bounds
pub(crate) fn get_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// An inbound frame that fails validation
///
/// Rejected frames are dropped, and reception is re-armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer bytes than the headers need.
    Truncated,
    /// Unexpected signature or message type.
    Signature,
    /// An offset or length points outside of the received bytes.
    Bounds,
}

/// Endpoints of a CDC network function
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetEndpoints {
    /// Interrupt IN endpoint of the communication interface.
    pub notification: EndpointDescriptor,
    /// Bulk IN endpoint of the data interface.
    pub data_in: EndpointDescriptor,
    /// Bulk OUT endpoint of the data interface.
    pub data_out: EndpointDescriptor,
}

impl NetEndpoints {
    /// Find the endpoints of the function whose communication interface is
    /// `interface`
    ///
    /// The notification endpoint belongs to `interface`, and the bulk pair to
    /// `interface + 1`. Returns `None` if any of them is missing.
    pub fn from_descriptors(descriptors: &Descriptors, interface: u8) -> Option<Self> {
        let notification = descriptors
            .endpoints(interface)
            .find(|ep| ep.kind == EndpointType::Interrupt && ep.address.is_in())?;
        let data_interface = interface.checked_add(1)?;
        let bulk = |direction| {
            descriptors
                .endpoints(data_interface)
                .find(|ep| ep.kind == EndpointType::Bulk && ep.address.direction() == direction)
        };
        Some(NetEndpoints {
            notification,
            data_in: bulk(UsbDirection::In)?,
            data_out: bulk(UsbDirection::Out)?,
        })
    }

    /// Indicates if `endpoint` is one of these endpoints
    pub fn contains(&self, endpoint: EndpointAddress) -> bool {
        [self.notification, self.data_in, self.data_out]
            .iter()
            .any(|ep| ep.address == endpoint)
    }

    /// Open the notification endpoint
    pub(crate) fn open_notification<B: HardwareBackend>(&self, hw: &mut B) -> Result<(), UsbError> {
        hw.open_endpoint(&self.notification).map(|_| ())
    }

    /// Open the bulk pair
    pub(crate) fn open_data<B: HardwareBackend>(&self, hw: &mut B) -> Result<(), UsbError> {
        hw.open_endpoint(&self.data_out)?;
        hw.open_endpoint(&self.data_in)?;
        Ok(())
    }
}
