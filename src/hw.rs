//! Hardware backend contract
//!
//! The engine never touches a USB controller directly. Instead, each
//! controller family implements [`HardwareBackend`], and the engine asks it to
//! open endpoints, start transfers, and stall endpoints. The backend reports
//! what happened on the bus through [`Event`]s, which you feed into a
//! [`Device`](crate::device::Device) (or into the individual components).
//!
//! # Contexts
//!
//! Events are expected to be dispatched from the USB interrupt handler, or
//! from an equivalent single-threaded event loop. Calls that queue
//! application data are expected from task context. See
//! [`Shared`](crate::Shared) to hand a component between the two.

use core::ptr::NonNull;
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// Direct index to the OUT control endpoint
pub fn ep0_out() -> EndpointAddress {
    // Constructor not currently const. Otherwise, this would
    // be a const.
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Direct index to the IN control endpoint
pub fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// Describes an endpoint that a class driver wants opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address, including direction.
    pub address: EndpointAddress,
    /// Transfer type.
    pub kind: EndpointType,
    /// Largest packet the endpoint moves on the wire.
    pub max_packet_size: u16,
    /// Polling interval, only meaningful for interrupt endpoints.
    pub interval: u8,
}

/// Descriptor type of a standard endpoint descriptor
const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
/// Size of a standard endpoint descriptor
const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

impl EndpointDescriptor {
    /// Describe a bulk endpoint
    pub fn bulk(address: EndpointAddress, max_packet_size: u16) -> Self {
        EndpointDescriptor {
            address,
            kind: EndpointType::Bulk,
            max_packet_size,
            interval: 0,
        }
    }

    /// Describe an interrupt endpoint
    pub fn interrupt(address: EndpointAddress, max_packet_size: u16, interval: u8) -> Self {
        EndpointDescriptor {
            address,
            kind: EndpointType::Interrupt,
            max_packet_size,
            interval,
        }
    }

    /// Parse a standard endpoint descriptor, as it appears in a configuration
    /// descriptor
    ///
    /// Isochronous endpoints are reported as [`UsbError::Unsupported`].
    pub fn parse(raw: &[u8]) -> Result<Self, UsbError> {
        if raw.len() < ENDPOINT_DESCRIPTOR_LEN
            || (raw[0] as usize) < ENDPOINT_DESCRIPTOR_LEN
            || raw[1] != DESCRIPTOR_TYPE_ENDPOINT
        {
            return Err(UsbError::ParseError);
        }
        let kind = match raw[3] & 0b11 {
            0 => EndpointType::Control,
            2 => EndpointType::Bulk,
            3 => EndpointType::Interrupt,
            _ => return Err(UsbError::Unsupported),
        };
        Ok(EndpointDescriptor {
            address: EndpointAddress::from(raw[2]),
            kind,
            max_packet_size: u16::from_le_bytes([raw[4], raw[5]]) & 0x7FF,
            interval: raw[6],
        })
    }
}

/// Outcome of a hardware transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferResult {
    /// The transfer finished; the byte count is valid.
    Success,
    /// The controller reported a transaction or bus error.
    Failed,
    /// The endpoint was stalled while the transfer was pending.
    Stalled,
}

impl TransferResult {
    /// Returns `true` if this is [`TransferResult::Success`]
    pub fn is_success(self) -> bool {
        self == TransferResult::Success
    }
}

/// Something that happened on the bus
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The host reset the bus.
    Reset,
    /// A SETUP packet arrived on the control endpoint.
    Setup([u8; 8]),
    /// A transfer scheduled with [`HardwareBackend::start_transfer`] finished.
    TransferComplete {
        endpoint: EndpointAddress,
        bytes: usize,
        result: TransferResult,
    },
}

/// A USB device controller
///
/// One implementation per controller family. The engine is generic over this
/// trait, and never references a concrete controller type.
pub trait HardwareBackend {
    /// The controller can latch a new device address after the status stage
    /// without help from software.
    ///
    /// When `true`, the engine applies SET_ADDRESS while handling the SETUP
    /// packet. Otherwise, the engine waits for the status stage to complete.
    const QUIRK_SET_ADDRESS_BEFORE_STATUS: bool = false;

    /// Configure and enable an endpoint
    ///
    /// Returns the address that the controller assigned, which is expected to
    /// match the address in the descriptor.
    fn open_endpoint(&mut self, descriptor: &EndpointDescriptor) -> Result<EndpointAddress, UsbError>;

    /// Start an asynchronous transfer of `len` bytes
    ///
    /// For IN endpoints, the controller sends `len` bytes from `buffer`. For OUT
    /// endpoints, the controller receives up to `len` bytes into `buffer`. A
    /// `len` of zero schedules a zero-length packet. Completion is reported
    /// with [`Event::TransferComplete`].
    ///
    /// # Safety
    ///
    /// The caller must ensure that `buffer` points to at least `len` bytes,
    /// and that the region stays valid until the matching completion event.
    /// Software must not write an IN region, or read an OUT region, while the
    /// transfer is pending.
    unsafe fn start_transfer(
        &mut self,
        endpoint: EndpointAddress,
        buffer: NonNull<u8>,
        len: usize,
    ) -> Result<(), UsbError>;

    /// Stall an endpoint
    fn stall(&mut self, endpoint: EndpointAddress);

    /// Clear an endpoint stall, and reset its data toggle
    fn clear_stall(&mut self, endpoint: EndpointAddress);

    /// Indicates if an endpoint is stalled
    fn is_stalled(&self, endpoint: EndpointAddress) -> bool;

    /// Assign the device address
    fn set_device_address(&mut self, address: u8);
}

/// Schedule a zero-length packet
pub(crate) fn zero_length<B: HardwareBackend>(
    hw: &mut B,
    endpoint: EndpointAddress,
) -> Result<(), UsbError> {
    // Safety: a zero-length transfer never touches the buffer. A dangling,
    // non-null pointer is sufficient.
    unsafe { hw.start_transfer(endpoint, NonNull::dangling(), 0) }
}

#[cfg(test)]
mod test {
    use super::{EndpointDescriptor, UsbError};
    use usb_device::{endpoint::EndpointType, UsbDirection};

    #[test]
    fn parse_bulk_in() {
        let raw = [0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00];
        let desc = EndpointDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.address.index(), 1);
        assert_eq!(desc.address.direction(), UsbDirection::In);
        assert_eq!(desc.kind, EndpointType::Bulk);
        assert_eq!(desc.max_packet_size, 64);
    }

    #[test]
    fn parse_interrupt_out() {
        let raw = [0x07, 0x05, 0x03, 0x03, 0x08, 0x00, 0x0A];
        let desc = EndpointDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.address.index(), 3);
        assert_eq!(desc.address.direction(), UsbDirection::Out);
        assert_eq!(desc.kind, EndpointType::Interrupt);
        assert_eq!(desc.interval, 10);
    }

    #[test]
    fn reject_isochronous() {
        let raw = [0x07, 0x05, 0x81, 0x01, 0x00, 0x02, 0x01];
        assert_eq!(EndpointDescriptor::parse(&raw), Err(UsbError::Unsupported));
    }

    #[test]
    fn reject_not_an_endpoint() {
        let raw = [0x09, 0x04, 0x00, 0x00, 0x02, 0x0A, 0x00, 0x00, 0x00];
        assert_eq!(EndpointDescriptor::parse(&raw), Err(UsbError::ParseError));
        assert_eq!(EndpointDescriptor::parse(&[0x07, 0x05]), Err(UsbError::ParseError));
    }
}
