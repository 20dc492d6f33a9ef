//! A recording hardware backend for unit tests

use crate::hw::{EndpointDescriptor, HardwareBackend};
use core::ptr::NonNull;
use std::vec::Vec;
use usb_device::{endpoint::EndpointAddress, UsbError};

/// A transfer that the engine scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub endpoint: EndpointAddress,
    pub len: usize,
    /// Copy of the source bytes, for IN endpoints
    pub data: Vec<u8>,
    /// Destination region, for OUT endpoints
    pub ptr: *mut u8,
}

impl Transfer {
    /// Simulate the host writing `data` into an OUT transfer's region
    pub fn fill(&self, data: &[u8]) {
        assert!(data.len() <= self.len, "host sent more than the transfer allows");
        // Safety: tests keep the engine's buffers alive while simulating
        // completions. The engine handed us this region for `len` bytes.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, data.len()) };
    }
}

#[derive(Default)]
pub struct MockBackend {
    pub transfers: Vec<Transfer>,
    pub opened: Vec<EndpointDescriptor>,
    pub stalled: Vec<EndpointAddress>,
    pub address: Option<u8>,
    /// Fail the next start_transfer call
    pub fail_next: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers scheduled on a given endpoint
    pub fn on(&self, endpoint: EndpointAddress) -> Vec<&Transfer> {
        self.transfers
            .iter()
            .filter(|t| t.endpoint == endpoint)
            .collect()
    }

    /// The most recent transfer on a given endpoint
    pub fn last_on(&self, endpoint: EndpointAddress) -> Option<&Transfer> {
        self.transfers.iter().rev().find(|t| t.endpoint == endpoint)
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.transfers.iter().map(|t| t.len).collect()
    }
}

impl HardwareBackend for MockBackend {
    fn open_endpoint(&mut self, descriptor: &EndpointDescriptor) -> Result<EndpointAddress, UsbError> {
        if self.opened.iter().any(|d| d.address == descriptor.address) {
            return Err(UsbError::InvalidEndpoint);
        }
        self.opened.push(*descriptor);
        Ok(descriptor.address)
    }

    unsafe fn start_transfer(
        &mut self,
        endpoint: EndpointAddress,
        buffer: NonNull<u8>,
        len: usize,
    ) -> Result<(), UsbError> {
        if self.fail_next {
            self.fail_next = false;
            return Err(UsbError::InvalidState);
        }
        let data = if endpoint.is_in() && len > 0 {
            core::slice::from_raw_parts(buffer.as_ptr(), len).to_vec()
        } else {
            Vec::new()
        };
        self.transfers.push(Transfer {
            endpoint,
            len,
            data,
            ptr: buffer.as_ptr(),
        });
        Ok(())
    }

    fn stall(&mut self, endpoint: EndpointAddress) {
        if !self.stalled.contains(&endpoint) {
            self.stalled.push(endpoint);
        }
    }

    fn clear_stall(&mut self, endpoint: EndpointAddress) {
        self.stalled.retain(|ep| *ep != endpoint);
    }

    fn is_stalled(&self, endpoint: EndpointAddress) -> bool {
        self.stalled.contains(&endpoint)
    }

    fn set_device_address(&mut self, address: u8) {
        self.address = Some(address);
    }
}
