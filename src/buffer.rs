//! Circular transfer buffer
//!
//! A [`TransferBuffer`] stages outbound bytes for hardware-paced transmission.
//! The application writes bytes at its own rate; the buffer hands contiguous,
//! word-aligned runs to the hardware backend, one transfer at a time.
//!
//! The buffer tracks three counts instead of a read cursor, so a full buffer is
//! never confused with an empty one. Going forward from the oldest byte that
//! software still owns, the buffer holds
//!
//! 1. bytes *in flight*, owned by hardware until the transfer completes,
//! 2. *padding* that keeps the next hardware-visible run word-aligned,
//! 3. *pending* bytes, queued but not yet handed to hardware,
//!
//! followed by free space up to the write cursor's wraparound.

use crate::hw::HardwareBackend;
use core::ptr::NonNull;
use usb_device::{endpoint::EndpointAddress, UsbError};

/// Start addresses handed to hardware are aligned to this many bytes
pub const ALIGNMENT: usize = 4;

/// A single-producer circular buffer feeding one IN endpoint
///
/// Call [`write()`](TransferBuffer::write) from task context, and
/// [`on_transmit_done()`](TransferBuffer::on_transmit_done) when the backend
/// reports that the endpoint's transfer completed. If those contexts differ,
/// wrap the buffer in a [`Shared`](crate::Shared).
///
/// The buffer owns its backing memory for `'a`. Don't drop the buffer while a
/// transfer is in flight; hardware is still reading that memory.
pub struct TransferBuffer<'a> {
    memory: &'a mut [u8],
    endpoint: EndpointAddress,
    write_cursor: usize,
    pending: usize,
    in_flight: usize,
    padding: usize,
}

impl<'a> TransferBuffer<'a> {
    /// Create a transfer buffer that feeds `endpoint` from `memory`
    ///
    /// Leading bytes are skipped if `memory` doesn't start on an
    /// [`ALIGNMENT`] boundary, and trailing bytes are unused if the length
    /// isn't a multiple of [`ALIGNMENT`]. Use a [`StaticMemory`](crate::StaticMemory)
    /// to avoid losing any bytes.
    pub fn new(memory: &'a mut [u8], endpoint: EndpointAddress) -> Self {
        let skip = memory.as_ptr().align_offset(ALIGNMENT).min(memory.len());
        let memory = &mut memory[skip..];
        let len = memory.len() - memory.len() % ALIGNMENT;
        TransferBuffer {
            memory: &mut memory[..len],
            endpoint,
            write_cursor: 0,
            pending: 0,
            in_flight: 0,
            padding: 0,
        }
    }

    /// Returns the endpoint that this buffer feeds
    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    /// Total usable bytes
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes queued, but not yet handed to hardware
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Bytes handed to hardware, awaiting completion
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Bytes skipped to keep the next hardware run aligned
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Offset of the next free byte
    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    /// Bytes that a write could accept right now
    pub fn free(&self) -> usize {
        self.capacity() - self.owned()
    }

    /// Indicates if a transfer is outstanding
    pub fn is_busy(&self) -> bool {
        self.in_flight != 0
    }

    fn owned(&self) -> usize {
        self.pending + self.in_flight + self.padding
    }

    /// Copy up to `free` bytes at the write cursor, without crossing the end
    /// of the buffer
    fn copy_in(&mut self, data: &[u8]) -> usize {
        let contiguous = self.capacity() - self.write_cursor;
        let count = data.len().min(self.free()).min(contiguous);
        if count == 0 {
            return 0;
        }
        self.memory[self.write_cursor..self.write_cursor + count].copy_from_slice(&data[..count]);
        self.write_cursor = (self.write_cursor + count) % self.capacity();
        self.pending += count;
        count
    }

    /// Queue `data` for transmission
    ///
    /// Returns the number of bytes accepted, which may be less than
    /// `data.len()` when the buffer is nearly full. The caller decides whether
    /// to retry the rest, or drop it.
    ///
    /// If the endpoint is idle, the first accepted bytes are handed to hardware
    /// before this call returns.
    pub fn write<B: HardwareBackend>(&mut self, hw: &mut B, data: &[u8]) -> usize {
        if self.capacity() == 0 {
            return 0;
        }
        let mut accepted = self.copy_in(data);
        if accepted == 0 {
            return 0;
        }
        if self.try_transmit(hw).is_err() {
            // Bytes stay pending; the next write or completion retries.
            warn!("EP{} transmit failed, {} bytes queued", self.endpoint.index(), self.pending);
        }
        // Wrapped writes continue at the start of the buffer.
        accepted += self.copy_in(&data[accepted..]);
        trace!("EP{} WRITE {} of {}", self.endpoint.index(), accepted, data.len());
        accepted
    }

    /// Hand the next pending run to hardware, if the endpoint is idle
    ///
    /// Does nothing if a transfer is already in flight, or if nothing is
    /// pending. If the pending bytes wrap past the end of the buffer, only the
    /// bytes up to the end are transmitted; the rest follow after completion.
    pub fn try_transmit<B: HardwareBackend>(&mut self, hw: &mut B) -> Result<(), UsbError> {
        if self.in_flight != 0 || self.pending == 0 {
            return Ok(());
        }
        let capacity = self.capacity();
        let start = (self.write_cursor + capacity - self.pending) % capacity;
        let len = self.pending.min(capacity - start);

        let region = NonNull::from(&mut self.memory[start..start + len]).cast();
        // Safety: the region belongs to this buffer for 'a. Until
        // on_transmit_done, no write touches it: it's accounted as in flight,
        // so it's excluded from free space.
        unsafe { hw.start_transfer(self.endpoint, region, len)? };
        self.pending -= len;
        self.in_flight = len;

        if self.pending == 0 {
            let misalignment = self.write_cursor % ALIGNMENT;
            if misalignment != 0 {
                self.padding = ALIGNMENT - misalignment;
                self.write_cursor = (self.write_cursor + self.padding) % capacity;
            }
        }
        debug_assert!(self.owned() <= capacity);
        Ok(())
    }

    /// Signal that the endpoint's transfer finished, and pipeline the next run
    ///
    /// `bytes_confirmed` is the count that hardware reported. Hardware
    /// transfers aren't retried; if hardware confirmed fewer bytes than it
    /// was handed, the remainder is dropped.
    pub fn on_transmit_done<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        bytes_confirmed: usize,
    ) -> Result<(), UsbError> {
        if self.in_flight == 0 {
            debug!("EP{} stale completion", self.endpoint.index());
            return self.try_transmit(hw);
        }
        if bytes_confirmed < self.in_flight {
            warn!(
                "EP{} confirmed {} of {}",
                self.endpoint.index(),
                bytes_confirmed,
                self.in_flight
            );
        }
        // One transfer at a time, so anything unconfirmed is lost.
        self.in_flight = 0;
        // Padding directly follows the completed run, so it's free too.
        self.padding = 0;
        self.try_transmit(hw)
    }

    /// Drop everything that hardware doesn't yet own
    ///
    /// Call on bus reset or disconnect. Bytes already in flight can't be
    /// retracted. Hardware keeps its run, and nothing new is transmitted until
    /// [`on_transmit_done()`](TransferBuffer::on_transmit_done) retires it. If
    /// the controller dropped the transfer, report it as done with zero bytes.
    pub fn clear(&mut self) {
        if self.in_flight == 0 {
            self.write_cursor = 0;
            self.padding = 0;
        } else {
            // Rewind to the end of the in-flight run and its padding.
            let capacity = self.capacity();
            self.write_cursor = (self.write_cursor + capacity - self.pending) % capacity;
        }
        self.pending = 0;
    }
}
