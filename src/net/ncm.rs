//! CDC-NCM function
//!
//! Outbound datagrams are packed into NTB16 blocks. Two blocks alternate:
//! while hardware sends one, the application fills the other. Inbound blocks
//! are validated as a whole, then served one datagram at a time through
//! [`renew()`](NcmFunction::renew).
//!
//! Every NTB that this function produces has the same layout:
//!
//! ```text
//! 0         12            20                         first datagram
//! +---------+-------------+----------------------------+---------------+
//! |  NTH16  | NDP16 head  | entries..., (0, 0), unused | datagrams ... |
//! +---------+-------------+----------------------------+---------------+
//! ```

use super::{
    get_u16, get_u32, notification, notification_header, put_u16, put_u32, request as cdc,
    speed_change, FrameError, NetEndpoints, NOTIFICATION_LEN, SPEED_CHANGE_LEN,
};
use crate::{
    config::{align_up, Config, ConfigError, NetConfig, NDP16_ENTRY_LEN, NDP16_HEADER_LEN, NTH16_LEN},
    control::{reply, standard, ClassDriver, Request, RequestType},
    hw::{HardwareBackend, TransferResult},
};
use core::ptr::NonNull;
use usb_device::{endpoint::EndpointAddress, Result, UsbError};

/// `NCMH`
pub const NTH16_SIGNATURE: u32 = 0x484D_434E;
/// `NCM0`, datagrams without CRC
pub const NDP16_SIGNATURE_NCM0: u32 = 0x304D_434E;
/// `NCM1`, datagrams with CRC
pub const NDP16_SIGNATURE_NCM1: u32 = 0x314D_434E;

/// Size of the GET_NTB_PARAMETERS reply
pub const NTB_PARAMETERS_LEN: usize = 28;

/// NCM class request codes
mod class_request {
    pub const GET_NTB_PARAMETERS: u8 = 0x80;
    pub const GET_NTB_FORMAT: u8 = 0x83;
    pub const SET_NTB_FORMAT: u8 = 0x84;
    pub const GET_NTB_INPUT_SIZE: u8 = 0x85;
    pub const SET_NTB_INPUT_SIZE: u8 = 0x86;
}

/// wNtbFormat of NTB16. NTB32 isn't supported.
const NTB16_FORMAT: u16 = 0;
/// bmNtbFormatsSupported: NTB16 only
const FORMATS_SUPPORTED: u16 = 0x0001;
/// Divisor of the datagram payload alignment
const NDP_DIVISOR: u16 = 4;

/// Offset of NDP entry `index`, for an NDP at `ndp`
fn entry_offset(ndp: usize, index: usize) -> usize {
    ndp + NDP16_HEADER_LEN + index * NDP16_ENTRY_LEN
}

/// A validated, inbound NTB16
///
/// Only the first NDP is considered. Datagram entries end at the first zero
/// offset or zero length, and every entry lies within the block.
#[derive(Clone, Copy, Debug)]
pub struct Ntb16<'a> {
    block: &'a [u8],
    sequence: u16,
    ndp: usize,
    count: usize,
}

impl<'a> Ntb16<'a> {
    /// Validate the block of received bytes
    pub fn parse(block: &'a [u8]) -> core::result::Result<Self, FrameError> {
        if block.len() < NTH16_LEN {
            return Err(FrameError::Truncated);
        }
        if get_u32(block, 0) != Some(NTH16_SIGNATURE) {
            return Err(FrameError::Signature);
        }
        let sequence = get_u16(block, 6).ok_or(FrameError::Truncated)?;
        let ndp = get_u16(block, 10).ok_or(FrameError::Truncated)? as usize;
        if ndp < NTH16_LEN || ndp + NDP16_HEADER_LEN > block.len() {
            return Err(FrameError::Bounds);
        }
        match get_u32(block, ndp) {
            Some(NDP16_SIGNATURE_NCM0) | Some(NDP16_SIGNATURE_NCM1) => {}
            _ => return Err(FrameError::Signature),
        }
        let ndp_len = get_u16(block, ndp + 4).ok_or(FrameError::Truncated)? as usize;
        if ndp_len < NDP16_HEADER_LEN + NDP16_ENTRY_LEN || ndp + ndp_len > block.len() {
            return Err(FrameError::Bounds);
        }

        // The table's last slot is the terminator.
        let capacity = (ndp_len - NDP16_HEADER_LEN - NDP16_ENTRY_LEN) / NDP16_ENTRY_LEN;
        let mut count = 0;
        while count < capacity {
            let at = entry_offset(ndp, count);
            let offset = get_u16(block, at).unwrap_or(0) as usize;
            let len = get_u16(block, at + 2).unwrap_or(0) as usize;
            if offset == 0 || len == 0 {
                break;
            }
            if offset + len > block.len() {
                return Err(FrameError::Bounds);
            }
            count += 1;
        }

        Ok(Ntb16 {
            block,
            sequence,
            ndp,
            count,
        })
    }

    /// The sender's sequence number
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Number of datagrams
    pub fn len(&self) -> usize {
        self.count
    }

    /// Indicates if the block carries no datagrams
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Datagram `index`, if present
    pub fn datagram(&self, index: usize) -> Option<&'a [u8]> {
        if index >= self.count {
            return None;
        }
        let at = entry_offset(self.ndp, index);
        let offset = get_u16(self.block, at)? as usize;
        let len = get_u16(self.block, at + 2)? as usize;
        self.block.get(offset..offset + len)
    }

    /// Iterate over every datagram, in block order
    pub fn datagrams(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.count).filter_map(move |index| self.datagram(index))
    }
}

fn is_word_aligned(block: &[u8]) -> bool {
    block.as_ptr() as usize % 4 == 0
}

/// Write the NTH16 and NDP16 headers of an outbound block
///
/// The NDP immediately follows the NTH. The entry at `count` becomes the
/// terminator.
fn finalize_block(block: &mut [u8], sequence: u16, block_len: usize, count: usize) {
    put_u32(block, 0, NTH16_SIGNATURE);
    put_u16(block, 4, NTH16_LEN as u16);
    put_u16(block, 6, sequence);
    put_u16(block, 8, block_len as u16);
    put_u16(block, 10, NTH16_LEN as u16);

    let ndp = NTH16_LEN;
    let ndp_len = NDP16_HEADER_LEN + (count + 1) * NDP16_ENTRY_LEN;
    put_u32(block, ndp, NDP16_SIGNATURE_NCM0);
    put_u16(block, ndp + 4, ndp_len as u16);
    put_u16(block, ndp + 6, 0);
    let terminator = entry_offset(ndp, count);
    put_u16(block, terminator, 0);
    put_u16(block, terminator + 2, 0);
}

/// Memory for an NCM function
///
/// Each transmit block holds one outbound NTB; the receive block holds one
/// inbound NTB. All three must be word aligned. See
/// [`StaticMemory`](crate::StaticMemory).
pub struct NcmMemory<'a> {
    pub transmit: [&'a mut [u8]; 2],
    pub receive: &'a mut [u8],
}

/// Notifications sent when the data interface activates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Report {
    Speed,
    Connected,
    Done,
}

/// A CDC-NCM function
///
/// Hardware reads the notification bytes from this object. Once
/// configured, keep it in place until the next bus reset, for instance in a
/// `static` [`Shared`](crate::Shared).
pub struct NcmFunction<'a> {
    interface: u8,
    endpoints: NetEndpoints,
    config: Config,
    link_speed_bps: u32,
    transmit: [&'a mut [u8]; 2],
    receive: &'a mut [u8],
    /// Largest IN block that memory allows.
    max_ntb_in_size: usize,
    /// IN block size, as negotiated with the host.
    ntb_in_size: usize,
    ntb_out_size: usize,
    data_alt: u8,
    packet_filter: u16,
    link_changed: bool,

    /// Index of the block being filled.
    fill: usize,
    datagram_count: usize,
    next_offset: usize,
    /// End of the last datagram in the fill block.
    block_len: usize,
    sequence: u16,
    transferring: bool,

    rx_armed: bool,
    rx_ndp: usize,
    rx_count: usize,
    rx_next: usize,

    report: Report,
    report_pending: bool,
    /// Restart the activation sequence once the pending notification retires.
    report_rewind: bool,
    notify: [u8; SPEED_CHANGE_LEN],
}

impl<'a> NcmFunction<'a> {
    /// Create an NCM function on communication interface `interface`
    ///
    /// Fails if the configuration is inconsistent, or if a block can't hold
    /// the NTB headers.
    pub fn new(
        interface: u8,
        endpoints: NetEndpoints,
        memory: NcmMemory<'a>,
        config: Config,
        net: &NetConfig,
    ) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        let NcmMemory { transmit, receive } = memory;
        let min_block = config.first_datagram_offset();
        if transmit
            .iter()
            .any(|block| block.len() < min_block || !is_word_aligned(block))
            || receive.len() < NTH16_LEN
            || !is_word_aligned(receive)
        {
            return Err(ConfigError::Memory);
        }

        let ntb_max_size = config.ntb_max_size as usize;
        let max_ntb_in_size = transmit
            .iter()
            .map(|block| block.len())
            .fold(ntb_max_size, usize::min);
        let ntb_out_size = receive.len().min(ntb_max_size);

        let mut ncm = NcmFunction {
            interface,
            endpoints,
            config,
            link_speed_bps: net.link_speed_bps,
            transmit,
            receive,
            max_ntb_in_size,
            ntb_in_size: max_ntb_in_size,
            ntb_out_size,
            data_alt: 0,
            packet_filter: 0,
            link_changed: false,
            fill: 0,
            datagram_count: 0,
            next_offset: 0,
            block_len: 0,
            sequence: 0,
            transferring: false,
            rx_armed: false,
            rx_ndp: 0,
            rx_count: 0,
            rx_next: 0,
            report: Report::Speed,
            report_pending: false,
            report_rewind: false,
            notify: [0; SPEED_CHANGE_LEN],
        };
        ncm.prepare_tx();
        Ok(ncm)
    }

    /// The communication interface number
    pub fn interface(&self) -> u8 {
        self.interface
    }

    fn data_interface(&self) -> u8 {
        self.interface.wrapping_add(1)
    }

    /// Indicates if the host selected the active data alternate setting
    pub fn is_active(&self) -> bool {
        self.data_alt == 1
    }

    /// Returns the link state once after each change
    pub fn take_link_change(&mut self) -> Option<bool> {
        core::mem::take(&mut self.link_changed).then_some(self.is_active())
    }

    /// The IN block size that the host negotiated
    pub fn ntb_in_size(&self) -> usize {
        self.ntb_in_size
    }

    /// Sequence number of the next transmitted NTB
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Datagrams packed into the fill block
    pub fn datagram_count(&self) -> usize {
        self.datagram_count
    }

    /// Indicates if hardware is sending a block
    pub fn is_transferring(&self) -> bool {
        self.transferring
    }

    /// The host's Ethernet packet filter
    pub fn packet_filter(&self) -> u16 {
        self.packet_filter
    }

    /// Start filling an empty block
    fn prepare_tx(&mut self) {
        self.datagram_count = 0;
        self.next_offset = self.config.first_datagram_offset();
        self.block_len = self.next_offset;
    }

    /// Indicates if a datagram of `size` bytes fits into the fill block
    pub fn can_accept_datagram(&self, size: usize) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.datagram_count >= self.config.max_datagrams_per_block as usize {
            trace!("NTB full by count");
            return false;
        }
        let fits = self
            .next_offset
            .checked_add(size)
            .map_or(false, |end| end <= self.ntb_in_size);
        if !fits {
            trace!("NTB full by size");
            return false;
        }
        true
    }

    /// Copy `datagram` into the fill block
    ///
    /// Returns `false` if it doesn't fit; try again after the next
    /// completion. See [`pack_with()`](Self::pack_with).
    pub fn pack_datagram<B: HardwareBackend>(&mut self, hw: &mut B, datagram: &[u8]) -> bool {
        self.pack_with(hw, datagram.len(), |buffer| {
            buffer.copy_from_slice(datagram);
            datagram.len()
        })
    }

    /// Let `write` place a datagram of at most `max_len` bytes into the fill
    /// block
    ///
    /// `write` returns the datagram's actual length. If the endpoint is idle,
    /// the block is sent right away; otherwise, it's sent when the current
    /// transfer completes. Returns `false` if the datagram doesn't fit, or if
    /// `write` produced nothing.
    pub fn pack_with<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        max_len: usize,
        write: impl FnOnce(&mut [u8]) -> usize,
    ) -> bool {
        if !self.can_accept_datagram(max_len) {
            return false;
        }
        let offset = self.next_offset;
        let block = &mut *self.transmit[self.fill];
        let len = write(&mut block[offset..offset + max_len]).min(max_len);
        if len == 0 {
            return false;
        }

        let entry = entry_offset(NTH16_LEN, self.datagram_count);
        put_u16(block, entry, offset as u16);
        put_u16(block, entry + 2, len as u16);
        self.datagram_count += 1;
        self.block_len = offset + len;
        self.next_offset = align_up(offset + len, self.config.alignment as usize);

        if self.flush_if_idle(hw).is_err() {
            warn!("NTB {} transmit failed", self.sequence);
        }
        true
    }

    /// Send the fill block, unless a block is already in flight
    ///
    /// On success, the two blocks swap roles, and packing continues into the
    /// other block.
    pub fn flush_if_idle<B: HardwareBackend>(&mut self, hw: &mut B) -> Result<()> {
        if self.transferring || self.datagram_count == 0 || !self.is_active() {
            return Ok(());
        }
        let len = self.block_len;
        let block = &mut *self.transmit[self.fill];
        finalize_block(block, self.sequence, len, self.datagram_count);

        let region = NonNull::from(&mut block[..len]).cast();
        // Safety: the block is borrowed for 'a. The fill index moves to the
        // other block below, so nothing writes this one until completion.
        unsafe { hw.start_transfer(self.endpoints.data_in.address, region, len)? };
        trace!(
            "NTB {} SEND {} datagrams, {} bytes",
            self.sequence,
            self.datagram_count,
            len
        );

        self.sequence = self.sequence.wrapping_add(1);
        self.transferring = true;
        self.fill ^= 1;
        self.prepare_tx();
        Ok(())
    }

    fn on_transmit_done<B: HardwareBackend>(&mut self, hw: &mut B) {
        self.transferring = false;
        // Datagrams packed while the other block was in flight.
        if self.flush_if_idle(hw).is_err() {
            warn!("NTB {} transmit failed", self.sequence);
        }
    }

    /// Arm reception of the next inbound block, unless already armed
    fn arm_receive<B: HardwareBackend>(&mut self, hw: &mut B) -> Result<()> {
        if self.rx_armed {
            return Ok(());
        }
        let len = self.ntb_out_size;
        let region = NonNull::from(&mut self.receive[..len]).cast();
        // Safety: the receive block is borrowed for 'a. Datagrams are only
        // served while reception isn't armed.
        unsafe { hw.start_transfer(self.endpoints.data_out.address, region, len)? };
        self.rx_armed = true;
        Ok(())
    }

    /// Accept a received block of `bytes` bytes
    ///
    /// Malformed and empty blocks are dropped, and reception is re-armed.
    /// Otherwise, the datagrams wait for [`renew()`](Self::renew).
    pub fn on_bulk_receive<B: HardwareBackend>(&mut self, hw: &mut B, bytes: usize) {
        self.rx_armed = false;
        self.rx_count = 0;
        self.rx_next = 0;
        let bytes = bytes.min(self.ntb_out_size);
        match Ntb16::parse(&self.receive[..bytes]) {
            Ok(ntb) if !ntb.is_empty() => {
                trace!("NTB {} RECV {} datagrams", ntb.sequence(), ntb.len());
                self.rx_ndp = ntb.ndp;
                self.rx_count = ntb.count;
                return;
            }
            Ok(_) => trace!("NTB empty"),
            Err(_) => debug!("NTB dropped, {} bytes", bytes),
        }
        if self.arm_receive(hw).is_err() {
            warn!("NCM receive failed");
        }
    }

    /// Serve the next received datagram, or re-arm reception
    ///
    /// Call until it returns `None`. Once the datagrams of a block are
    /// exhausted, this arms reception of the next block.
    pub fn renew<B: HardwareBackend>(&mut self, hw: &mut B) -> Option<&[u8]> {
        if self.rx_next < self.rx_count {
            let at = entry_offset(self.rx_ndp, self.rx_next);
            self.rx_next += 1;
            let offset = get_u16(self.receive, at).unwrap_or(0) as usize;
            let len = get_u16(self.receive, at + 2).unwrap_or(0) as usize;
            return self.receive.get(offset..offset + len);
        }
        self.rx_count = 0;
        self.rx_next = 0;
        if self.is_active() && self.arm_receive(hw).is_err() {
            warn!("NCM receive failed");
        }
        None
    }

    /// Send the next notification of the activation sequence
    fn report<B: HardwareBackend>(&mut self, hw: &mut B) {
        let (len, next) = match self.report {
            Report::Speed => {
                self.notify = speed_change(self.interface, self.link_speed_bps);
                (SPEED_CHANGE_LEN, Report::Connected)
            }
            Report::Connected => {
                self.notify[..NOTIFICATION_LEN].copy_from_slice(&notification_header(
                    self.interface,
                    notification::NETWORK_CONNECTION,
                    1,
                    0,
                ));
                (NOTIFICATION_LEN, Report::Done)
            }
            Report::Done => return,
        };
        let region = NonNull::from(&mut self.notify[..len]).cast();
        // Safety: the notification lives in self, which stays in place while
        // configured. Nothing writes it until its completion.
        match unsafe { hw.start_transfer(self.endpoints.notification.address, region, len) } {
            Ok(()) => {
                self.report = next;
                self.report_pending = true;
            }
            Err(_) => warn!("NCM notification failed"),
        }
    }

    fn select_alternate<B: HardwareBackend>(&mut self, hw: &mut B, alt: u8) {
        if alt == self.data_alt {
            return;
        }
        self.data_alt = alt;
        self.link_changed = true;
        debug!("NCM data alt {}", alt);
        if alt == 1 {
            if self.arm_receive(hw).is_err() {
                warn!("NCM receive failed");
            }
            if !self.report_pending {
                self.report(hw);
            }
        } else {
            self.prepare_tx();
            self.rx_count = 0;
            self.rx_next = 0;
            if self.report_pending {
                self.report_rewind = true;
            } else {
                self.report = Report::Speed;
            }
        }
    }

    fn on_report_done<B: HardwareBackend>(&mut self, hw: &mut B) {
        self.report_pending = false;
        if core::mem::take(&mut self.report_rewind) {
            self.report = Report::Speed;
        }
        if self.is_active() {
            self.report(hw);
        }
    }

    fn ntb_parameters(&self) -> [u8; NTB_PARAMETERS_LEN] {
        let alignment = self.config.alignment;
        let mut params = [0; NTB_PARAMETERS_LEN];
        put_u16(&mut params, 0, NTB_PARAMETERS_LEN as u16);
        put_u16(&mut params, 2, FORMATS_SUPPORTED);
        put_u32(&mut params, 4, self.max_ntb_in_size as u32);
        put_u16(&mut params, 8, NDP_DIVISOR);
        put_u16(&mut params, 10, 0);
        put_u16(&mut params, 12, alignment);
        put_u32(&mut params, 16, self.ntb_out_size as u32);
        put_u16(&mut params, 20, NDP_DIVISOR);
        put_u16(&mut params, 22, 0);
        put_u16(&mut params, 24, alignment);
        // wNtbOutMaxDatagrams: no limit
        put_u16(&mut params, 26, 0);
        params
    }
}

impl<'a, B: HardwareBackend> ClassDriver<B> for NcmFunction<'a> {
    fn owns_interface(&self, interface: u8) -> bool {
        interface == self.interface || interface == self.data_interface()
    }

    fn owns_endpoint(&self, endpoint: EndpointAddress) -> bool {
        self.endpoints.contains(endpoint)
    }

    fn reset(&mut self) {
        self.data_alt = 0;
        self.packet_filter = 0;
        self.link_changed = false;
        self.ntb_in_size = self.max_ntb_in_size;
        self.fill = 0;
        self.sequence = 0;
        self.transferring = false;
        self.rx_armed = false;
        self.rx_count = 0;
        self.rx_next = 0;
        self.report = Report::Speed;
        self.report_pending = false;
        self.report_rewind = false;
        self.prepare_tx();
    }

    fn configure(&mut self, hw: &mut B, _: u8) -> Result<()> {
        self.endpoints.open_notification(hw)?;
        self.endpoints.open_data(hw)
    }

    fn control_setup(&mut self, hw: &mut B, request: &Request, data: &mut [u8]) -> Result<usize> {
        match request.kind() {
            RequestType::Standard if request.interface() == self.data_interface() => {
                match request.request {
                    standard::GET_INTERFACE => Ok(reply(data, &[self.data_alt])),
                    standard::SET_INTERFACE if request.value < 2 => {
                        self.select_alternate(hw, request.value as u8);
                        Ok(0)
                    }
                    _ => Err(UsbError::Unsupported),
                }
            }
            RequestType::Class if request.interface() == self.interface => match request.request {
                class_request::GET_NTB_PARAMETERS => Ok(reply(data, &self.ntb_parameters())),
                class_request::GET_NTB_FORMAT => Ok(reply(data, &NTB16_FORMAT.to_le_bytes())),
                class_request::SET_NTB_FORMAT if request.value == NTB16_FORMAT => Ok(0),
                class_request::GET_NTB_INPUT_SIZE => {
                    Ok(reply(data, &(self.ntb_in_size as u32).to_le_bytes()))
                }
                class_request::SET_NTB_INPUT_SIZE if request.length >= 4 => Ok(0),
                cdc::SET_ETHERNET_PACKET_FILTER => {
                    self.packet_filter = request.value;
                    Ok(0)
                }
                _ => Err(UsbError::Unsupported),
            },
            _ => Err(UsbError::Unsupported),
        }
    }

    fn control_data_out(&mut self, _: &mut B, request: &Request, data: &[u8]) -> Result<()> {
        if request.request != class_request::SET_NTB_INPUT_SIZE {
            return Err(UsbError::Unsupported);
        }
        let size = get_u32(data, 0).ok_or(UsbError::ParseError)? as usize;
        if size < self.config.first_datagram_offset() || size > self.max_ntb_in_size {
            return Err(UsbError::InvalidState);
        }
        self.ntb_in_size = size;
        if self.block_len > size {
            debug!("NTB input size {} drops {} datagrams", size, self.datagram_count);
            self.prepare_tx();
        }
        debug!("NTB input size {}", size);
        Ok(())
    }

    fn transfer_complete(
        &mut self,
        hw: &mut B,
        endpoint: EndpointAddress,
        bytes: usize,
        result: TransferResult,
    ) {
        if endpoint == self.endpoints.data_out.address {
            if result.is_success() {
                self.on_bulk_receive(hw, bytes);
            } else {
                self.rx_armed = false;
                if self.is_active() && self.arm_receive(hw).is_err() {
                    warn!("NCM receive failed");
                }
            }
        } else if endpoint == self.endpoints.data_in.address {
            if !result.is_success() {
                debug!("NTB transfer failed");
            }
            self.on_transmit_done(hw);
        } else if endpoint == self.endpoints.notification.address {
            self.on_report_done(hw);
        }
    }
}
