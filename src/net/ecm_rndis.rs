//! CDC-ECM and RNDIS network device
//!
//! Both framings move one Ethernet frame per bulk transfer. ECM sends the raw
//! frame. RNDIS puts a data packet header in front of it, and only carries
//! data once the host set a packet filter.

use super::{
    notification, notification_header,
    request as cdc,
    rndis::{self, Rndis, SessionState, Statistics, PACKET_HEADER_LEN},
    NetEndpoints, NOTIFICATION_LEN,
};
use crate::{
    config::{ConfigError, NetConfig},
    control::{reply, standard, ClassDriver, Request, RequestType},
    hw::{zero_length, HardwareBackend, TransferResult},
};
use core::ptr::NonNull;
use usb_device::{endpoint::EndpointAddress, Result, UsbError};

/// Smallest frame that carries an Ethernet header
const MIN_FRAME_LEN: usize = 14;

/// RNDIS RESPONSE_AVAILABLE notification
const RESPONSE_AVAILABLE: [u8; NOTIFICATION_LEN] = [notification::RESPONSE_AVAILABLE, 0, 0, 0, 0, 0, 0, 0];

/// Framing of a [`NetDevice`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Mode {
    /// CDC-ECM. Data endpoints open with data alternate setting 1.
    Ecm,
    /// RNDIS. Data endpoints open with the configuration.
    Rndis,
}

/// Memory for a [`NetDevice`]
///
/// Each buffer holds one frame, plus the RNDIS packet header in RNDIS mode.
pub struct NetMemory<'a> {
    pub transmit: &'a mut [u8],
    pub receive: &'a mut [u8],
}

/// A CDC-ECM or RNDIS network device
///
/// Hardware reads the notification bytes from this object. Once
/// configured, keep it in place until the next bus reset, for instance in a
/// `static` [`Shared`](crate::Shared).
pub struct NetDevice<'a> {
    mode: Mode,
    interface: u8,
    endpoints: NetEndpoints,
    transmit: &'a mut [u8],
    receive: &'a mut [u8],
    rndis: Rndis,
    statistics: Statistics,
    packet_filter: u16,

    data_alt: u8,
    /// The data endpoints are open in this configuration.
    endpoints_open: bool,
    /// The data path carries frames.
    data_active: bool,
    link_up: bool,
    link_changed: bool,

    tx_busy: bool,
    tx_len: usize,
    zlp_pending: bool,

    rx_armed: bool,
    /// Start and end of a received frame that the application hasn't taken.
    rx_frame: Option<(usize, usize)>,

    notify: [u8; NOTIFICATION_LEN],
    notify_pending: bool,
    /// Another notification is due once the pending one completes.
    notify_again: bool,
}

impl<'a> NetDevice<'a> {
    /// Create a network device on communication interface `interface`
    ///
    /// Both buffers need room for an MTU-sized frame, plus the packet header
    /// in RNDIS mode.
    pub fn new(
        mode: Mode,
        interface: u8,
        endpoints: NetEndpoints,
        memory: NetMemory<'a>,
        net: &NetConfig,
    ) -> core::result::Result<Self, ConfigError> {
        let NetMemory { transmit, receive } = memory;
        let header = match mode {
            Mode::Ecm => 0,
            Mode::Rndis => PACKET_HEADER_LEN,
        };
        let required = net.mtu as usize + header;
        if transmit.len() < required || receive.len() < required {
            return Err(ConfigError::Memory);
        }
        if endpoints.data_in.max_packet_size == 0 {
            return Err(ConfigError::MaxPacketSize);
        }
        Ok(NetDevice {
            mode,
            interface,
            endpoints,
            transmit,
            receive,
            rndis: Rndis::new(*net),
            statistics: Statistics::default(),
            packet_filter: 0,
            data_alt: 0,
            endpoints_open: false,
            data_active: false,
            link_up: true,
            link_changed: false,
            tx_busy: false,
            tx_len: 0,
            zlp_pending: false,
            rx_armed: false,
            rx_frame: None,
            notify: [0; NOTIFICATION_LEN],
            notify_pending: false,
            notify_again: false,
        })
    }

    /// The protocol that this device speaks
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The RNDIS session. Idle in ECM mode.
    pub fn rndis(&self) -> &Rndis {
        &self.rndis
    }

    /// Frame counters, as reported to RNDIS hosts
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// The ECM packet filter
    pub fn packet_filter(&self) -> u16 {
        self.packet_filter
    }

    /// Indicates if the application reported the link as up
    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Returns the data path state once after each change
    pub fn take_link_change(&mut self) -> Option<bool> {
        core::mem::take(&mut self.link_changed).then_some(self.data_active)
    }

    fn data_interface(&self) -> u8 {
        self.interface.wrapping_add(1)
    }

    fn header_len(&self) -> usize {
        match self.mode {
            Mode::Ecm => 0,
            Mode::Rndis => PACKET_HEADER_LEN,
        }
    }

    /// Largest frame that fits into the transmit buffer
    pub fn max_frame_len(&self) -> usize {
        self.transmit.len() - self.header_len()
    }

    /// Indicates if the device can accept a frame for transmission
    pub fn can_transmit(&self) -> bool {
        let session = match self.mode {
            Mode::Ecm => true,
            Mode::Rndis => self.rndis.state() == SessionState::DataInitialized,
        };
        session && self.data_active && !self.tx_busy
    }

    /// Send `frame`
    ///
    /// Returns `false` if the device can't transmit right now, or if the frame
    /// doesn't fit. See [`transmit_with()`](Self::transmit_with).
    pub fn transmit<B: HardwareBackend>(&mut self, hw: &mut B, frame: &[u8]) -> bool {
        self.transmit_with(hw, frame.len(), |buffer| {
            buffer.copy_from_slice(frame);
            frame.len()
        })
    }

    /// Let `write` produce a frame of at most `max_len` bytes, then send it
    ///
    /// `write` returns the frame's actual length. Returns `false` without
    /// calling `write` if the device can't transmit right now.
    pub fn transmit_with<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        max_len: usize,
        write: impl FnOnce(&mut [u8]) -> usize,
    ) -> bool {
        if !self.can_transmit() || max_len > self.max_frame_len() {
            return false;
        }
        let header = self.header_len();
        let frame_len = write(&mut self.transmit[header..header + max_len]).min(max_len);
        if frame_len == 0 {
            return false;
        }
        let len = match self.mode {
            Mode::Ecm => frame_len,
            // The buffer was checked against the header length in new().
            Mode::Rndis => match rndis::write_packet_header(&mut self.transmit[..], frame_len) {
                Some(len) => len,
                None => return false,
            },
        };

        let region = NonNull::from(&mut self.transmit[..len]).cast();
        // Safety: the transmit buffer is borrowed for 'a. tx_busy keeps
        // software from writing it until the completion.
        if unsafe { hw.start_transfer(self.endpoints.data_in.address, region, len) }.is_err() {
            warn!("NET transmit failed");
            self.statistics.tx_error = self.statistics.tx_error.wrapping_add(1);
            return false;
        }
        trace!("NET SEND {} bytes", len);
        self.tx_busy = true;
        self.tx_len = len;
        true
    }

    fn on_transmit_done<B: HardwareBackend>(&mut self, hw: &mut B, result: TransferResult) {
        if !self.tx_busy {
            return;
        }
        if !result.is_success() {
            self.statistics.tx_error = self.statistics.tx_error.wrapping_add(1);
            self.finish_transmit();
            return;
        }
        let max_packet_size = self.endpoints.data_in.max_packet_size as usize;
        if self.data_active && !self.zlp_pending && self.tx_len % max_packet_size == 0 {
            // The host can't tell where a transfer ends on a packet boundary.
            if zero_length(hw, self.endpoints.data_in.address).is_ok() {
                self.zlp_pending = true;
                return;
            }
            warn!("NET ZLP failed");
        }
        self.statistics.tx_ok = self.statistics.tx_ok.wrapping_add(1);
        self.finish_transmit();
    }

    fn finish_transmit(&mut self) {
        self.tx_busy = false;
        self.zlp_pending = false;
        self.tx_len = 0;
    }

    /// Arm reception of the next frame, unless already armed
    fn arm_receive<B: HardwareBackend>(&mut self, hw: &mut B) -> Result<()> {
        if self.rx_armed || !self.data_active {
            return Ok(());
        }
        let len = self.receive.len();
        let region = NonNull::from(&mut *self.receive).cast();
        // Safety: the receive buffer is borrowed for 'a. Frames are only
        // served while reception isn't armed.
        unsafe { hw.start_transfer(self.endpoints.data_out.address, region, len)? };
        self.rx_armed = true;
        Ok(())
    }

    fn on_bulk_receive<B: HardwareBackend>(&mut self, hw: &mut B, bytes: usize) {
        self.rx_armed = false;
        if !self.data_active {
            debug!("NET dropped, data path inactive");
            return;
        }
        let bytes = bytes.min(self.receive.len());
        let frame = match self.mode {
            Mode::Ecm if bytes >= MIN_FRAME_LEN => Some((0, bytes)),
            Mode::Ecm => None,
            Mode::Rndis => rndis::packet_bounds(&self.receive[..bytes]).ok(),
        };
        match frame {
            Some(frame) => {
                trace!("NET RECV {} bytes", frame.1 - frame.0);
                self.statistics.rx_ok = self.statistics.rx_ok.wrapping_add(1);
                self.rx_frame = Some(frame);
            }
            None => {
                debug!("NET dropped, {} bytes", bytes);
                self.statistics.rx_error = self.statistics.rx_error.wrapping_add(1);
                if self.arm_receive(hw).is_err() {
                    warn!("NET receive failed");
                }
            }
        }
    }

    /// Take the received frame, or re-arm reception
    ///
    /// Returns a frame at most once. The next call arms reception, and
    /// returns `None`.
    pub fn renew<B: HardwareBackend>(&mut self, hw: &mut B) -> Option<&[u8]> {
        if let Some((start, end)) = self.rx_frame.take() {
            return self.receive.get(start..end);
        }
        if self.arm_receive(hw).is_err() {
            warn!("NET receive failed");
        }
        None
    }

    /// Change the link state, and tell the host
    pub fn set_link<B: HardwareBackend>(&mut self, hw: &mut B, up: bool) {
        if self.link_up == up {
            return;
        }
        self.link_up = up;
        debug!("NET link {}", up);
        match self.mode {
            Mode::Ecm => {
                if self.data_active {
                    self.send_notification(hw);
                }
            }
            Mode::Rndis => {
                if self.rndis.set_link(up) {
                    self.send_notification(hw);
                }
            }
        }
    }

    /// Send the mode's notification, or defer it behind a pending one
    fn send_notification<B: HardwareBackend>(&mut self, hw: &mut B) {
        if self.notify_pending {
            self.notify_again = true;
            return;
        }
        self.notify = match self.mode {
            Mode::Ecm => notification_header(
                self.interface,
                notification::NETWORK_CONNECTION,
                self.link_up as u16,
                0,
            ),
            Mode::Rndis => RESPONSE_AVAILABLE,
        };
        let region = NonNull::from(&mut self.notify).cast();
        // Safety: the notification lives in self, which stays in place while
        // configured. notify_pending keeps it unchanged until completion.
        match unsafe {
            hw.start_transfer(self.endpoints.notification.address, region, NOTIFICATION_LEN)
        } {
            Ok(()) => self.notify_pending = true,
            Err(_) => warn!("NET notification failed"),
        }
    }

    fn open_data<B: HardwareBackend>(&mut self, hw: &mut B) -> Result<()> {
        if !self.endpoints_open {
            self.endpoints.open_data(hw)?;
            self.endpoints_open = true;
        }
        Ok(())
    }

    fn set_data_active<B: HardwareBackend>(&mut self, hw: &mut B, active: bool) {
        if self.data_active == active {
            return;
        }
        self.data_active = active;
        self.link_changed = true;
        if active {
            if self.arm_receive(hw).is_err() {
                warn!("NET receive failed");
            }
        } else {
            // Transfers in flight keep their buffers until they complete.
            self.rx_frame = None;
        }
    }

    fn ecm_class_request<B: HardwareBackend>(&mut self, hw: &mut B, request: &Request) -> Result<usize> {
        match request.request {
            cdc::SET_ETHERNET_PACKET_FILTER => {
                self.packet_filter = request.value;
                debug!("ECM packet filter 0x{:x}", request.value);
                if self.link_up {
                    self.send_notification(hw);
                }
                Ok(0)
            }
            _ => Err(UsbError::Unsupported),
        }
    }

    fn rndis_class_request(&mut self, request: &Request, data: &mut [u8]) -> Result<usize> {
        match request.request {
            cdc::SEND_ENCAPSULATED_COMMAND if request.length > 0 => Ok(0),
            cdc::GET_ENCAPSULATED_RESPONSE => {
                let len = match self.rndis.response() {
                    Some(response) => reply(data, response),
                    None => reply(data, &[0]),
                };
                self.rndis.clear_response();
                Ok(len)
            }
            _ => Err(UsbError::Unsupported),
        }
    }
}

impl<'a, B: HardwareBackend> ClassDriver<B> for NetDevice<'a> {
    fn owns_interface(&self, interface: u8) -> bool {
        interface == self.interface || interface == self.data_interface()
    }

    fn owns_endpoint(&self, endpoint: EndpointAddress) -> bool {
        self.endpoints.contains(endpoint)
    }

    fn reset(&mut self) {
        self.rndis.reset();
        self.packet_filter = 0;
        self.data_alt = 0;
        self.endpoints_open = false;
        self.link_changed = self.data_active;
        self.data_active = false;
        self.finish_transmit();
        self.rx_armed = false;
        self.rx_frame = None;
        self.notify_pending = false;
        self.notify_again = false;
    }

    fn configure(&mut self, hw: &mut B, _: u8) -> Result<()> {
        self.endpoints.open_notification(hw)?;
        if self.mode == Mode::Rndis {
            self.open_data(hw)?;
            self.set_data_active(hw, true);
        }
        Ok(())
    }

    fn control_setup(&mut self, hw: &mut B, request: &Request, data: &mut [u8]) -> Result<usize> {
        match request.kind() {
            RequestType::Standard if request.interface() == self.data_interface() => {
                match (request.request, self.mode) {
                    (standard::GET_INTERFACE, _) => Ok(reply(data, &[self.data_alt])),
                    (standard::SET_INTERFACE, Mode::Ecm) if request.value < 2 => {
                        let alt = request.value as u8;
                        if alt == 1 {
                            self.open_data(hw)?;
                        }
                        self.data_alt = alt;
                        debug!("ECM data alt {}", alt);
                        self.set_data_active(hw, alt == 1);
                        Ok(0)
                    }
                    (standard::SET_INTERFACE, Mode::Rndis) if request.value == 0 => Ok(0),
                    _ => Err(UsbError::Unsupported),
                }
            }
            RequestType::Class if request.interface() == self.interface => match self.mode {
                Mode::Ecm => self.ecm_class_request(hw, request),
                Mode::Rndis => self.rndis_class_request(request, data),
            },
            _ => Err(UsbError::Unsupported),
        }
    }

    fn control_data_out(&mut self, hw: &mut B, request: &Request, data: &[u8]) -> Result<()> {
        if self.mode != Mode::Rndis || request.request != cdc::SEND_ENCAPSULATED_COMMAND {
            return Err(UsbError::Unsupported);
        }
        let initialized = self.rndis.state() != SessionState::Uninitialized;
        if self.rndis.handle(data, &self.statistics) {
            self.send_notification(hw);
        }
        if initialized && self.rndis.state() == SessionState::Uninitialized {
            // HALT and RESET drop a frame that the application hasn't taken.
            self.rx_frame = None;
        }
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
                self.statistics.rx_error = self.statistics.rx_error.wrapping_add(1);
                if self.arm_receive(hw).is_err() {
                    warn!("NET receive failed");
                }
            }
        } else if endpoint == self.endpoints.data_in.address {
            self.on_transmit_done(hw, result);
        } else if endpoint == self.endpoints.notification.address {
            self.notify_pending = false;
            if core::mem::take(&mut self.notify_again) {
                self.send_notification(hw);
            }
        }
    }
}
