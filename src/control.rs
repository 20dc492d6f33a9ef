//! Control transfer engine
//!
//! The [`ControlEngine`] drives the SETUP / DATA / STATUS protocol on endpoint
//! zero. It answers the standard device and endpoint requests on its own, and
//! routes interface requests, class requests and vendor requests to the
//! [`ClassDriver`] that owns the interface (or endpoint) in `wIndex`.
//!
//! Data stages move through the engine's control buffer, one wire packet at a
//! time. A new SETUP packet always wins: it abandons whatever transaction was
//! in progress.

mod descriptors;
mod request;

pub use descriptors::{DescriptorIter, Descriptors};
pub use request::{descriptor_type, feature, standard, Recipient, Request, RequestType};

#[cfg(test)]
pub(crate) use descriptors::test as descriptors_for_test;

use crate::{
    config::Config,
    hw::{self, ep0_in, ep0_out, HardwareBackend, TransferResult},
};
use core::ptr::NonNull;
use usb_device::{endpoint::EndpointAddress, Result, UsbDirection, UsbError};

/// A suggested size for the control buffer
///
/// Large enough for a configuration with a few functions, and for RNDIS
/// control messages.
pub const CONTROL_BUFFER_LEN: usize = 256;

/// Addresses above this are reserved
const MAX_DEVICE_ADDRESS: u16 = 127;

/// Where the engine is within a control transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Idle, waiting for the next SETUP packet.
    AwaitingSetup,
    /// Moving the data stage, one packet at a time.
    Data,
    /// Waiting for the zero-length status handshake.
    Status,
}

/// A USB function that sits behind the control engine
///
/// A class driver owns one or more interfaces, and the non-zero endpoints
/// that those interfaces declare. The engine and the [`Device`](crate::device::Device)
/// call into the driver from the event dispatch context.
pub trait ClassDriver<B: HardwareBackend> {
    /// Indicates if the driver handles requests for `interface`
    fn owns_interface(&self, interface: u8) -> bool;

    /// Indicates if the driver handles events for `endpoint`
    fn owns_endpoint(&self, endpoint: EndpointAddress) -> bool;

    /// The host reset the bus, or removed the configuration
    ///
    /// Forget all endpoint and session state.
    fn reset(&mut self);

    /// The host selected configuration `configuration`
    fn configure(&mut self, hw: &mut B, configuration: u8) -> Result<()> {
        let _ = (hw, configuration);
        Ok(())
    }

    /// Handle the SETUP stage of a request
    ///
    /// For requests with an IN data stage, write the reply into `data` and
    /// return its length. Otherwise, return `Ok(0)` to accept the request. Any
    /// error stalls the control endpoint.
    fn control_setup(&mut self, hw: &mut B, request: &Request, data: &mut [u8]) -> Result<usize>;

    /// Handle the data that the host sent in an OUT data stage
    ///
    /// Called once the whole data stage arrived, and before the status stage.
    /// Any error stalls the control endpoint.
    fn control_data_out(&mut self, hw: &mut B, request: &Request, data: &[u8]) -> Result<()> {
        let _ = (hw, request, data);
        Ok(())
    }

    /// A transfer on one of the driver's endpoints finished
    fn transfer_complete(
        &mut self,
        hw: &mut B,
        endpoint: EndpointAddress,
        bytes: usize,
        result: TransferResult,
    );
}

/// Copy as much of `src` as fits into `dst`
pub(crate) fn reply(dst: &mut [u8], src: &[u8]) -> usize {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
    len
}

/// The state machine of endpoint zero
pub struct ControlEngine<'a> {
    descriptors: Descriptors<'a>,
    buffer: &'a mut [u8],
    max_packet_size: usize,
    stage: Stage,
    request: Request,
    total_transferred: usize,
    /// Bytes that the data stage moves. At most `wLength`.
    data_len: usize,
    /// Class driver that accepted the current request.
    handler: Option<usize>,
    address: u8,
    pending_address: Option<u8>,
    /// EP0 is stalled until the next SETUP.
    halted: bool,
    configuration: u8,
    remote_wakeup: bool,
}

impl<'a> ControlEngine<'a> {
    /// Create a control engine that serves `descriptors`
    ///
    /// Data stages move through `buffer`. IN replies are truncated to its
    /// length, and OUT data stages that don't fit are stalled. Provide at
    /// least [`CONTROL_BUFFER_LEN`] bytes.
    pub fn new(descriptors: Descriptors<'a>, buffer: &'a mut [u8], config: &Config) -> Self {
        ControlEngine {
            descriptors,
            buffer,
            max_packet_size: config.max_packet_size.max(1) as usize,
            stage: Stage::AwaitingSetup,
            request: Request::default(),
            total_transferred: 0,
            data_len: 0,
            handler: None,
            address: 0,
            pending_address: None,
            halted: false,
            configuration: 0,
            remote_wakeup: false,
        }
    }

    /// The transaction stage
    ///
    /// A stall leaves the stage as it was. Check
    /// [`is_halted()`](ControlEngine::is_halted) to tell a stalled
    /// transaction from a live one.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Indicates if endpoint zero is stalled, waiting for the next SETUP
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The most recent request
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Bytes moved in the current data stage
    pub fn total_transferred(&self) -> usize {
        self.total_transferred
    }

    /// The device address in effect
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The selected configuration, or zero if unconfigured
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Indicates if the host allowed remote wakeup
    pub fn remote_wakeup(&self) -> bool {
        self.remote_wakeup
    }

    /// Return to the default state after a bus reset
    pub fn reset(&mut self) {
        self.stage = Stage::AwaitingSetup;
        self.total_transferred = 0;
        self.data_len = 0;
        self.handler = None;
        self.address = 0;
        self.pending_address = None;
        self.halted = false;
        self.configuration = 0;
        self.remote_wakeup = false;
    }

    /// Start a new control transaction
    ///
    /// Any transaction in progress is abandoned.
    pub fn on_setup_received<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        classes: &mut [&mut dyn ClassDriver<B>],
        raw: &[u8; Request::LEN],
    ) {
        let request = Request::parse(raw);
        if self.stage != Stage::AwaitingSetup {
            debug!("EP0 SETUP preempts request 0x{:x}", self.request.request);
        }
        self.stage = Stage::AwaitingSetup;
        self.request = request;
        self.total_transferred = 0;
        self.data_len = 0;
        self.handler = None;
        self.pending_address = None;
        self.halted = false;

        trace!(
            "EP0 SETUP type=0x{:x} req=0x{:x} value=0x{:x} index=0x{:x} len={}",
            request.request_type,
            request.request,
            request.value,
            request.index,
            request.length
        );

        let result = self
            .setup(hw, classes, &request)
            .and_then(|reply_len| self.begin(hw, reply_len));
        if result.is_err() {
            debug!("EP0 STALL req=0x{:x}", request.request);
            self.stall(hw);
        }
    }

    /// Advance the transaction after an endpoint zero transfer finished
    pub fn on_transfer_complete<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        classes: &mut [&mut dyn ClassDriver<B>],
        endpoint: EndpointAddress,
        bytes: usize,
        result: TransferResult,
    ) {
        if endpoint.index() != 0 {
            return;
        }
        if self.halted {
            trace!("EP0 completion while stalled");
            return;
        }
        if !result.is_success() {
            warn!("EP0 transfer failed in stage {}", self.stage as u8);
            self.stage = Stage::AwaitingSetup;
            return;
        }

        match self.stage {
            Stage::AwaitingSetup => trace!("EP0 stale completion"),
            Stage::Status if endpoint == self.status_endpoint() => {
                if bytes != 0 {
                    warn!("EP0 status stage moved {} bytes", bytes);
                }
                self.stage = Stage::AwaitingSetup;
                if let Some(address) = self.pending_address.take() {
                    hw.set_device_address(address);
                    self.address = address;
                    debug!("ADDRESS {}", address);
                }
            }
            Stage::Data if endpoint == self.data_endpoint() => {
                if self.data_complete(hw, classes, bytes).is_err() {
                    debug!("EP0 STALL in data stage");
                    self.stall(hw);
                }
            }
            _ => trace!("EP0 completion on unexpected direction"),
        }
    }

    fn data_endpoint(&self) -> EndpointAddress {
        match self.request.direction() {
            UsbDirection::In => ep0_in(),
            UsbDirection::Out => ep0_out(),
        }
    }

    /// The status handshake moves opposite to the data direction
    fn status_endpoint(&self) -> EndpointAddress {
        match self.request.direction() {
            UsbDirection::In => ep0_out(),
            UsbDirection::Out => ep0_in(),
        }
    }

    fn stall<B: HardwareBackend>(&mut self, hw: &mut B) {
        hw.stall(ep0_in());
        hw.stall(ep0_out());
        self.halted = true;
        self.pending_address = None;
    }

    /// Transition out of the SETUP stage
    fn begin<B: HardwareBackend>(&mut self, hw: &mut B, reply_len: usize) -> Result<()> {
        if self.request.length == 0 {
            return self.enter_status(hw);
        }
        self.stage = Stage::Data;
        match self.request.direction() {
            UsbDirection::In => {
                self.data_len = reply_len
                    .min(self.request.length as usize)
                    .min(self.buffer.len());
                self.next_chunk(hw)
            }
            UsbDirection::Out => {
                self.data_len = self.request.length as usize;
                self.next_chunk(hw)
            }
        }
    }

    fn enter_status<B: HardwareBackend>(&mut self, hw: &mut B) -> Result<()> {
        self.stage = Stage::Status;
        hw::zero_length(hw, self.status_endpoint())
    }

    /// Schedule the next data stage packet
    ///
    /// An IN reply that ends on a packet boundary, short of `wLength`, ends
    /// with a zero-length packet.
    fn next_chunk<B: HardwareBackend>(&mut self, hw: &mut B) -> Result<()> {
        let start = self.total_transferred;
        let len = (self.data_len - start).min(self.max_packet_size);
        let endpoint = self.data_endpoint();
        if len == 0 {
            return hw::zero_length(hw, endpoint);
        }
        let chunk = NonNull::from(&mut self.buffer[start..start + len]).cast();
        // Safety: the buffer is borrowed for 'a, and the engine doesn't touch
        // this chunk until the transfer completes, or a SETUP replaces the
        // transaction.
        unsafe { hw.start_transfer(endpoint, chunk, len) }
    }

    fn data_complete<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        classes: &mut [&mut dyn ClassDriver<B>],
        bytes: usize,
    ) -> Result<()> {
        let bytes = bytes.min(self.data_len - self.total_transferred);
        self.total_transferred += bytes;
        trace!("EP0 DATA {} of {}", self.total_transferred, self.request.length);

        let done = self.total_transferred == self.request.length as usize
            || bytes < self.max_packet_size;
        if !done {
            return self.next_chunk(hw);
        }

        if self.request.direction() == UsbDirection::Out {
            let request = self.request;
            let data = &self.buffer[..self.total_transferred];
            let class = self
                .handler
                .and_then(|index| classes.get_mut(index))
                .ok_or(UsbError::Unsupported)?;
            class.control_data_out(hw, &request, data)?;
        }
        self.enter_status(hw)
    }

    /// Handle a SETUP packet, returning the IN reply length
    fn setup<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        classes: &mut [&mut dyn ClassDriver<B>],
        request: &Request,
    ) -> Result<usize> {
        if request.direction() == UsbDirection::Out && request.length as usize > self.buffer.len() {
            return Err(UsbError::BufferOverflow);
        }
        match (request.kind(), request.recipient()) {
            (RequestType::Standard, Recipient::Device) => self.standard_device(hw, classes, request),
            (RequestType::Standard, Recipient::Endpoint) => self.standard_endpoint(hw, request),
            (RequestType::Standard, Recipient::Interface)
                if request.request == standard::GET_STATUS =>
            {
                if classes.iter().any(|c| c.owns_interface(request.interface())) {
                    Ok(reply(self.buffer, &[0, 0]))
                } else {
                    Err(UsbError::InvalidEndpoint)
                }
            }
            _ => self.class_request(hw, classes, request),
        }
    }

    fn standard_device<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        classes: &mut [&mut dyn ClassDriver<B>],
        request: &Request,
    ) -> Result<usize> {
        match request.request {
            standard::GET_STATUS => {
                let status =
                    self.descriptors.self_powered() as u8 | (self.remote_wakeup as u8) << 1;
                Ok(reply(self.buffer, &[status, 0]))
            }
            standard::CLEAR_FEATURE | standard::SET_FEATURE
                if request.value == feature::DEVICE_REMOTE_WAKEUP =>
            {
                self.remote_wakeup = request.request == standard::SET_FEATURE;
                Ok(0)
            }
            standard::SET_ADDRESS => {
                if request.value > MAX_DEVICE_ADDRESS || request.length != 0 {
                    return Err(UsbError::InvalidState);
                }
                let address = request.value as u8;
                if B::QUIRK_SET_ADDRESS_BEFORE_STATUS {
                    hw.set_device_address(address);
                    self.address = address;
                    debug!("ADDRESS {}", address);
                } else {
                    self.pending_address = Some(address);
                }
                Ok(0)
            }
            standard::GET_DESCRIPTOR => self.get_descriptor(request),
            standard::GET_CONFIGURATION => Ok(reply(self.buffer, &[self.configuration])),
            standard::SET_CONFIGURATION => {
                self.set_configuration(hw, classes, request.value)?;
                Ok(0)
            }
            _ => Err(UsbError::Unsupported),
        }
    }

    fn get_descriptor(&mut self, request: &Request) -> Result<usize> {
        let (kind, index) = request.descriptor_type_index();
        match kind {
            descriptor_type::DEVICE => Ok(reply(self.buffer, self.descriptors.device())),
            descriptor_type::CONFIGURATION if index == 0 => {
                Ok(reply(self.buffer, self.descriptors.configuration()))
            }
            descriptor_type::STRING => self
                .descriptors
                .write_string(index, self.buffer)
                .ok_or(UsbError::InvalidEndpoint),
            _ => Err(UsbError::Unsupported),
        }
    }

    fn set_configuration<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        classes: &mut [&mut dyn ClassDriver<B>],
        value: u16,
    ) -> Result<()> {
        if value == self.configuration as u16 {
            return Ok(());
        }
        if value == 0 {
            self.configuration = 0;
            classes.iter_mut().for_each(|class| class.reset());
            debug!("UNCONFIGURED");
            return Ok(());
        }
        if value != self.descriptors.configuration_value() as u16 {
            return Err(UsbError::InvalidState);
        }
        if self.configuration != 0 {
            classes.iter_mut().for_each(|class| class.reset());
        }
        self.configuration = value as u8;
        for class in classes.iter_mut() {
            class.configure(hw, self.configuration)?;
        }
        debug!("CONFIGURED {}", self.configuration);
        Ok(())
    }

    fn standard_endpoint<B: HardwareBackend>(&mut self, hw: &mut B, request: &Request) -> Result<usize> {
        let endpoint = request.endpoint();
        match request.request {
            standard::GET_STATUS => {
                let halted = hw.is_stalled(endpoint) as u8;
                Ok(reply(self.buffer, &[halted, 0]))
            }
            standard::CLEAR_FEATURE if request.value == feature::ENDPOINT_HALT => {
                hw.clear_stall(endpoint);
                Ok(0)
            }
            standard::SET_FEATURE if request.value == feature::ENDPOINT_HALT => {
                hw.stall(endpoint);
                Ok(0)
            }
            _ => Err(UsbError::Unsupported),
        }
    }

    fn class_request<B: HardwareBackend>(
        &mut self,
        hw: &mut B,
        classes: &mut [&mut dyn ClassDriver<B>],
        request: &Request,
    ) -> Result<usize> {
        let index = match request.recipient() {
            Recipient::Interface => classes
                .iter()
                .position(|class| class.owns_interface(request.interface())),
            Recipient::Endpoint => classes
                .iter()
                .position(|class| class.owns_endpoint(request.endpoint())),
            _ => None,
        }
        .ok_or(UsbError::Unsupported)?;
        self.handler = Some(index);
        classes[index].control_setup(hw, request, self.buffer)
    }
}

#[cfg(test)]
mod test {
    use super::{
        descriptors::test::{CONFIGURATION, DEVICE},
        ClassDriver, ControlEngine, Descriptors, Request, Stage,
    };
    use crate::{
        config::Config,
        hw::{ep0_in, ep0_out, HardwareBackend, TransferResult},
        mock::MockBackend,
    };
    use std::vec::Vec;
    use usb_device::{endpoint::EndpointAddress, Result, UsbError};

    /// Owns interface 0, echoes back what the host stored
    #[derive(Default)]
    struct Echo {
        stored: Vec<u8>,
        configured: Option<u8>,
        resets: usize,
    }

    impl ClassDriver<MockBackend> for Echo {
        fn owns_interface(&self, interface: u8) -> bool {
            interface == 0
        }
        fn owns_endpoint(&self, _: EndpointAddress) -> bool {
            false
        }
        fn reset(&mut self) {
            self.resets += 1;
            self.configured = None;
        }
        fn configure(&mut self, _: &mut MockBackend, configuration: u8) -> Result<()> {
            self.configured = Some(configuration);
            Ok(())
        }
        fn control_setup(
            &mut self,
            _: &mut MockBackend,
            request: &Request,
            data: &mut [u8],
        ) -> Result<usize> {
            match request.request {
                // Store
                0x01 => Ok(0),
                // Load
                0x02 => {
                    data[..self.stored.len()].copy_from_slice(&self.stored);
                    Ok(self.stored.len())
                }
                _ => Err(UsbError::Unsupported),
            }
        }
        fn control_data_out(
            &mut self,
            _: &mut MockBackend,
            _: &Request,
            data: &[u8],
        ) -> Result<()> {
            self.stored = data.to_vec();
            Ok(())
        }
        fn transfer_complete(&mut self, _: &mut MockBackend, _: EndpointAddress, _: usize, _: TransferResult) {}
    }

    fn config(max_packet_size: u16) -> Config {
        Config {
            max_packet_size,
            ..Config::default()
        }
    }

    fn complete_last(engine: &mut ControlEngine, hw: &mut MockBackend, class: &mut Echo) {
        let last = hw.transfers.last().unwrap().clone();
        engine.on_transfer_complete(
            hw,
            &mut [class],
            last.endpoint,
            last.len,
            TransferResult::Success,
        );
    }

    const GET_DEVICE_DESCRIPTOR: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];

    #[test]
    fn device_descriptor_in_three_packets() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(8));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &GET_DEVICE_DESCRIPTOR);
        assert_eq!(engine.stage(), Stage::Data);

        let mut totals = Vec::new();
        while engine.stage() == Stage::Data {
            complete_last(&mut engine, &mut hw, &mut class);
            totals.push(engine.total_transferred());
        }
        assert_eq!(totals, [8, 16, 18]);
        assert_eq!(engine.stage(), Stage::Status);

        let sent: Vec<u8> = hw.on(ep0_in()).iter().flat_map(|t| t.data.clone()).collect();
        assert_eq!(sent, DEVICE);
        assert_eq!(hw.lengths(), [8, 8, 2, 0]);
        assert_eq!(hw.transfers[3].endpoint, ep0_out());

        complete_last(&mut engine, &mut hw, &mut class);
        assert_eq!(engine.stage(), Stage::AwaitingSetup);
        assert!(hw.stalled.is_empty());
    }

    #[test]
    fn short_wlength_truncates_reply() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        // Hosts often ask for the first 8 bytes only.
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00]);
        assert_eq!(hw.lengths(), [8]);
        complete_last(&mut engine, &mut hw, &mut class);
        assert_eq!(engine.total_transferred(), 8);
        assert_eq!(engine.stage(), Stage::Status);
    }

    #[test]
    fn reply_on_packet_boundary_ends_with_zlp() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(8));
        let mut hw = MockBackend::new();
        let mut class = Echo { stored: std::vec![0xAB; 16], ..Echo::default() };

        // Load, wLength 64, reply of 16
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0xA1, 0x02, 0, 0, 0, 0, 64, 0]);
        while engine.stage() == Stage::Data {
            complete_last(&mut engine, &mut hw, &mut class);
            assert!(engine.total_transferred() <= 64);
        }
        assert_eq!(hw.lengths(), [8, 8, 0, 0]);
        assert_eq!(hw.transfers[2].endpoint, ep0_in());
        assert_eq!(hw.transfers[3].endpoint, ep0_out());
    }

    #[test]
    fn zero_length_request_goes_straight_to_status() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(engine.stage(), Stage::Status);
        assert_eq!(hw.lengths(), [0]);
        assert_eq!(hw.transfers[0].endpoint, ep0_in());
        assert_eq!(engine.configuration(), 1);
        assert_eq!(class.configured, Some(1));

        complete_last(&mut engine, &mut hw, &mut class);
        assert_eq!(engine.stage(), Stage::AwaitingSetup);
    }

    #[test]
    fn set_address_after_status() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(hw.address, None, "address applies after the status stage");
        complete_last(&mut engine, &mut hw, &mut class);
        assert_eq!(hw.address, Some(7));
        assert_eq!(engine.address(), 7);
    }

    #[test]
    fn set_address_with_quirk() {
        #[derive(Default)]
        struct Latching(MockBackend);
        impl HardwareBackend for Latching {
            const QUIRK_SET_ADDRESS_BEFORE_STATUS: bool = true;
            fn open_endpoint(&mut self, d: &crate::hw::EndpointDescriptor) -> Result<EndpointAddress> {
                self.0.open_endpoint(d)
            }
            unsafe fn start_transfer(&mut self, ep: EndpointAddress, buf: core::ptr::NonNull<u8>, len: usize) -> Result<()> {
                self.0.start_transfer(ep, buf, len)
            }
            fn stall(&mut self, ep: EndpointAddress) {
                self.0.stall(ep)
            }
            fn clear_stall(&mut self, ep: EndpointAddress) {
                self.0.clear_stall(ep)
            }
            fn is_stalled(&self, ep: EndpointAddress) -> bool {
                self.0.is_stalled(ep)
            }
            fn set_device_address(&mut self, address: u8) {
                self.0.set_device_address(address)
            }
        }

        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = Latching::default();
        engine.on_setup_received(&mut hw, &mut [], &[0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(hw.0.address, Some(7));
        assert_eq!(engine.stage(), Stage::Status);
    }

    #[test]
    fn preempted_set_address_is_forgotten() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]);
        // SET_FEATURE(DEVICE_REMOTE_WAKEUP) before the status stage finished
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x00, 0x03, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(engine.stage(), Stage::Status);
        complete_last(&mut engine, &mut hw, &mut class);

        assert_eq!(engine.stage(), Stage::AwaitingSetup);
        assert!(engine.remote_wakeup());
        assert_eq!(hw.address, None);
        assert_eq!(engine.address(), 0);
    }

    #[test]
    fn stall_in_data_stage_waits_for_setup() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(8));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &GET_DEVICE_DESCRIPTOR);
        hw.fail_next = true;
        complete_last(&mut engine, &mut hw, &mut class);
        assert!(engine.is_halted());
        assert!(hw.is_stalled(ep0_in()));
        assert_eq!(engine.stage(), Stage::Data);
        assert_eq!(engine.total_transferred(), 8);

        // Late completions don't revive the transaction.
        engine.on_transfer_complete(&mut hw, &mut [&mut class], ep0_in(), 8, TransferResult::Success);
        assert_eq!(engine.total_transferred(), 8);
        assert_eq!(hw.lengths(), [8]);

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x80, 0x08, 0, 0, 0, 0, 1, 0]);
        assert!(!engine.is_halted());
        assert_eq!(engine.stage(), Stage::Data);
        assert_eq!(hw.last_on(ep0_in()).unwrap().data, [0]);
    }

    #[test]
    fn setup_preempts_data_stage() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(8));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &GET_DEVICE_DESCRIPTOR);
        complete_last(&mut engine, &mut hw, &mut class);
        assert_eq!(engine.total_transferred(), 8);

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x80, 0x08, 0, 0, 0, 0, 1, 0]);
        assert_eq!(engine.total_transferred(), 0);
        assert_eq!(engine.request().request, 0x08);
        assert_eq!(engine.stage(), Stage::Data);
        assert_eq!(hw.last_on(ep0_in()).unwrap().data, [0]);
    }

    #[test]
    fn unsupported_requests_stall() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        // Device qualifier
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x80, 0x06, 0x00, 0x06, 0x00, 0x00, 0x0A, 0x00]);
        assert_eq!(engine.stage(), Stage::AwaitingSetup);
        assert!(hw.is_stalled(ep0_in()) && hw.is_stalled(ep0_out()));
        assert!(engine.is_halted());
        assert!(hw.transfers.is_empty());

        // Class request for an interface nobody owns
        hw.stalled.clear();
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x21, 0x01, 0, 0, 0x04, 0, 0, 0]);
        assert!(hw.is_stalled(ep0_in()));

        // OUT data stage larger than the control buffer
        hw.stalled.clear();
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x21, 0x01, 0, 0, 0, 0, 0x00, 0x02]);
        assert!(hw.is_stalled(ep0_out()));
        assert!(hw.transfers.is_empty());
    }

    #[test]
    fn out_data_stage_reaches_class() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(8));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        let payload: Vec<u8> = (0..12).collect();
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x21, 0x01, 0, 0, 0, 0, 12, 0]);
        assert_eq!(engine.stage(), Stage::Data);

        for chunk in payload.chunks(8) {
            let transfer = hw.last_on(ep0_out()).unwrap().clone();
            assert_eq!(transfer.len, chunk.len());
            transfer.fill(chunk);
            engine.on_transfer_complete(&mut hw, &mut [&mut class], ep0_out(), chunk.len(), TransferResult::Success);
        }
        assert_eq!(class.stored, payload);
        assert_eq!(engine.stage(), Stage::Status);
        assert_eq!(hw.transfers.last().unwrap().endpoint, ep0_in());
        assert_eq!(hw.transfers.last().unwrap().len, 0);
    }

    #[test]
    fn endpoint_halt_features() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();
        let ep = EndpointAddress::from(0x82);

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x02, 0x03, 0, 0, 0x82, 0, 0, 0]);
        assert!(hw.is_stalled(ep));

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x82, 0x00, 0, 0, 0x82, 0, 2, 0]);
        assert_eq!(hw.last_on(ep0_in()).unwrap().data, [1, 0]);

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x02, 0x01, 0, 0, 0x82, 0, 0, 0]);
        assert!(!hw.is_stalled(ep));
    }

    #[test]
    fn device_status_and_configuration() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x80, 0x00, 0, 0, 0, 0, 2, 0]);
        assert_eq!(hw.last_on(ep0_in()).unwrap().data, [1, 0], "self-powered");

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x00, 0x09, 0x02, 0, 0, 0, 0, 0]);
        assert!(hw.is_stalled(ep0_in()), "no such configuration");
        assert_eq!(engine.configuration(), 0);

        hw.stalled.clear();
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x00, 0x09, 0x01, 0, 0, 0, 0, 0]);
        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x80, 0x08, 0, 0, 0, 0, 1, 0]);
        assert_eq!(hw.last_on(ep0_in()).unwrap().data, [1]);

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x00, 0x09, 0x00, 0, 0, 0, 0, 0]);
        assert_eq!(engine.configuration(), 0);
        assert_eq!(class.resets, 1);
    }

    #[test]
    fn configuration_descriptor_uses_total_length() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(64));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &[0x80, 0x06, 0x00, 0x02, 0, 0, 0xFF, 0]);
        complete_last(&mut engine, &mut hw, &mut class);
        assert_eq!(engine.stage(), Stage::Status);
        assert_eq!(hw.transfers[0].data, CONFIGURATION);
    }

    #[test]
    fn failed_transfer_abandons_transaction() {
        let mut buffer = [0; 256];
        let mut engine = ControlEngine::new(Descriptors::new(&DEVICE, &CONFIGURATION), &mut buffer, &config(8));
        let mut hw = MockBackend::new();
        let mut class = Echo::default();

        engine.on_setup_received(&mut hw, &mut [&mut class], &GET_DEVICE_DESCRIPTOR);
        engine.on_transfer_complete(&mut hw, &mut [&mut class], ep0_in(), 0, TransferResult::Failed);
        assert_eq!(engine.stage(), Stage::AwaitingSetup);
    }
}
