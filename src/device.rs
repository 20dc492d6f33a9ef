//! Event routing for a whole device
//!
//! A [`Device`] owns the hardware backend and the control engine. Feed it the
//! [`Event`]s that the backend raises, along with the class drivers that make
//! up the configuration:
//!
//! ```ignore
//! // In the USB interrupt handler. The controller driver translates its
//! // status registers into events; `next_event` stands in for that.
//! while let Some(event) = next_event(device.hw_mut()) {
//!     device.dispatch(&mut [&mut network], event);
//! }
//! ```
//!
//! [`HardwareBackend`] doesn't define how events are raised. Each controller
//! driver reports them in the way that suits its interrupt scheme.

use crate::{
    control::{ClassDriver, ControlEngine},
    hw::{Event, HardwareBackend},
};

/// A USB device: a controller, its control engine, and event routing
pub struct Device<'a, B: HardwareBackend> {
    hw: B,
    control: ControlEngine<'a>,
}

impl<'a, B: HardwareBackend> Device<'a, B> {
    /// Combine a controller with the engine that drives its endpoint zero
    pub fn new(hw: B, control: ControlEngine<'a>) -> Self {
        Device { hw, control }
    }

    /// Immutable access to the hardware backend
    pub fn hw(&self) -> &B {
        &self.hw
    }

    /// Mutable access to the hardware backend
    ///
    /// Class drivers need the backend to queue application data.
    pub fn hw_mut(&mut self) -> &mut B {
        &mut self.hw
    }

    /// The control engine, for inspecting enumeration state
    pub fn control(&self) -> &ControlEngine<'a> {
        &self.control
    }

    /// Indicates if the host selected a configuration
    pub fn is_configured(&self) -> bool {
        self.control.configuration() != 0
    }

    /// Route one hardware event
    ///
    /// Bus resets reach the engine and every class driver. Endpoint zero
    /// traffic goes to the engine. Other completions go to the class driver
    /// that owns the endpoint; completions nobody owns are dropped.
    pub fn dispatch(&mut self, classes: &mut [&mut dyn ClassDriver<B>], event: Event) {
        match event {
            Event::Reset => {
                debug!("RESET");
                self.control.reset();
                classes.iter_mut().for_each(|class| class.reset());
            }
            Event::Setup(raw) => self.control.on_setup_received(&mut self.hw, classes, &raw),
            Event::TransferComplete {
                endpoint,
                bytes,
                result,
            } => {
                if endpoint.index() == 0 {
                    self.control
                        .on_transfer_complete(&mut self.hw, classes, endpoint, bytes, result);
                } else if let Some(class) = classes
                    .iter_mut()
                    .find(|class| class.owns_endpoint(endpoint))
                {
                    class.transfer_complete(&mut self.hw, endpoint, bytes, result);
                } else {
                    debug!("EP{} completion without owner", endpoint.index());
                }
            }
        }
    }

    /// Release the hardware backend
    pub fn release(self) -> B {
        self.hw
    }
}
