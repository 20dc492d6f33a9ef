//! A hardware-agnostic USB device engine
//!
//! `usbd-engine` implements the parts of a USB device stack that don't depend
//! on a particular controller:
//!
//! - a [control transfer engine](control::ControlEngine) for endpoint zero,
//!   which handles enumeration and routes class requests,
//! - a [circular transfer buffer](buffer::TransferBuffer) that streams
//!   application bytes into hardware transfers,
//! - [network functions](net): CDC-NCM, CDC-ECM, and RNDIS.
//!
//! Controllers plug in through the [`HardwareBackend`](hw::HardwareBackend)
//! trait. The backend reports bus activity as [`Event`](hw::Event)s; a
//! [`Device`](device::Device) routes those events into the engine and the
//! class drivers.
//!
//! Transfer memory must outlive the transfers that use it. See
//! [`StaticMemory`] for statically-allocated, word-aligned memory, and
//! [`Shared`] to reach components from both interrupt and task contexts.
//!
//! # Features
//!
//! - `log`: log through the [`log`](https://crates.io/crates/log) facade.
//! - `defmt-03`: log through `defmt` 0.3, and derive `defmt::Format` on public
//!   types.
//!
//! Only enable logging when you're certain that your logger isn't using USB.

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod memory;
mod shared;

#[cfg(test)]
mod mock;

pub mod buffer;
pub mod config;
pub mod control;
pub mod device;
pub mod hw;
pub mod net;

pub use buffer::TransferBuffer;
pub use config::{Config, ConfigError, NetConfig};
pub use control::{ClassDriver, ControlEngine};
pub use device::Device;
pub use hw::{Event, HardwareBackend, TransferResult};
pub use memory::StaticMemory;
pub use shared::Shared;
