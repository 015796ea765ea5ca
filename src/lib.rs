// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-side USB 2.0 full-speed engine for a single-interface Generic HID
//! device.
//!
//! The engine is split along the lines the hardware forces on it:
//!
//! - `dispatch` runs in the USB interrupt handler and only records what
//!   happened.
//! - `device` runs in the main loop and does the protocol work: control
//!   transfers on endpoint 0 (`control`), the chapter 9 state machine
//!   (`state`), buffer ownership (`endpoint`, `registry`) and the HID report
//!   endpoints (`hid`).
//! - `sie` is the line the engine never crosses to reach hardware. `sim`
//!   implements it in software for tests; `rp2040` implements it for real.
//!
//! Descriptors are static tables (`descriptors`, `config`) served verbatim.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod config;
pub mod control;
pub mod descriptors;
pub mod device;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod hid;
pub mod registry;
pub mod sie;
pub mod sim;
pub mod state;
pub mod usb;

#[cfg(feature = "rp2040")]
pub mod rp2040;

pub use config::{DeviceConfiguration, GENERIC_HID};
pub use device::UsbDevice;
pub use dispatch::{EventQueue, InterruptDispatcher, UsbEvent};
pub use error::Error;
pub use sie::Sie;
pub use state::DeviceState;
