// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static device configuration.
//!
//! Everything the engine needs to know about the device it is pretending to
//! be lives in one `DeviceConfiguration`, normally a `static`. The engine
//! never writes to it.

use crate::descriptors::{
    DescriptorSet, CONFIGURATION_VALUE, GENERIC_HID_DESCRIPTORS, HID_INTERFACE, HID_IN_ADDR,
    HID_OUT_ADDR, HID_REPORT_LEN,
};
use crate::usb::{UsbTransferType, EP0_IN_ADDR, EP0_MAX_PACKET_SIZE, EP0_OUT_ADDR};

/// One endpoint direction the engine manages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    /// Endpoint address, direction bit included.
    pub address: u8,
    pub transfer_type: UsbTransferType,
    /// Largest packet this endpoint moves, which is also the size of its
    /// buffer.
    pub capacity: u8,
}

pub struct DeviceConfiguration {
    pub descriptors: &'static DescriptorSet,
    /// Every endpoint direction, control endpoint included.
    pub endpoints: &'static [EndpointConfig],
    /// The single interface, served by the HID class adapter.
    pub hid_interface: u8,
    pub hid_in: u8,
    pub hid_out: u8,
    pub report_len: usize,
}

impl DeviceConfiguration {
    /// The value `SET_CONFIGURATION` must carry to configure the device.
    pub fn configuration_value(&self) -> u8 {
        self.descriptors.configuration_value()
    }
}

static GENERIC_HID_ENDPOINTS: [EndpointConfig; 4] = [
    EndpointConfig {
        address: EP0_OUT_ADDR,
        transfer_type: UsbTransferType::Control,
        capacity: EP0_MAX_PACKET_SIZE as u8,
    },
    EndpointConfig {
        address: EP0_IN_ADDR,
        transfer_type: UsbTransferType::Control,
        capacity: EP0_MAX_PACKET_SIZE as u8,
    },
    EndpointConfig {
        address: HID_IN_ADDR,
        transfer_type: UsbTransferType::Interrupt,
        capacity: HID_REPORT_LEN as u8,
    },
    EndpointConfig {
        address: HID_OUT_ADDR,
        transfer_type: UsbTransferType::Interrupt,
        capacity: HID_REPORT_LEN as u8,
    },
];

/// Configuration of our device: one Generic HID interface with a pair of
/// 8-byte interrupt endpoints.
pub static GENERIC_HID: DeviceConfiguration = DeviceConfiguration {
    descriptors: &GENERIC_HID_DESCRIPTORS,
    endpoints: &GENERIC_HID_ENDPOINTS,
    hid_interface: HID_INTERFACE,
    hid_in: HID_IN_ADDR,
    hid_out: HID_OUT_ADDR,
    report_len: HID_REPORT_LEN,
};
