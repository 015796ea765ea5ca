// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor layouts and the Generic HID descriptor tables.
//!
//! The engine treats descriptors as opaque read-only byte strings that it
//! serves verbatim. The structs here exist only so the tables can be written
//! with named fields instead of as anonymous byte soup; everything the engine
//! touches goes through `DescriptorSet::get`.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, U16};

use crate::usb::{UsbDescType, UsbDir, UsbTransferType};

/// Vendor ID (Microchip).
pub const VENDOR_ID: u16 = 0x04D8;
/// Product ID of the Generic HID demo.
pub const PRODUCT_ID: u16 = 0x01A5;
pub const RELEASE_NUMBER: u16 = 0x0001;

/// Size of every HID report in either direction, and of the interrupt
/// endpoints' packets.
pub const HID_REPORT_LEN: usize = 8;

/// The one configuration value this device accepts.
pub const CONFIGURATION_VALUE: u8 = 1;

pub const HID_INTERFACE: u8 = 0;
pub const HID_IN_ADDR: u8 = UsbDir::In.endpoint(1);
pub const HID_OUT_ADDR: u8 = UsbDir::Out.endpoint(1);

/// String descriptor indices.
const MANUFACTURER_S: u8 = 1;
const PRODUCT_S: u8 = 2;

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: UsbDescType,
    /// Version of the USB protocol, in binary-coded decimal.
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Packet size of EP0. Hosts read the first 8 bytes of this descriptor
    /// before they know this value, so it must sit within them.
    pub max_packet_size0: u8,
    pub vendor: U16<LittleEndian>,
    pub product: U16<LittleEndian>,
    /// Device version number, as BCD again.
    pub bcd_device: U16<LittleEndian>,
    pub manufacturer_s: u8,
    pub product_s: u8,
    pub serial_s: u8,
    pub num_configurations: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// Total length of all descriptors in this configuration, concatenated.
    pub total_length: U16<LittleEndian>,
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    pub configuration_s: u8,
    /// Bit 7 must be set. Bit 6 is self-powered, bit 5 remote wakeup.
    pub attributes: u8,
    /// Maximum device power consumption in units of 2mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_s: u8,
}

/// HID class descriptor, HID 1.11 section 6.2.1, with exactly one class
/// descriptor (the report descriptor).
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct HidDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub bcd_hid: U16<LittleEndian>,
    pub country_code: u8,
    pub num_descriptors: u8,
    pub report_type: UsbDescType,
    pub report_length: U16<LittleEndian>,
}

/// Describes an endpoint within an interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbEndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// Bottom 4 bits are the endpoint number, the top bit distinguishes IN
    /// (1) from OUT (0).
    pub endpoint_address: u8,
    /// Transfer type in the bottom 2 bits, see `UsbTransferType`.
    pub attributes: u8,
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval in frames (milliseconds at full speed).
    pub interval: u8,
}

/// The full configuration as the host reads it: every descriptor back to
/// back, in the order the host expects to walk them.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct HidConfiguration {
    pub config: UsbConfigurationDescriptor,
    pub interface: UsbInterfaceDescriptor,
    pub hid: HidDescriptor,
    pub ep_in: UsbEndpointDescriptor,
    pub ep_out: UsbEndpointDescriptor,
}

const fn le(v: u16) -> U16<LittleEndian> {
    U16::from_bytes(v.to_le_bytes())
}

pub static DEVICE_DESCRIPTOR: UsbDeviceDescriptor = UsbDeviceDescriptor {
    length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
    descriptor_type: UsbDescType::Device,
    bcd_usb: le(0x0200),
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: crate::usb::EP0_MAX_PACKET_SIZE as u8,
    vendor: le(VENDOR_ID),
    product: le(PRODUCT_ID),
    bcd_device: le(RELEASE_NUMBER),
    manufacturer_s: MANUFACTURER_S,
    product_s: PRODUCT_S,
    serial_s: 0,
    num_configurations: 1,
};

pub static HID_REPORT_DESCRIPTOR: [u8; 47] = [
    0x06, 0xA0, 0xFF, // USAGE_PAGE (Vendor Defined Page 1)
    0x09, 0x01, // USAGE (Vendor Usage 1)
    0xA1, 0x01, // COLLECTION (Application)
    // Input report
    0x09, 0x01, // USAGE (vendor defined)
    0x15, 0x00, // LOGICAL_MINIMUM (0)
    0x26, 0xFF, 0x00, // LOGICAL_MAXIMUM (255)
    0x75, 0x08, // REPORT_SIZE (8)
    0x95, HID_REPORT_LEN as u8, // REPORT_COUNT
    0x81, 0x02, // INPUT (Data,Var,Abs)
    // Output report
    0x09, 0x01, // USAGE (vendor defined)
    0x15, 0x00, // LOGICAL_MINIMUM (0)
    0x26, 0xFF, 0x00, // LOGICAL_MAXIMUM (255)
    0x75, 0x08, // REPORT_SIZE (8)
    0x95, HID_REPORT_LEN as u8, // REPORT_COUNT
    0x91, 0x02, // OUTPUT (Data,Var,Abs)
    // Feature report
    0x09, 0x02, // USAGE (vendor defined)
    0x15, 0x00, // LOGICAL_MINIMUM (0)
    0x26, 0xFF, 0x00, // LOGICAL_MAXIMUM (255)
    0x75, 0x08, // REPORT_SIZE (8)
    0x95, HID_REPORT_LEN as u8, // REPORT_COUNT
    0xB1, 0x02, // FEATURE (Data,Var,Abs)
    0xC0, // END_COLLECTION
];

pub static CONFIGURATION: HidConfiguration = HidConfiguration {
    config: UsbConfigurationDescriptor {
        length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
        descriptor_type: UsbDescType::Config,
        total_length: le(core::mem::size_of::<HidConfiguration>() as u16),
        num_interfaces: 1,
        configuration_value: CONFIGURATION_VALUE,
        configuration_s: 0,
        attributes: 0xA0,
        max_power: 0x32,
    },
    interface: UsbInterfaceDescriptor {
        length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: HID_INTERFACE,
        alternate_setting: 0,
        num_endpoints: 2,
        interface_class: 0x03,
        interface_subclass: 0,
        interface_protocol: 0,
        interface_s: 0,
    },
    hid: HidDescriptor {
        length: core::mem::size_of::<HidDescriptor>() as u8,
        descriptor_type: UsbDescType::Hid,
        bcd_hid: le(0x0111),
        country_code: 0,
        num_descriptors: 1,
        report_type: UsbDescType::Report,
        report_length: le(HID_REPORT_DESCRIPTOR.len() as u16),
    },
    ep_in: UsbEndpointDescriptor {
        length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: HID_IN_ADDR,
        attributes: UsbTransferType::Interrupt as u8,
        max_packet_size: le(HID_REPORT_LEN as u16),
        interval: 1,
    },
    ep_out: UsbEndpointDescriptor {
        length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: HID_OUT_ADDR,
        attributes: UsbTransferType::Interrupt as u8,
        max_packet_size: le(HID_REPORT_LEN as u16),
        interval: 1,
    },
};

/// Builds a string descriptor from ASCII text. `N` must be `2 + 2 * len`; a
/// mismatch fails const evaluation.
const fn string_descriptor<const N: usize>(text: &[u8]) -> [u8; N] {
    assert!(N == 2 + 2 * text.len());
    let mut out = [0; N];
    out[0] = N as u8;
    out[1] = UsbDescType::String as u8;
    let mut i = 0;
    while i < text.len() {
        out[2 + 2 * i] = text[i];
        i += 1;
    }
    out
}

/// Language table: US English only.
pub static LANGUAGES: [u8; 4] = [4, UsbDescType::String as u8, 0x09, 0x04];
pub static MANUFACTURER: [u8; 24] = string_descriptor(b"DIY Devices");
pub static PRODUCT: [u8; 54] = string_descriptor(b"16F1455 Generic HID Device");

static STRINGS: [&[u8]; 3] = [&LANGUAGES, &MANUFACTURER, &PRODUCT];

/// The descriptor collaborator: read-only byte strings looked up by type and
/// index.
#[derive(Copy, Clone, Debug)]
pub struct DescriptorSet {
    pub device: &'static UsbDeviceDescriptor,
    /// Configuration with its interface, class and endpoint descriptors
    /// appended.
    pub configuration: &'static HidConfiguration,
    pub report: &'static [u8],
    /// Index 0 is the language table.
    pub strings: &'static [&'static [u8]],
}

impl DescriptorSet {
    /// Resolves a descriptor by the type and index carried in a
    /// `GET_DESCRIPTOR` request.
    pub fn get(&self, ty: UsbDescType, index: u8) -> Option<&'static [u8]> {
        match ty {
            UsbDescType::Device if index == 0 => Some(self.device.as_bytes()),
            UsbDescType::Config if index == 0 => Some(self.configuration.as_bytes()),
            UsbDescType::String => self.strings.get(usize::from(index)).copied(),
            UsbDescType::Hid if index == 0 => Some(self.configuration.hid.as_bytes()),
            UsbDescType::Report if index == 0 => Some(self.report),
            _ => None,
        }
    }

    /// `bConfigurationValue` as written in the configuration descriptor.
    pub fn configuration_value(&self) -> u8 {
        self.configuration.config.configuration_value
    }
}

pub static GENERIC_HID_DESCRIPTORS: DescriptorSet = DescriptorSet {
    device: &DEVICE_DESCRIPTOR,
    configuration: &CONFIGURATION,
    report: &HID_REPORT_DESCRIPTOR,
    strings: &STRINGS,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_bytes() {
        assert_eq!(
            GENERIC_HID_DESCRIPTORS.get(UsbDescType::Device, 0).unwrap(),
            &[
                0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x08, 0xD8, 0x04, 0xA5, 0x01, 0x01,
                0x00, 0x01, 0x02, 0x00, 0x01
            ][..]
        );
    }

    #[test]
    fn configuration_is_self_describing() {
        let cfg = GENERIC_HID_DESCRIPTORS.get(UsbDescType::Config, 0).unwrap();
        assert_eq!(cfg.len(), 41);
        assert_eq!(u16::from_le_bytes([cfg[2], cfg[3]]), 41);
        assert_eq!(GENERIC_HID_DESCRIPTORS.configuration_value(), 1);
        // Interrupt endpoints, 8 bytes, 1ms.
        assert_eq!(&cfg[27..34], &[0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x01]);
        assert_eq!(&cfg[34..41], &[0x07, 0x05, 0x01, 0x03, 0x08, 0x00, 0x01]);
    }

    #[test]
    fn hid_descriptor_points_at_report() {
        let hid = GENERIC_HID_DESCRIPTORS.get(UsbDescType::Hid, 0).unwrap();
        assert_eq!(hid, &[0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x2F, 0x00]);
        let report = GENERIC_HID_DESCRIPTORS.get(UsbDescType::Report, 0).unwrap();
        assert_eq!(report.len(), 0x2F);
        assert_eq!(report.last(), Some(&0xC0));
    }

    #[test]
    fn strings_are_utf16() {
        let s = GENERIC_HID_DESCRIPTORS.get(UsbDescType::String, 1).unwrap();
        assert_eq!(s[0] as usize, s.len());
        assert_eq!(s[1], 0x03);
        assert_eq!(&s[2..6], b"D\0I\0");
        assert_eq!(
            GENERIC_HID_DESCRIPTORS.get(UsbDescType::String, 0),
            Some(&[4, 3, 0x09, 0x04][..])
        );
        assert_eq!(GENERIC_HID_DESCRIPTORS.get(UsbDescType::String, 3), None);
    }

    #[test]
    fn unknown_lookups_fail() {
        assert_eq!(GENERIC_HID_DESCRIPTORS.get(UsbDescType::Device, 1), None);
        assert_eq!(GENERIC_HID_DESCRIPTORS.get(UsbDescType::DeviceQualifier, 0), None);
        assert_eq!(GENERIC_HID_DESCRIPTORS.get(UsbDescType::Endpoint, 0), None);
    }
}
