// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB chapter 9 and HID 1.11 wire definitions.
//!
//! Everything here is plain data: packet layouts, request codes, and the
//! handful of bit-twiddling helpers needed to pick apart a SETUP packet.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

/// Maximum packet size of the default control endpoint on this device.
pub const EP0_MAX_PACKET_SIZE: usize = 8;

/// Standard feature selector: remote wakeup (device recipient).
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;
/// Standard feature selector: endpoint halt (endpoint recipient).
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 byte, and IN by an `0x80` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    /// Builds an endpoint address from an endpoint number.
    pub const fn endpoint(self, num: u8) -> u8 {
        (num & 0x0F) | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Strips the direction bit from an endpoint address.
pub const fn endpoint_number(addr: u8) -> u8 {
    addr & 0x0F
}

pub const EP0_OUT_ADDR: u8 = UsbDir::Out.endpoint(0);
pub const EP0_IN_ADDR: u8 = UsbDir::In.endpoint(0);

/// Token PIDs, as reported by the SIE for a completed transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TokenPid {
    Out = 0x1,
    In = 0x9,
    Setup = 0xD,
}

/// Data toggle for the next DATA packet on an endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataPid {
    Data0,
    Data1,
}

impl DataPid {
    pub fn toggled(self) -> Self {
        match self {
            Self::Data0 => Self::Data1,
            Self::Data1 => Self::Data0,
        }
    }
}

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct UsbSetupPacket {
    /// Direction (bit 7), kind (bits 6:5) and recipient (bits 4:0).
    pub request_type: u8,
    /// Request. Standard setup requests are in the `UsbSetupRequest` enum,
    /// HID class requests in `HidRequest`.
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// Interface or endpoint the request is aimed at, for requests that care.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

impl UsbSetupPacket {
    /// Reinterprets the raw bytes captured from EP0 OUT.
    pub fn parse(raw: &[u8; 8]) -> Option<Self> {
        LayoutVerified::<_, UsbSetupPacket>::new(&raw[..]).map(|lv| *lv.into_ref())
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1F)
    }

    /// High byte of `value`; the descriptor type for `GET_DESCRIPTOR`, the
    /// report type for `GET_REPORT`/`SET_REPORT`.
    pub fn value_high(&self) -> u8 {
        (self.value.get() >> 8) as u8
    }

    pub fn value_low(&self) -> u8 {
        self.value.get() as u8
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard requests from USB 2.0 table 9-4.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbSetupRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    /// Notifies the device that it's being moved to a different address on the
    /// bus. Always an OUT.
    SetAddress = 0x05,
    /// Asks the device to send a certain descriptor back to the host. Always
    /// used on an IN request.
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    /// Configures a device by choosing one of the options listed in its
    /// descriptors. Always an OUT.
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// HID 1.11 class requests, section 7.2.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HidRequest {
    GetReport = 0x01,
    GetIdle = 0x02,
    GetProtocol = 0x03,
    SetReport = 0x09,
    SetIdle = 0x0A,
    SetProtocol = 0x0B,
}

/// Report types carried in the high byte of `value` for report requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HidReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    Hid = 0x21,
    Report = 0x22,
}

/// Types of transfer that can be indicated by the `attributes` field on
/// `UsbEndpointDescriptor`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Interrupt = 3,
}
