// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A host controller model for integration tests.
//!
//! `Bus` wires a `SimSie` to the full engine the way the firmware does: the
//! dispatcher runs whenever the interrupt line is up, then the main loop
//! services the queue. Every token the host sends is followed by one such
//! "interrupt, then main loop" step, so the device always gets to react
//! before the next token.

#![allow(dead_code)]

use generic_hid_usb::sim::{Handshake, SimSie};
use generic_hid_usb::{EventQueue, InterruptDispatcher, UsbDevice, GENERIC_HID};

pub const EP0_SIZE: usize = 8;

/// Why a control transfer didn't complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    Stall,
    /// The device never armed the endpoint the host needed.
    Nak,
}

pub struct Bus {
    pub sie: SimSie,
    pub usb: UsbDevice,
    pub events: EventQueue<16>,
    pub dispatcher: InterruptDispatcher,
    /// Packets seen in the last IN data stage, for checking chunking.
    pub last_packets: Vec<Vec<u8>>,
}

impl Bus {
    /// A device that has been initialized and attached, but not reset yet.
    pub fn attached() -> Self {
        let mut sie = SimSie::new();
        let mut usb = UsbDevice::new(&GENERIC_HID).unwrap();
        usb.initialize_usb(&mut sie);
        usb.enable_usb_module(&mut sie);
        Self {
            sie,
            usb,
            events: EventQueue::new(),
            dispatcher: InterruptDispatcher::new(),
            last_packets: Vec::new(),
        }
    }

    /// Attached and reset: in the Default state, ready for control traffic.
    pub fn reset() -> Self {
        let mut bus = Self::attached();
        bus.bus_reset();
        bus
    }

    /// Reset, addressed as 5 and configured.
    pub fn configured() -> Self {
        let mut bus = Self::reset();
        bus.control_out(set_address(5), &[]).unwrap();
        bus.control_out(set_configuration(1), &[]).unwrap();
        bus
    }

    /// One interrupt (if the line is up) followed by one main loop pass.
    pub fn step(&mut self) {
        if self.sie.interrupt_line() {
            self.dispatcher.capture(&mut self.sie, &self.events);
        }
        self.usb.service(&mut self.sie, &self.events);
    }

    pub fn bus_reset(&mut self) {
        self.sie.host_reset();
        self.step();
    }

    pub fn setup(&mut self, packet: [u8; 8]) {
        assert_eq!(self.sie.host_setup(packet), Handshake::Ack);
        self.step();
    }

    /// Runs a control read: SETUP, IN data packets until a short one or
    /// `wLength` bytes, then the zero-length OUT status. With a `wLength` of
    /// zero there is no data stage and the device sends the status packet.
    pub fn control_in(&mut self, packet: [u8; 8]) -> Result<Vec<u8>, Failure> {
        let length = usize::from(u16::from_le_bytes([packet[6], packet[7]]));
        self.setup(packet);
        self.last_packets.clear();
        if length == 0 {
            return match self.sie.host_in(0) {
                Handshake::Data(p) => {
                    assert!(p.as_slice().is_empty(), "status stage carried data");
                    self.step();
                    Ok(Vec::new())
                }
                Handshake::Stall => Err(Failure::Stall),
                _ => Err(Failure::Nak),
            };
        }
        let mut data = Vec::new();
        loop {
            match self.sie.host_in(0) {
                Handshake::Data(p) => {
                    let p = p.as_slice().to_vec();
                    let short = p.len() < EP0_SIZE;
                    data.extend_from_slice(&p);
                    self.last_packets.push(p);
                    self.step();
                    if short || data.len() >= length {
                        break;
                    }
                }
                Handshake::Stall => return Err(Failure::Stall),
                Handshake::Nak | Handshake::Ack => return Err(Failure::Nak),
            }
        }
        match self.sie.host_out(0, &[]) {
            Handshake::Ack => {
                self.step();
                Ok(data)
            }
            Handshake::Stall => Err(Failure::Stall),
            _ => Err(Failure::Nak),
        }
    }

    /// Runs a control write: SETUP, `data` in 8-byte OUT packets, then the
    /// zero-length IN status.
    pub fn control_out(&mut self, packet: [u8; 8], data: &[u8]) -> Result<(), Failure> {
        self.setup(packet);
        for chunk in data.chunks(EP0_SIZE) {
            match self.sie.host_out(0, chunk) {
                Handshake::Ack => self.step(),
                Handshake::Stall => return Err(Failure::Stall),
                _ => return Err(Failure::Nak),
            }
        }
        match self.sie.host_in(0) {
            Handshake::Data(p) => {
                assert!(p.as_slice().is_empty(), "status stage carried data");
                self.step();
                Ok(())
            }
            Handshake::Stall => Err(Failure::Stall),
            _ => Err(Failure::Nak),
        }
    }

    /// Sends one report on the interrupt OUT endpoint.
    pub fn send_report(&mut self, report: &[u8]) -> Handshake {
        let h = self.sie.host_out(1, report);
        self.step();
        h
    }

    /// Polls the interrupt IN endpoint once.
    pub fn poll_report(&mut self) -> Handshake {
        let h = self.sie.host_in(1);
        self.step();
        h
    }
}

pub fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [vl, vh] = value.to_le_bytes();
    let [il, ih] = index.to_le_bytes();
    let [ll, lh] = length.to_le_bytes();
    [request_type, request, vl, vh, il, ih, ll, lh]
}

pub fn get_descriptor(ty: u8, index: u8, length: u16) -> [u8; 8] {
    request(0x80, 0x06, u16::from(ty) << 8 | u16::from(index), 0, length)
}

pub fn set_address(address: u8) -> [u8; 8] {
    request(0x00, 0x05, u16::from(address), 0, 0)
}

pub fn set_configuration(value: u8) -> [u8; 8] {
    request(0x00, 0x09, u16::from(value), 0, 0)
}

pub fn get_configuration() -> [u8; 8] {
    request(0x80, 0x08, 0, 0, 1)
}
