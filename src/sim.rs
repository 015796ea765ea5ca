// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated SIE.
//!
//! `SimSie` behaves like the hardware as far as the engine can tell: it keeps
//! a four-deep transaction status queue, latches interrupt and bus error
//! flags, NAKs tokens for endpoints that aren't armed, and ignores the
//! address register until firmware writes it. The `host_*` methods play the
//! part of the host controller, one token at a time.

use crate::sie::{BusErrors, Interrupts, Sie, Transaction};
use crate::usb::{DataPid, TokenPid, UsbDir};

const ENDPOINTS: usize = 16;
const STATUS_DEPTH: usize = 4;
const MAX_PACKET: usize = 64;

/// A data packet as seen on the wire.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Packet {
    len: usize,
    data: [u8; MAX_PACKET],
}

impl Packet {
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_PACKET);
        let mut data = [0; MAX_PACKET];
        data[..len].copy_from_slice(&bytes[..len]);
        Self { len, data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Packet({:02x?})", self.as_slice())
    }
}

/// What the device answered to a token.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
    /// An IN token answered with data (the host's ACK is implied).
    Data(Packet),
}

#[derive(Copy, Clone)]
struct SimEndpoint {
    armed: bool,
    stalled: bool,
    capacity: usize,
    pid: DataPid,
    len: usize,
    data: [u8; MAX_PACKET],
}

impl SimEndpoint {
    const IDLE: Self = Self {
        armed: false,
        stalled: false,
        capacity: 0,
        pid: DataPid::Data0,
        len: 0,
        data: [0; MAX_PACKET],
    };
}

pub struct SimSie {
    flags: Interrupts,
    enabled: Interrupts,
    errors: BusErrors,
    status: [Option<Transaction>; STATUS_DEPTH],
    status_head: usize,
    status_len: usize,
    setup: [u8; 8],
    ins: [SimEndpoint; ENDPOINTS],
    outs: [SimEndpoint; ENDPOINTS],
    control_stalled: bool,
    address: u8,
    attached: bool,
    aggregate: bool,
    aggregate_clears: usize,
    last_in_pid: [Option<DataPid>; ENDPOINTS],
}

impl Default for SimSie {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSie {
    pub fn new() -> Self {
        Self {
            flags: Interrupts::empty(),
            enabled: Interrupts::empty(),
            errors: BusErrors::empty(),
            status: [None; STATUS_DEPTH],
            status_head: 0,
            status_len: 0,
            setup: [0; 8],
            ins: [SimEndpoint::IDLE; ENDPOINTS],
            outs: [SimEndpoint::IDLE; ENDPOINTS],
            control_stalled: false,
            address: 0,
            attached: false,
            aggregate: false,
            aggregate_clears: 0,
            last_in_pid: [None; ENDPOINTS],
        }
    }

    /// Host drives SE0 long enough to reset the device.
    pub fn host_reset(&mut self) {
        self.status = [None; STATUS_DEPTH];
        self.status_len = 0;
        self.ins = [SimEndpoint::IDLE; ENDPOINTS];
        self.outs = [SimEndpoint::IDLE; ENDPOINTS];
        self.control_stalled = false;
        self.address = 0;
        self.raise(Interrupts::RESET);
    }

    /// SETUP stage. The device must accept SETUP whatever state EP0 is in, so
    /// this only fails if the status queue is full.
    pub fn host_setup(&mut self, packet: [u8; 8]) -> Handshake {
        if self.status_len == STATUS_DEPTH {
            return Handshake::Nak;
        }
        self.setup = packet;
        self.control_stalled = false;
        self.ins[0].armed = false;
        self.outs[0].armed = false;
        self.push(Transaction {
            endpoint: 0,
            direction: UsbDir::Out,
            pid: TokenPid::Setup,
        });
        Handshake::Ack
    }

    pub fn host_out(&mut self, endpoint: u8, data: &[u8]) -> Handshake {
        let n = usize::from(endpoint) % ENDPOINTS;
        if self.outs[n].stalled || (n == 0 && self.control_stalled) {
            return Handshake::Stall;
        }
        let ep = &self.outs[n];
        if !ep.armed || data.len() > ep.capacity || self.status_len == STATUS_DEPTH {
            return Handshake::Nak;
        }
        let ep = &mut self.outs[n];
        ep.data[..data.len()].copy_from_slice(data);
        ep.len = data.len();
        ep.armed = false;
        self.push(Transaction {
            endpoint: n as u8,
            direction: UsbDir::Out,
            pid: TokenPid::Out,
        });
        Handshake::Ack
    }

    pub fn host_in(&mut self, endpoint: u8) -> Handshake {
        let n = usize::from(endpoint) % ENDPOINTS;
        if self.ins[n].stalled || (n == 0 && self.control_stalled) {
            return Handshake::Stall;
        }
        if !self.ins[n].armed || self.status_len == STATUS_DEPTH {
            return Handshake::Nak;
        }
        let ep = &mut self.ins[n];
        ep.armed = false;
        let packet = Packet::new(&ep.data[..ep.len]);
        self.push(Transaction {
            endpoint: n as u8,
            direction: UsbDir::In,
            pid: TokenPid::In,
        });
        Handshake::Data(packet)
    }

    pub fn host_sof(&mut self) {
        self.raise(Interrupts::SOF);
    }

    pub fn host_suspend(&mut self) {
        self.raise(Interrupts::IDLE);
    }

    pub fn host_resume(&mut self) {
        self.raise(Interrupts::ACTIVITY);
    }

    /// Latches bus error conditions, as a noisy cable would.
    pub fn inject_bus_errors(&mut self, errors: BusErrors) {
        self.errors |= errors;
        self.raise(Interrupts::ERROR);
    }

    /// The address the SIE currently answers to.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_armed(&self, address: u8) -> bool {
        self.endpoint(address).armed
    }

    pub fn is_stalled(&self, address: u8) -> bool {
        self.endpoint(address).stalled
    }

    pub fn control_stalled(&self) -> bool {
        self.control_stalled
    }

    /// Data PID the most recent IN packet on `endpoint` was armed with.
    pub fn last_in_pid(&self, endpoint: u8) -> Option<DataPid> {
        self.last_in_pid[usize::from(endpoint) % ENDPOINTS]
    }

    /// Whether the aggregate interrupt line is asserted.
    pub fn interrupt_line(&self) -> bool {
        self.aggregate
    }

    pub fn enabled(&self) -> Interrupts {
        self.enabled
    }

    /// Completed transactions the engine hasn't collected yet.
    pub fn queued_transactions(&self) -> usize {
        self.status_len
    }

    pub fn aggregate_clears(&self) -> usize {
        self.aggregate_clears
    }

    fn endpoint(&self, address: u8) -> &SimEndpoint {
        let n = usize::from(crate::usb::endpoint_number(address));
        match UsbDir::of_endpoint_addr(address) {
            UsbDir::In => &self.ins[n],
            UsbDir::Out => &self.outs[n],
        }
    }

    fn endpoint_mut(&mut self, address: u8) -> &mut SimEndpoint {
        let n = usize::from(crate::usb::endpoint_number(address));
        match UsbDir::of_endpoint_addr(address) {
            UsbDir::In => &mut self.ins[n],
            UsbDir::Out => &mut self.outs[n],
        }
    }

    fn push(&mut self, t: Transaction) {
        let slot = (self.status_head + self.status_len) % STATUS_DEPTH;
        self.status[slot] = Some(t);
        self.status_len += 1;
        self.raise(Interrupts::TRANSACTION);
    }

    fn raise(&mut self, which: Interrupts) {
        self.flags |= which;
        if self.enabled.intersects(which) {
            self.aggregate = true;
        }
    }
}

impl Sie for SimSie {
    fn attach(&mut self) {
        self.attached = true;
    }

    fn enable(&mut self, which: Interrupts) {
        self.enabled = which;
    }

    fn pending(&self) -> Interrupts {
        let mut flags = self.flags;
        flags.set(Interrupts::TRANSACTION, self.status_len > 0);
        flags & self.enabled
    }

    fn clear(&mut self, which: Interrupts) {
        self.flags.remove(which);
    }

    fn clear_aggregate(&mut self) {
        self.aggregate = false;
        self.aggregate_clears += 1;
    }

    fn take_bus_errors(&mut self) -> BusErrors {
        core::mem::replace(&mut self.errors, BusErrors::empty())
    }

    fn next_transaction(&mut self) -> Option<Transaction> {
        if self.status_len == 0 {
            return None;
        }
        let t = self.status[self.status_head].take();
        self.status_head = (self.status_head + 1) % STATUS_DEPTH;
        self.status_len -= 1;
        t
    }

    fn read_setup(&mut self) -> [u8; 8] {
        self.setup
    }

    fn read_out(&mut self, endpoint: u8, buf: &mut [u8]) -> usize {
        let ep = &self.outs[usize::from(endpoint) % ENDPOINTS];
        let n = ep.len.min(buf.len());
        buf[..n].copy_from_slice(&ep.data[..n]);
        ep.len
    }

    fn arm_in(&mut self, endpoint: u8, data: &[u8], pid: DataPid) {
        let n = usize::from(endpoint) % ENDPOINTS;
        let len = data.len().min(MAX_PACKET);
        let ep = &mut self.ins[n];
        ep.data[..len].copy_from_slice(&data[..len]);
        ep.len = len;
        ep.pid = pid;
        ep.armed = true;
        self.last_in_pid[n] = Some(pid);
    }

    fn arm_out(&mut self, endpoint: u8, capacity: usize, pid: DataPid) {
        let ep = &mut self.outs[usize::from(endpoint) % ENDPOINTS];
        ep.capacity = capacity.min(MAX_PACKET);
        ep.pid = pid;
        ep.len = 0;
        ep.armed = true;
    }

    fn disarm(&mut self, address: u8) {
        self.endpoint_mut(address).armed = false;
    }

    fn set_stall(&mut self, address: u8, stalled: bool) {
        self.endpoint_mut(address).stalled = stalled;
    }

    fn stall_control(&mut self) {
        self.control_stalled = true;
        self.ins[0].armed = false;
        self.outs[0].armed = false;
    }

    fn set_address(&mut self, address: u8) {
        self.address = address;
    }
}
