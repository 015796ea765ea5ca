// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the protocol engine and the USB serial interface engine.
//!
//! The engine never pokes registers. Everything it needs from the hardware is
//! expressed as a method here, and each backend (the RP2040 peripheral, the
//! simulated SIE used by the tests) implements it.

use bitflags::bitflags;

use crate::usb::{DataPid, TokenPid, UsbDir};

bitflags! {
    /// Pending interrupt sources. The bit layout matches the classic `UIR`
    /// register found on small USB microcontrollers.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Interrupts: u8 {
        const RESET = 0x01;
        const ERROR = 0x02;
        /// Bus activity after idle; the host is resuming us.
        const ACTIVITY = 0x04;
        const TRANSACTION = 0x08;
        /// The bus has been idle for 3 ms; the host is suspending us.
        const IDLE = 0x10;
        const STALL = 0x20;
        const SOF = 0x40;
    }
}

impl Interrupts {
    /// Sources the engine asks the SIE to raise.
    pub const ENABLED: Self = Self::RESET
        .union(Self::ERROR)
        .union(Self::TRANSACTION)
        .union(Self::SOF)
        .union(Self::IDLE)
        .union(Self::ACTIVITY);
}

bitflags! {
    /// Bus error conditions, `UEIR` layout.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BusErrors: u8 {
        const PID = 0x01;
        const CRC5 = 0x02;
        const CRC16 = 0x04;
        const DATA_FIELD = 0x08;
        const TURNAROUND_TIMEOUT = 0x10;
        const BIT_STUFF = 0x80;
    }
}

/// One entry of the SIE's transaction status queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transaction {
    pub endpoint: u8,
    pub direction: UsbDir,
    pub pid: TokenPid,
}

impl Transaction {
    pub fn address(&self) -> u8 {
        self.direction.endpoint(self.endpoint)
    }
}

/// Capabilities the engine needs from the serial interface engine.
///
/// Methods that arm an endpoint hand the buffer to the hardware; the matching
/// transaction in `next_transaction` hands it back.
pub trait Sie {
    /// Enables the transceiver and signals attach to the host.
    fn attach(&mut self);

    /// Replaces the set of sources allowed to raise the interrupt line.
    fn enable(&mut self, which: Interrupts);

    /// Latched sources, limited to the enabled set.
    fn pending(&self) -> Interrupts;

    /// Acknowledges individual interrupt sources.
    fn clear(&mut self, which: Interrupts);

    /// Acknowledges the peripheral's aggregate interrupt line.
    fn clear_aggregate(&mut self);

    /// Returns and clears the latched bus error conditions.
    fn take_bus_errors(&mut self) -> BusErrors;

    /// Pops the oldest completed transaction, retiring its status entry.
    fn next_transaction(&mut self) -> Option<Transaction>;

    /// Copies out the 8 bytes of the most recent SETUP packet.
    fn read_setup(&mut self) -> [u8; 8];

    /// Copies the data of the completed OUT transaction on `endpoint` into
    /// `buf`, returning the number of bytes the host sent.
    fn read_out(&mut self, endpoint: u8, buf: &mut [u8]) -> usize;

    /// Hands `data` to the SIE for the next IN token on `endpoint`.
    fn arm_in(&mut self, endpoint: u8, data: &[u8], pid: DataPid);

    /// Lets the SIE accept up to `capacity` bytes on the next OUT token.
    fn arm_out(&mut self, endpoint: u8, capacity: usize, pid: DataPid);

    /// Takes a buffer back from the SIE without a transaction; further tokens
    /// are NAKed.
    fn disarm(&mut self, address: u8);

    fn set_stall(&mut self, address: u8, stalled: bool);

    /// Protocol STALL on both directions of endpoint 0. Cleared by the
    /// hardware on the next SETUP.
    fn stall_control(&mut self);

    fn set_address(&mut self, address: u8);
}
