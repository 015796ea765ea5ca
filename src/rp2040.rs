// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RP2040 USB controller backend.
//!
//! Implements `Sie` directly on the `USBCTRL_REGS` and `USBCTRL_DPRAM` register
//! blocks. No HAL, same as the rest of the firmware.
//!
//! The RP2040 doesn't have a transaction status FIFO. Instead it sets a bit in
//! `buff_status` for every buffer the hardware hands back, and latches SETUP
//! in `sie_status`. `next_transaction` turns those into the engine's one-at-a-
//! time view, buffers first (they happened before any SETUP that's still
//! pending, since we can't have armed anything for the new transfer yet).
//!
//! # Buffer layout
//!
//! EP0 IN and OUT share the fixed buffer at DPRAM offset 0x100. The engine
//! never has data in flight in both directions of EP0 at once, so this is
//! fine. Every other endpoint direction gets its own 64-byte buffer starting
//! at 0x180.
//!
//! # Sharing with the interrupt handler
//!
//! `Rp2040Sie` is just a pair of references to the register blocks, so the
//! USB interrupt handler makes its own with `steal`. The handler only touches
//! interrupt status, `buff_status` and the SETUP packet; the main loop only
//! touches buffer control, endpoint control and the address. The one
//! register both write is `inte`, and only when the event queue overflows.

use rp2040_pac::{usbctrl_dpram, usbctrl_regs, Interrupt, CLOCKS, PLL_SYS, PLL_USB, RESETS, ROSC, XOSC};

use crate::config::EndpointConfig;
use crate::sie::{BusErrors, Interrupts, Sie, Transaction};
use crate::usb::{endpoint_number, DataPid, TokenPid, UsbDir};

const EP0_BUFFER_OFFSET: usize = 0x100;
const DATA_BUFFER_OFFSET: usize = 0x180;
const DATA_BUFFER_SIZE: usize = 64;

// INTR / INTE / INTS
const INT_BUFF_STATUS: u32 = 1 << 4;
const INT_ERROR_DATA_SEQ: u32 = 1 << 5;
const INT_ERROR_RX_TIMEOUT: u32 = 1 << 6;
const INT_ERROR_RX_OVERFLOW: u32 = 1 << 7;
const INT_ERROR_BIT_STUFF: u32 = 1 << 8;
const INT_ERROR_CRC: u32 = 1 << 9;
const INT_STALL: u32 = 1 << 10;
const INT_BUS_RESET: u32 = 1 << 12;
const INT_DEV_SUSPEND: u32 = 1 << 14;
const INT_DEV_RESUME_FROM_HOST: u32 = 1 << 15;
const INT_SETUP_REQ: u32 = 1 << 16;
const INT_DEV_SOF: u32 = 1 << 17;
const INT_ERRORS: u32 =
    INT_ERROR_DATA_SEQ | INT_ERROR_RX_TIMEOUT | INT_ERROR_RX_OVERFLOW | INT_ERROR_BIT_STUFF | INT_ERROR_CRC;

// SIE_STATUS, write-one-to-clear
const ST_SUSPENDED: u32 = 1 << 4;
const ST_RESUME: u32 = 1 << 11;
const ST_SETUP_REC: u32 = 1 << 17;
const ST_TRANS_COMPLETE: u32 = 1 << 18;
const ST_BUS_RESET: u32 = 1 << 19;
const ST_CRC_ERROR: u32 = 1 << 24;
const ST_BIT_STUFF_ERROR: u32 = 1 << 25;
const ST_RX_OVERFLOW: u32 = 1 << 26;
const ST_RX_TIMEOUT: u32 = 1 << 27;
const ST_STALL_REC: u32 = 1 << 29;
const ST_DATA_SEQ_ERROR: u32 = 1 << 31;

// EP_BUFFER_CONTROL
const BC_LENGTH_MASK: u32 = 0x3FF;
const BC_AVAILABLE: u32 = 1 << 10;
const BC_STALL: u32 = 1 << 11;
const BC_PID_1: u32 = 1 << 13;
const BC_FULL: u32 = 1 << 15;

// EP_STALL_ARM
const STALL_ARM_EP0_IN: u32 = 1 << 0;
const STALL_ARM_EP0_OUT: u32 = 1 << 1;

/// Mapping between the engine's interrupt sources and the controller's.
const INTERRUPT_MAP: [(Interrupts, u32); 7] = [
    (Interrupts::RESET, INT_BUS_RESET),
    (Interrupts::ERROR, INT_ERRORS),
    (Interrupts::ACTIVITY, INT_DEV_RESUME_FROM_HOST),
    (Interrupts::TRANSACTION, INT_BUFF_STATUS | INT_SETUP_REQ),
    (Interrupts::IDLE, INT_DEV_SUSPEND),
    (Interrupts::STALL, INT_STALL),
    (Interrupts::SOF, INT_DEV_SOF),
];

/// Bus error conditions the controller reports, and what we call them.
const ERROR_MAP: [(BusErrors, u32); 5] = [
    (BusErrors::PID, ST_DATA_SEQ_ERROR),
    (BusErrors::CRC16, ST_CRC_ERROR),
    (BusErrors::DATA_FIELD, ST_RX_OVERFLOW),
    (BusErrors::TURNAROUND_TIMEOUT, ST_RX_TIMEOUT),
    (BusErrors::BIT_STUFF, ST_BIT_STUFF_ERROR),
];

pub struct Rp2040Sie {
    regs: &'static usbctrl_regs::RegisterBlock,
    dpram: &'static usbctrl_dpram::RegisterBlock,
}

impl Rp2040Sie {
    /// Brings the controller out of reset and sets it up as a full-speed
    /// device with the given endpoints. `clk_usb` must already be running at
    /// 48 MHz. The pull-up stays off until `attach`.
    pub fn new(
        _regs: rp2040_pac::USBCTRL_REGS,
        _dpram: rp2040_pac::USBCTRL_DPRAM,
        resets: &RESETS,
        endpoints: &[EndpointConfig],
    ) -> Self {
        resets.reset.modify(|_, w| w.usbctrl().set_bit());
        resets.reset.modify(|_, w| w.usbctrl().clear_bit());
        while !resets.reset_done.read().usbctrl().bit() {}

        // Safety: we own both register blocks, having been handed the PAC
        // tokens.
        let sie = unsafe { Self::steal() };

        sie.dpram.setup_packet_low.write(|w| unsafe { w.bits(0) });
        sie.dpram.setup_packet_high.write(|w| unsafe { w.bits(0) });
        for epc in &sie.dpram.ep_control {
            epc.write(|w| unsafe { w.bits(0) });
        }
        for epb in &sie.dpram.ep_buffer_control {
            epb.write(|w| unsafe { w.bits(0) });
        }

        // On-chip PHY, and pretend VBUS is always there since not every board
        // wires up detection.
        sie.regs
            .usb_muxing
            .write(|w| w.to_phy().set_bit().softcon().set_bit());
        sie.regs
            .usb_pwr
            .write(|w| w.vbus_detect().set_bit().vbus_detect_override_en().set_bit());
        sie.regs
            .main_ctrl
            .write(|w| w.controller_en().set_bit().host_ndevice().clear_bit());
        // A buff_status bit for every EP0 buffer, like the other endpoints.
        sie.regs.sie_ctrl.write(|w| w.ep0_int_1buf().set_bit());

        for ep in endpoints {
            let Some(index) = endpoint_control_index(ep.address) else {
                continue;
            };
            let offset = buffer_offset(ep.address) as u16;
            sie.dpram.ep_control[index].write(|w| unsafe {
                w.enable()
                    .set_bit()
                    .interrupt_per_buff()
                    .set_bit()
                    .endpoint_type()
                    .bits(ep.transfer_type as u8)
                    .buffer_address()
                    .bits(offset)
            });
        }
        sie
    }

    /// Another handle on the controller, for the interrupt handler.
    ///
    /// # Safety
    ///
    /// Callers must stick to the registers their context owns; see the module
    /// documentation.
    pub unsafe fn steal() -> Self {
        Self {
            regs: &*rp2040_pac::USBCTRL_REGS::ptr(),
            dpram: &*rp2040_pac::USBCTRL_DPRAM::ptr(),
        }
    }

    fn buffer(&self, address: u8) -> *mut u8 {
        let base = rp2040_pac::USBCTRL_DPRAM::ptr() as *mut u8;
        // Safety: the offset stays inside the 4 KiB DPRAM for every endpoint
        // number the controller has.
        unsafe { base.add(buffer_offset(address)) }
    }

    /// STALL bit to carry over when re-arming a buffer. A halted endpoint
    /// stays halted; EP0 keeps its protocol stall until the next SETUP.
    fn keep_stall(&self, address: u8) -> u32 {
        let bit = match (endpoint_number(address), UsbDir::of_endpoint_addr(address)) {
            (0, UsbDir::In) => STALL_ARM_EP0_IN,
            (0, UsbDir::Out) => STALL_ARM_EP0_OUT,
            _ => {
                let bc = self.dpram.ep_buffer_control[buffer_control_index(address)].read();
                return bc.bits() & BC_STALL;
            }
        };
        if self.regs.ep_stall_arm.read().bits() & bit != 0 {
            BC_STALL
        } else {
            0
        }
    }
}

/// Index into `ep_control`; EP0 has none.
fn endpoint_control_index(address: u8) -> Option<usize> {
    let n = usize::from(endpoint_number(address));
    let out = usize::from(UsbDir::of_endpoint_addr(address) == UsbDir::Out);
    n.checked_sub(1).map(|n| n * 2 + out)
}

/// Index into `ep_buffer_control` and bit number in `buff_status`.
fn buffer_control_index(address: u8) -> usize {
    let n = usize::from(endpoint_number(address));
    let out = usize::from(UsbDir::of_endpoint_addr(address) == UsbDir::Out);
    n * 2 + out
}

fn buffer_offset(address: u8) -> usize {
    match endpoint_control_index(address) {
        None => EP0_BUFFER_OFFSET,
        Some(i) => DATA_BUFFER_OFFSET + i * DATA_BUFFER_SIZE,
    }
}

fn pid_bit(pid: DataPid) -> u32 {
    match pid {
        DataPid::Data0 => 0,
        DataPid::Data1 => BC_PID_1,
    }
}

impl Sie for Rp2040Sie {
    fn attach(&mut self) {
        self.regs.sie_ctrl.modify(|_, w| w.pullup_en().set_bit());
    }

    fn enable(&mut self, which: Interrupts) {
        let bits = INTERRUPT_MAP
            .iter()
            .filter(|(flag, _)| which.contains(*flag))
            .fold(0, |acc, (_, bits)| acc | bits);
        self.regs.inte.write(|w| unsafe { w.bits(bits) });
    }

    fn pending(&self) -> Interrupts {
        let ints = self.regs.ints.read().bits();
        INTERRUPT_MAP
            .iter()
            .filter(|(_, bits)| ints & bits != 0)
            .fold(Interrupts::empty(), |acc, (flag, _)| acc | *flag)
    }

    fn clear(&mut self, which: Interrupts) {
        let mut status = 0;
        if which.contains(Interrupts::RESET) {
            status |= ST_BUS_RESET;
        }
        if which.contains(Interrupts::TRANSACTION) {
            status |= ST_TRANS_COMPLETE;
        }
        if which.contains(Interrupts::IDLE) {
            status |= ST_SUSPENDED;
        }
        if which.contains(Interrupts::ACTIVITY) {
            status |= ST_RESUME;
        }
        if which.contains(Interrupts::STALL) {
            status |= ST_STALL_REC;
        }
        if status != 0 {
            self.regs.sie_status.write(|w| unsafe { w.bits(status) });
        }
        if which.contains(Interrupts::SOF) {
            // DEV_SOF is cleared by reading the frame number.
            let _ = self.regs.sof_rd.read();
        }
    }

    fn clear_aggregate(&mut self) {
        cortex_m::peripheral::NVIC::unpend(Interrupt::USBCTRL_IRQ);
    }

    fn take_bus_errors(&mut self) -> BusErrors {
        let status = self.regs.sie_status.read().bits();
        let mut errors = BusErrors::empty();
        let mut clear = 0;
        for (flag, bit) in ERROR_MAP {
            if status & bit != 0 {
                errors |= flag;
                clear |= bit;
            }
        }
        if clear != 0 {
            self.regs.sie_status.write(|w| unsafe { w.bits(clear) });
        }
        errors
    }

    fn next_transaction(&mut self) -> Option<Transaction> {
        let buffers = self.regs.buff_status.read().bits();
        if buffers != 0 {
            let bit = buffers.trailing_zeros();
            self.regs.buff_status.write(|w| unsafe { w.bits(1 << bit) });
            let endpoint = (bit >> 1) as u8;
            // IN comes first in each pair.
            let (direction, pid) = if bit & 1 == 0 {
                (UsbDir::In, TokenPid::In)
            } else {
                (UsbDir::Out, TokenPid::Out)
            };
            return Some(Transaction {
                endpoint,
                direction,
                pid,
            });
        }
        if self.regs.sie_status.read().bits() & ST_SETUP_REC != 0 {
            self.regs.sie_status.write(|w| unsafe { w.bits(ST_SETUP_REC) });
            return Some(Transaction {
                endpoint: 0,
                direction: UsbDir::Out,
                pid: TokenPid::Setup,
            });
        }
        None
    }

    fn read_setup(&mut self) -> [u8; 8] {
        let mut packet = [0; 8];
        packet[..4].copy_from_slice(&self.dpram.setup_packet_low.read().bits().to_le_bytes());
        packet[4..].copy_from_slice(&self.dpram.setup_packet_high.read().bits().to_le_bytes());
        packet
    }

    fn read_out(&mut self, endpoint: u8, buf: &mut [u8]) -> usize {
        let address = UsbDir::Out.endpoint(endpoint);
        let bc = self.dpram.ep_buffer_control[buffer_control_index(address)].read();
        let len = (bc.bits() & BC_LENGTH_MASK) as usize;
        let n = len.min(buf.len()).min(DATA_BUFFER_SIZE);
        // Safety: the hardware has cleared AVAILABLE for this buffer (that's
        // what put its bit in buff_status), so it isn't writing to it.
        unsafe {
            buf.as_mut_ptr().copy_from_nonoverlapping(self.buffer(address), n);
        }
        len
    }

    fn arm_in(&mut self, endpoint: u8, data: &[u8], pid: DataPid) {
        let address = UsbDir::In.endpoint(endpoint);
        let n = data.len().min(DATA_BUFFER_SIZE);
        // Safety: the buffer isn't AVAILABLE until the write below, so the
        // hardware isn't reading it.
        unsafe {
            self.buffer(address).copy_from_nonoverlapping(data.as_ptr(), n);
        }
        let stall = self.keep_stall(address);
        self.dpram.ep_buffer_control[buffer_control_index(address)].write(|w| unsafe {
            w.bits(pid_bit(pid) | BC_FULL | BC_AVAILABLE | stall | n as u32)
        });
    }

    fn arm_out(&mut self, endpoint: u8, capacity: usize, pid: DataPid) {
        let address = UsbDir::Out.endpoint(endpoint);
        let n = capacity.min(DATA_BUFFER_SIZE) as u32;
        let stall = self.keep_stall(address);
        self.dpram.ep_buffer_control[buffer_control_index(address)]
            .write(|w| unsafe { w.bits(pid_bit(pid) | BC_AVAILABLE | stall | n) });
    }

    fn disarm(&mut self, address: u8) {
        self.dpram.ep_buffer_control[buffer_control_index(address)]
            .modify(|r, w| unsafe { w.bits(r.bits() & !BC_AVAILABLE) });
    }

    fn set_stall(&mut self, address: u8, stalled: bool) {
        self.dpram.ep_buffer_control[buffer_control_index(address)].modify(|r, w| unsafe {
            w.bits(if stalled {
                r.bits() | BC_STALL
            } else {
                r.bits() & !BC_STALL
            })
        });
    }

    fn stall_control(&mut self) {
        // The controller clears EP_STALL_ARM itself when the next SETUP
        // arrives.
        self.regs
            .ep_stall_arm
            .write(|w| unsafe { w.bits(STALL_ARM_EP0_IN | STALL_ARM_EP0_OUT) });
        for address in [UsbDir::In.endpoint(0), UsbDir::Out.endpoint(0)] {
            self.dpram.ep_buffer_control[buffer_control_index(address)]
                .write(|w| unsafe { w.bits(BC_STALL) });
        }
    }

    fn set_address(&mut self, address: u8) {
        self.regs
            .addr_endp
            .write(|w| unsafe { w.address().bits(address) });
    }
}

/// Moves the system off the ring oscillator: 12 MHz crystal as the reference,
/// 132 MHz system clock from PLL_SYS, 48 MHz USB clock from PLL_USB.
pub fn init_clocks(
    resets: &RESETS,
    xosc: &XOSC,
    rosc: &ROSC,
    clocks: &CLOCKS,
    pll_sys: &PLL_SYS,
    pll_usb: &PLL_USB,
) {
    xosc.ctrl.write(|w| unsafe { w.bits(0xfab_aa0) });
    while !xosc.status.read().stable().bit() {}
    clocks.clk_ref_ctrl.write(|w| w.src().xosc_clksrc());
    while clocks.clk_ref_selected.read().bits() != (1 << 2) {}
    // Ring oscillator off; everything runs from the crystal now.
    rosc.ctrl.write(|w| unsafe { w.bits(0xd1e_fa4) });

    resets.reset.modify(|_, w| w.pll_sys().clear_bit());
    while !resets.reset_done.read().pll_sys().bit() {}
    // 12 MHz * 132 = 1584 MHz VCO, / (6 * 2) = 132 MHz.
    start_pll(pll_sys, 132, 6, 2);
    clocks.clk_sys_ctrl.write(|w| w.auxsrc().clksrc_pll_sys());
    clocks.clk_sys_ctrl.modify(|_, w| w.src().clksrc_clk_sys_aux());
    while clocks.clk_sys_selected.read().bits() != (1 << 1) {}

    clocks
        .clk_peri_ctrl
        .write(|w| w.auxsrc().clk_sys().enable().set_bit());

    resets.reset.modify(|_, w| w.pll_usb().clear_bit());
    while !resets.reset_done.read().pll_usb().bit() {}
    // 12 MHz * 100 = 1200 MHz VCO, / (5 * 5) = 48 MHz.
    start_pll(pll_usb, 100, 5, 5);
    clocks
        .clk_usb_ctrl
        .write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());
}

fn start_pll(pll: &rp2040_pac::pll_sys::RegisterBlock, fbdiv: u16, postdiv1: u8, postdiv2: u8) {
    pll.cs.write(|w| unsafe { w.refdiv().bits(1) });
    pll.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(fbdiv) });
    pll.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !pll.cs.read().lock().bit() {}
    pll.prim
        .write(|w| unsafe { w.postdiv1().bits(postdiv1).postdiv2().bits(postdiv2) });
    pll.pwr.modify(|_, w| w.postdivpd().clear_bit());
}
