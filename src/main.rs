// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic HID demo firmware for RP2040 boards.
//!
//! The device shows up as a vendor-defined HID device with 8-byte reports in
//! each direction. Byte 0 of a report is a command, the rest is payload:
//!
//! - `0x80` (get status): the device answers with `[0x80, button, led, 0...]`.
//! - `0x81` (toggle LED): the device flips its LED, then answers the same way.
//!
//! The device also sends a status report on its own whenever the button
//! changes state.
//!
//! All USB protocol work happens in the library. The interrupt handler only
//! records events; the main loop services them first thing on every
//! iteration, then does the application's polling.

#![no_std]
#![no_main]

#[macro_use]
#[path = "fmt.rs"]
mod fmt;

use cortex_m::peripheral::NVIC;
use cortex_m_rt::entry;
use rp2040_pac::{interrupt, Interrupt};

use generic_hid_usb::descriptors::HID_INTERFACE;
use generic_hid_usb::rp2040::{init_clocks, Rp2040Sie};
use generic_hid_usb::{Error, EventQueue, InterruptDispatcher, UsbDevice, GENERIC_HID};

#[cfg(feature = "defmt")]
use defmt_rtt as _;
use panic_halt as _;

// GPIO numbers of the pins the demo uses, other than USB. The button pulls its
// pin to ground when pressed.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-pico")] {
        const LED_PIN: u8 = 25;
        const BUTTON_PIN: u8 = 15;
    } else if #[cfg(feature = "target-feather")] {
        const LED_PIN: u8 = 13;
        const BUTTON_PIN: u8 = 15;
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

const CMD_GET_STATUS: u8 = 0x80;
const CMD_TOGGLE_LED: u8 = 0x81;

/// Events recorded by the interrupt handler, waiting for the main loop.
static EVENTS: EventQueue<16> = EventQueue::new();
static DISPATCHER: InterruptDispatcher = InterruptDispatcher::new();

#[entry]
fn main() -> ! {
    let p = rp2040_pac::Peripherals::take().unwrap();

    // LED and button. SIO is always available; the pins and pads need to come
    // out of reset.
    p.RESETS
        .reset
        .modify(|_, w| w.io_bank0().clear_bit().pads_bank0().clear_bit());
    while !p.RESETS.reset_done.read().io_bank0().bit() {}
    while !p.RESETS.reset_done.read().pads_bank0().bit() {}

    p.IO_BANK0.gpio[LED_PIN as usize].gpio_ctrl.write(|w| w.funcsel().sio());
    p.IO_BANK0.gpio[BUTTON_PIN as usize].gpio_ctrl.write(|w| w.funcsel().sio());
    p.PADS_BANK0.gpio[BUTTON_PIN as usize]
        .modify(|_, w| w.ie().set_bit().pue().set_bit().pde().clear_bit());
    p.SIO.gpio_oe_set.write(|w| unsafe { w.bits(1 << LED_PIN) });

    init_clocks(&p.RESETS, &p.XOSC, &p.ROSC, &p.CLOCKS, &p.PLL_SYS, &p.PLL_USB);

    let mut sie = Rp2040Sie::new(p.USBCTRL_REGS, p.USBCTRL_DPRAM, &p.RESETS, GENERIC_HID.endpoints);
    let mut usb = UsbDevice::new(&GENERIC_HID).unwrap();
    usb.initialize_usb(&mut sie);
    // Safety: the handler only touches the queue and the dispatcher, both of
    // which are built for it.
    unsafe {
        NVIC::unmask(Interrupt::USBCTRL_IRQ);
    }
    usb.enable_usb_module(&mut sie);

    let mut led = false;
    let mut button = button_pressed(&p.SIO);
    // A status report we owe the host but couldn't queue yet.
    let mut report_due = false;

    loop {
        usb.service(&mut sie, &EVENTS);
        if !usb.is_ready() {
            continue;
        }

        if usb.is_data_available(HID_INTERFACE) {
            let command = usb.rx_report(HID_INTERFACE).and_then(|r| r.first().copied());
            match command {
                Some(CMD_TOGGLE_LED) => {
                    led = !led;
                    if led {
                        raise_pin(&p.SIO, LED_PIN);
                    } else {
                        lower_pin(&p.SIO, LED_PIN);
                    }
                    report_due = true;
                }
                Some(CMD_GET_STATUS) => report_due = true,
                Some(other) => debug!("ignoring command {:#x}", other),
                None => {}
            }
            if let Err(e) = usb.re_arm(&mut sie, HID_INTERFACE) {
                warn!("re-arm failed: {}", e);
            }
        }

        let now = button_pressed(&p.SIO);
        if now != button {
            button = now;
            report_due = true;
        }

        if report_due {
            let report = usb.tx_report_mut();
            report.fill(0);
            report[0] = CMD_GET_STATUS;
            report[1] = u8::from(button);
            report[2] = u8::from(led);
            match usb.send(&mut sie, HID_INTERFACE) {
                Ok(()) => report_due = false,
                // The previous report is still waiting for an IN token.
                Err(Error::EndpointBusy(_)) => {}
                Err(e) => {
                    warn!("send failed: {}", e);
                    report_due = false;
                }
            }
        }
    }
}

#[interrupt]
fn USBCTRL_IRQ() {
    // Safety: the dispatcher only touches interrupt status, completed buffers
    // and the SETUP packet, none of which the main loop writes.
    let mut sie = unsafe { Rp2040Sie::steal() };
    DISPATCHER.capture(&mut sie, &EVENTS);
}

/// Reads the button, which is active low.
fn button_pressed(sio: &rp2040_pac::SIO) -> bool {
    sio.gpio_in.read().bits() & (1 << BUTTON_PIN) == 0
}

/// Raise the GPIO pin with index `pin`.
///
/// The pin must already be configured as an SIO output.
#[inline(always)]
fn raise_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_set.write(|w| unsafe { w.bits(1 << pin) });
}

/// Lower the GPIO pin with index `pin`.
#[inline(always)]
fn lower_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_clr.write(|w| unsafe { w.bits(1 << pin) });
}

// Second-stage bootloader for the board's flash chip.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-feather")] {
        // The Feather RP2040 uses a GigaDevice GD25Q64.
        #[link_section = ".boot2"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GD25Q64CS;
    } else if #[cfg(feature = "target-pico")] {
        // The Pi Pico uses a Winbond W25Q080.
        #[link_section = ".boot2"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
    }
}
