// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device: every piece of the engine wired together, and the API the
//! application talks to.
//!
//! The expected shape of a main loop is
//!
//! ```ignore
//! loop {
//!     usb.service(&mut sie, &EVENTS);
//!     if usb.is_ready() && usb.is_data_available(0) {
//!         // read usb.rx_report(0), fill usb.tx_report_mut()
//!         usb.re_arm(&mut sie, 0)?;
//!         usb.send(&mut sie, 0)?;
//!     }
//!     // application polling goes here, after USB
//! }
//! ```
//!
//! with `InterruptDispatcher::capture` feeding `EVENTS` from the USB
//! interrupt handler.

use crate::config::DeviceConfiguration;
use crate::control::{ControlEnv, ControlHandler, ControlStage};
use crate::dispatch::{EventQueue, UsbEvent};
use crate::endpoint::EndpointManager;
use crate::error::Error;
use crate::hid::HidClass;
use crate::registry::BufferRegistry;
use crate::sie::{Interrupts, Sie};
use crate::state::{DeviceState, DeviceStateController};
use crate::usb::{UsbDir, EP0_IN_ADDR, EP0_OUT_ADDR};

pub struct UsbDevice {
    config: &'static DeviceConfiguration,
    state: DeviceStateController,
    endpoints: EndpointManager,
    control: ControlHandler,
    hid: HidClass,
}

impl UsbDevice {
    /// Builds the engine for `config`. Fails if the endpoint table doesn't
    /// fit the registry or lacks an endpoint the engine needs.
    pub fn new(config: &'static DeviceConfiguration) -> Result<Self, Error> {
        let registry = BufferRegistry::new(config.endpoints)?;
        for address in [EP0_OUT_ADDR, EP0_IN_ADDR, config.hid_in, config.hid_out] {
            if registry.lookup(address).is_none() {
                return Err(Error::UnknownEndpoint(address));
            }
        }
        Ok(Self {
            config,
            state: DeviceStateController::new(config.configuration_value()),
            endpoints: EndpointManager::new(registry),
            control: ControlHandler::new(),
            hid: HidClass::new(config),
        })
    }

    /// Puts the engine in its power-on state and enables the interrupt
    /// sources it handles. The device stays invisible to the host until
    /// `enable_usb_module`.
    pub fn initialize_usb(&mut self, sie: &mut impl Sie) {
        self.state = DeviceStateController::new(self.config.configuration_value());
        self.endpoints.reset(sie);
        self.control.reset();
        self.hid.reset();
        sie.set_address(0);
        sie.enable(Interrupts::ENABLED);
        info!("USB initialized");
    }

    /// Attaches to the bus. The host answers with a bus reset.
    pub fn enable_usb_module(&mut self, sie: &mut impl Sie) {
        sie.attach();
        info!("USB attached");
    }

    /// Handles every event the interrupt handler has queued. Call this first
    /// thing in each main loop iteration. Returns the number of events
    /// handled.
    pub fn service<S: Sie, const N: usize>(&mut self, sie: &mut S, queue: &EventQueue<N>) -> usize {
        let mut handled = 0;
        while let Some(event) = queue.pop() {
            self.handle_event(sie, event);
            handled += 1;
        }
        if queue.take_throttled() {
            debug!("event queue drained, unmasking USB sources");
            sie.enable(Interrupts::ENABLED);
        }
        handled
    }

    pub fn handle_event<S: Sie>(&mut self, sie: &mut S, event: UsbEvent) {
        match event {
            UsbEvent::Reset => self.bus_reset(sie),
            UsbEvent::Suspend => self.state.on_suspend(),
            UsbEvent::Resume => self.state.on_resume(),
            UsbEvent::Out(n) if n != 0 => self.report_transaction(sie, UsbDir::Out.endpoint(n)),
            UsbEvent::In(n) if n != 0 => self.report_transaction(sie, UsbDir::In.endpoint(n)),
            UsbEvent::Setup(_) | UsbEvent::Out(_) | UsbEvent::In(_) => {
                self.control_event(sie, event)
            }
        }
    }

    fn control_event<S: Sie>(&mut self, sie: &mut S, event: UsbEvent) {
        let Self {
            config,
            state,
            endpoints,
            control,
            hid,
        } = self;
        let mut env = ControlEnv {
            sie,
            endpoints,
            state,
            hid,
            config: *config,
        };
        match event {
            UsbEvent::Setup(raw) => control.on_setup(raw, &mut env),
            UsbEvent::Out(_) => control.on_out_complete(&mut env),
            UsbEvent::In(_) => control.on_in_complete(&mut env),
            _ => {}
        }
    }

    fn report_transaction(&mut self, sie: &mut impl Sie, address: u8) {
        match self.hid.on_transaction(&mut self.endpoints, sie, address) {
            Ok(true) => {}
            Ok(false) => warn!("transaction on unknown endpoint {:#x}", address),
            Err(e) => error!("endpoint {:#x}: {}", address, e),
        }
    }

    fn bus_reset(&mut self, sie: &mut impl Sie) {
        self.state.reset();
        self.endpoints.reset(sie);
        self.control.reset();
        self.hid.reset();
        sie.set_address(0);
        // Ready for the first control transfer.
        if let Err(e) = self.endpoints.arm(sie, EP0_OUT_ADDR) {
            error!("could not arm EP0 OUT: {}", e);
        }
    }

    /// Configured and not suspended: the report endpoints are usable.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn state(&self) -> DeviceState {
        self.state.state()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    pub fn address(&self) -> u8 {
        self.state.address()
    }

    pub fn control_stage(&self) -> ControlStage {
        self.control.stage()
    }

    /// Requests answered with a STALL since power-up.
    pub fn stalls(&self) -> u32 {
        self.control.stalls()
    }

    pub fn hid(&self) -> &HidClass {
        &self.hid
    }

    pub fn endpoints(&self) -> &EndpointManager {
        &self.endpoints
    }

    pub fn is_data_available(&self, interface: u8) -> bool {
        self.is_ready() && self.hid.is_data_available(&self.endpoints, interface)
    }

    /// The received report, while `is_data_available` holds.
    pub fn rx_report(&self, interface: u8) -> Option<&[u8]> {
        self.hid.rx_report(&self.endpoints, interface)
    }

    pub fn tx_report_mut(&mut self) -> &mut [u8] {
        self.hid.tx_report_mut()
    }

    /// Queues the TX report on the interface's IN endpoint.
    pub fn send(&mut self, sie: &mut impl Sie, interface: u8) -> Result<(), Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        self.hid.send(&mut self.endpoints, sie, interface)
    }

    /// Releases the received report and lets the host send the next one.
    pub fn re_arm(&mut self, sie: &mut impl Sie, interface: u8) -> Result<(), Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        self.hid.re_arm(&mut self.endpoints, sie, interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, GENERIC_HID};
    use crate::descriptors::GENERIC_HID_DESCRIPTORS;
    use crate::endpoint::Owner;
    use crate::sim::SimSie;
    use crate::usb::UsbTransferType;

    #[test]
    fn rejects_config_without_report_endpoints() {
        static CONTROL_ONLY: [EndpointConfig; 2] = [
            EndpointConfig {
                address: 0x00,
                transfer_type: UsbTransferType::Control,
                capacity: 8,
            },
            EndpointConfig {
                address: 0x80,
                transfer_type: UsbTransferType::Control,
                capacity: 8,
            },
        ];
        static BROKEN: DeviceConfiguration = DeviceConfiguration {
            descriptors: &GENERIC_HID_DESCRIPTORS,
            endpoints: &CONTROL_ONLY,
            hid_interface: 0,
            hid_in: 0x81,
            hid_out: 0x01,
            report_len: 8,
        };
        assert_eq!(UsbDevice::new(&BROKEN).err(), Some(Error::UnknownEndpoint(0x81)));
    }

    #[test]
    fn initialize_then_attach() {
        let mut sie = SimSie::new();
        let mut usb = UsbDevice::new(&GENERIC_HID).unwrap();
        usb.initialize_usb(&mut sie);
        assert_eq!(usb.state(), DeviceState::Powered);
        assert!(!sie.is_attached());
        assert_eq!(sie.enabled(), Interrupts::ENABLED);
        usb.enable_usb_module(&mut sie);
        assert!(sie.is_attached());
    }

    #[test]
    fn reset_arms_control_endpoint() {
        let mut sie = SimSie::new();
        let mut usb = UsbDevice::new(&GENERIC_HID).unwrap();
        usb.initialize_usb(&mut sie);
        usb.handle_event(&mut sie, UsbEvent::Reset);
        assert_eq!(usb.state(), DeviceState::Default);
        assert!(sie.is_armed(EP0_OUT_ADDR));
        assert_eq!(usb.endpoints().buffer(0x81).unwrap().owner, Owner::Sie);
    }

    #[test]
    fn reports_need_configuration() {
        let mut sie = SimSie::new();
        let mut usb = UsbDevice::new(&GENERIC_HID).unwrap();
        usb.initialize_usb(&mut sie);
        usb.handle_event(&mut sie, UsbEvent::Reset);
        assert_eq!(usb.send(&mut sie, 0), Err(Error::NotReady));
        assert_eq!(usb.re_arm(&mut sie, 0), Err(Error::NotReady));
        assert!(!usb.is_data_available(0));
    }

    #[test]
    fn service_restores_masked_sources() {
        let mut sie = SimSie::new();
        let mut usb = UsbDevice::new(&GENERIC_HID).unwrap();
        usb.initialize_usb(&mut sie);
        let queue: EventQueue<4> = EventQueue::new();
        queue.push(UsbEvent::Suspend).unwrap();
        queue.throttle();
        sie.enable(Interrupts::RESET);

        assert_eq!(usb.service(&mut sie, &queue), 1);
        assert!(usb.is_suspended());
        assert_eq!(sie.enabled(), Interrupts::ENABLED);
    }
}
