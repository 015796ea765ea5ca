// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device state controller.
//!
//! Owns the chapter 9 visible device state and the orthogonal suspend flag.
//! The state only moves through the methods below; nothing else in the
//! engine writes it.

use num_derive::FromPrimitive;

use crate::error::Error;

/// Visible device states (USB 2.0 section 9.1.1). The numbering continues
/// past the unmodeled Attached state so that `Configured` is 5.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceState {
    Powered = 2,
    Default = 3,
    Addressed = 4,
    Configured = 5,
}

/// What a `SET_CONFIGURATION` did to the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigChange {
    /// Entered (or re-entered) the configured state; endpoints need arming.
    Configured,
    /// Left the configured state; endpoints need parking.
    Deconfigured,
    Unchanged,
}

#[derive(Debug)]
pub struct DeviceStateController {
    state: DeviceState,
    suspended: bool,
    address: u8,
    pending_address: Option<u8>,
    configuration: u8,
    remote_wakeup: bool,
    valid_configuration: u8,
}

impl DeviceStateController {
    /// `valid_configuration` is the one `bConfigurationValue` the device
    /// accepts.
    pub fn new(valid_configuration: u8) -> Self {
        Self {
            state: DeviceState::Powered,
            suspended: false,
            address: 0,
            pending_address: None,
            configuration: 0,
            remote_wakeup: false,
            valid_configuration,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn remote_wakeup(&self) -> bool {
        self.remote_wakeup
    }

    /// Non-control endpoints may only be used when this holds.
    pub fn is_ready(&self) -> bool {
        self.state == DeviceState::Configured && !self.suspended
    }

    /// Bus reset: back to Default, awake, address 0, any staged address
    /// forgotten.
    pub fn reset(&mut self) {
        if self.state != DeviceState::Default {
            info!("state {} -> Default", self.state);
        }
        self.state = DeviceState::Default;
        self.suspended = false;
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.remote_wakeup = false;
    }

    /// Remembers the address carried by `SET_ADDRESS` until its status stage
    /// completes.
    pub fn stage_address(&mut self, address: u8) {
        self.pending_address = Some(address);
    }

    /// Forgets a staged address whose status stage will never come.
    pub fn clear_pending_address(&mut self) {
        self.pending_address = None;
    }

    pub fn pending_address(&self) -> Option<u8> {
        self.pending_address
    }

    /// The status stage of `SET_ADDRESS` went out with the old address; the
    /// new one takes effect now. Returns the address to load into the SIE.
    pub fn on_set_address_status_stage_complete(&mut self) -> Option<u8> {
        let address = self.pending_address.take()?;
        let next = match (self.state, address) {
            (DeviceState::Default, 0) => DeviceState::Default,
            (DeviceState::Default | DeviceState::Addressed, _) if address != 0 => {
                DeviceState::Addressed
            }
            (DeviceState::Addressed, _) => DeviceState::Default,
            // Filtered out when the request arrived.
            (state, _) => state,
        };
        if next != self.state {
            info!("state {} -> {} (address {})", self.state, next, address);
        }
        self.state = next;
        self.address = address;
        Some(address)
    }

    /// Applies `SET_CONFIGURATION`. Unknown values leave everything as it
    /// was and are reported so the request can be stalled.
    pub fn on_set_configuration(&mut self, value: u8) -> Result<ConfigChange, Error> {
        if value != 0 && value != self.valid_configuration {
            return Err(Error::InvalidConfiguration(value));
        }
        let change = match (self.state, value) {
            (DeviceState::Addressed, 0) => ConfigChange::Unchanged,
            (DeviceState::Addressed | DeviceState::Configured, v) if v != 0 => {
                self.state = DeviceState::Configured;
                ConfigChange::Configured
            }
            (DeviceState::Configured, _) => {
                self.state = DeviceState::Addressed;
                ConfigChange::Deconfigured
            }
            // Not defined before an address is assigned.
            _ => return Err(Error::InvalidConfiguration(value)),
        };
        self.configuration = value;
        debug!("configuration {} ({})", value, change);
        Ok(change)
    }

    pub fn set_remote_wakeup(&mut self, enabled: bool) {
        self.remote_wakeup = enabled;
    }

    pub fn on_suspend(&mut self) {
        if !self.suspended {
            info!("suspended");
        }
        self.suspended = true;
    }

    pub fn on_resume(&mut self) {
        if self.suspended {
            info!("resumed");
        }
        self.suspended = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addressed() -> DeviceStateController {
        let mut s = DeviceStateController::new(1);
        s.reset();
        s.stage_address(7);
        s.on_set_address_status_stage_complete();
        s
    }

    #[test]
    fn starts_powered_and_resets_to_default() {
        let mut s = DeviceStateController::new(1);
        assert_eq!(s.state(), DeviceState::Powered);
        s.reset();
        assert_eq!(s.state(), DeviceState::Default);
        assert!(!s.is_ready());
    }

    #[test]
    fn address_applies_only_at_status_stage() {
        let mut s = DeviceStateController::new(1);
        s.reset();
        s.stage_address(12);
        assert_eq!(s.state(), DeviceState::Default);
        assert_eq!(s.address(), 0);
        assert_eq!(s.on_set_address_status_stage_complete(), Some(12));
        assert_eq!(s.state(), DeviceState::Addressed);
        assert_eq!(s.address(), 12);
        assert_eq!(s.on_set_address_status_stage_complete(), None);
    }

    #[test]
    fn cleared_address_is_never_applied() {
        let mut s = DeviceStateController::new(1);
        s.reset();
        s.stage_address(12);
        s.clear_pending_address();
        assert_eq!(s.pending_address(), None);
        assert_eq!(s.on_set_address_status_stage_complete(), None);
        assert_eq!(s.state(), DeviceState::Default);
        assert_eq!(s.address(), 0);
    }

    #[test]
    fn address_zero_returns_to_default() {
        let mut s = addressed();
        s.stage_address(0);
        s.on_set_address_status_stage_complete();
        assert_eq!(s.state(), DeviceState::Default);
    }

    #[test]
    fn configuration_transitions() {
        let mut s = addressed();
        assert_eq!(s.on_set_configuration(1), Ok(ConfigChange::Configured));
        assert_eq!(s.state(), DeviceState::Configured);
        assert!(s.is_ready());
        assert_eq!(s.on_set_configuration(0), Ok(ConfigChange::Deconfigured));
        assert_eq!(s.state(), DeviceState::Addressed);
        assert_eq!(s.on_set_configuration(0), Ok(ConfigChange::Unchanged));
    }

    #[test]
    fn bad_configuration_leaves_state_alone() {
        let mut s = addressed();
        s.on_set_configuration(1).unwrap();
        assert_eq!(s.on_set_configuration(2), Err(Error::InvalidConfiguration(2)));
        assert_eq!(s.state(), DeviceState::Configured);
        assert_eq!(s.configuration(), 1);

        let mut d = DeviceStateController::new(1);
        d.reset();
        assert!(d.on_set_configuration(1).is_err());
        assert_eq!(d.state(), DeviceState::Default);
    }

    #[test]
    fn suspend_is_orthogonal() {
        let mut s = addressed();
        s.on_set_configuration(1).unwrap();
        s.on_suspend();
        assert_eq!(s.state(), DeviceState::Configured);
        assert!(!s.is_ready());
        s.on_resume();
        assert!(s.is_ready());
    }

    #[test]
    fn reset_discards_pending_address() {
        let mut s = addressed();
        s.on_set_configuration(1).unwrap();
        s.stage_address(3);
        s.on_suspend();
        s.reset();
        assert_eq!(s.state(), DeviceState::Default);
        assert!(!s.is_suspended());
        assert_eq!(s.pending_address(), None);
        assert_eq!(s.address(), 0);
    }
}
