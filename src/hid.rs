// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HID class adapter.
//!
//! Turns the endpoint manager's buffers into single-report semantics for the
//! one HID interface: at most one report in flight per direction, no
//! queueing. The application fills the TX report, calls `send`, reads the RX
//! report once `is_data_available` says so, and calls `re_arm` when done.
//!
//! Also answers the HID 1.11 class requests that arrive on EP0.

use num_traits::FromPrimitive;

use crate::config::DeviceConfiguration;
use crate::control::{InData, Response, Stall};
use crate::endpoint::EndpointManager;
use crate::error::Error;
use crate::registry::MAX_PACKET_SIZE;
use crate::sie::Sie;
use crate::usb::{DataPid, HidReportType, HidRequest, UsbDir, UsbSetupPacket};

/// `bProtocol` values for GET/SET_PROTOCOL.
pub const PROTOCOL_BOOT: u8 = 0;
pub const PROTOCOL_REPORT: u8 = 1;

pub struct HidClass {
    interface: u8,
    in_addr: u8,
    out_addr: u8,
    report_len: usize,
    tx_report: [u8; MAX_PACKET_SIZE],
    feature_report: [u8; MAX_PACKET_SIZE],
    output_report: [u8; MAX_PACKET_SIZE],
    /// In units of 4 ms; 0 means report only on change.
    idle: u8,
    protocol: u8,
}

impl HidClass {
    pub fn new(config: &DeviceConfiguration) -> Self {
        Self {
            interface: config.hid_interface,
            in_addr: config.hid_in,
            out_addr: config.hid_out,
            report_len: config.report_len.min(MAX_PACKET_SIZE),
            tx_report: [0; MAX_PACKET_SIZE],
            feature_report: [0; MAX_PACKET_SIZE],
            output_report: [0; MAX_PACKET_SIZE],
            idle: 0,
            protocol: PROTOCOL_REPORT,
        }
    }

    /// Bus reset puts class state back to its power-on values. The TX report
    /// belongs to the application and is left alone.
    pub fn reset(&mut self) {
        self.idle = 0;
        self.protocol = PROTOCOL_REPORT;
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn idle(&self) -> u8 {
        self.idle
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn feature_report(&self) -> &[u8] {
        &self.feature_report[..self.report_len]
    }

    pub fn output_report(&self) -> &[u8] {
        &self.output_report[..self.report_len]
    }

    /// The report the next `send` will transmit.
    pub fn tx_report(&self) -> &[u8] {
        &self.tx_report[..self.report_len]
    }

    pub fn tx_report_mut(&mut self) -> &mut [u8] {
        &mut self.tx_report[..self.report_len]
    }

    /// The device just became configured (or the host re-selected the
    /// alternate setting): both report endpoints start over at DATA0, the IN
    /// side goes to the application and the OUT side is armed for the first
    /// report.
    pub fn activate(&mut self, endpoints: &mut EndpointManager, sie: &mut impl Sie) -> Result<(), Error> {
        for address in [self.in_addr, self.out_addr] {
            endpoints.set_halt(sie, address, false)?;
            endpoints.release(sie, address)?;
            endpoints.set_next_pid(address, DataPid::Data0)?;
        }
        endpoints.arm(sie, self.out_addr)?;
        debug!("HID interface {} active", self.interface);
        Ok(())
    }

    /// Configuration dropped back to 0: the report endpoints go quiet.
    pub fn deactivate(&mut self, endpoints: &mut EndpointManager, sie: &mut impl Sie) -> Result<(), Error> {
        endpoints.park(sie, self.in_addr)?;
        endpoints.park(sie, self.out_addr)?;
        debug!("HID interface {} inactive", self.interface);
        Ok(())
    }

    /// True exactly when an OUT report has arrived and hasn't been given
    /// back with `re_arm`.
    pub fn is_data_available(&self, endpoints: &EndpointManager, interface: u8) -> bool {
        interface == self.interface && endpoints.received(self.out_addr).is_some()
    }

    /// The report most recently received on the OUT endpoint.
    pub fn rx_report<'a>(&self, endpoints: &'a EndpointManager, interface: u8) -> Option<&'a [u8]> {
        if interface != self.interface {
            return None;
        }
        endpoints.received(self.out_addr)
    }

    /// Queues the TX report for the next IN token.
    pub fn send(
        &mut self,
        endpoints: &mut EndpointManager,
        sie: &mut impl Sie,
        interface: u8,
    ) -> Result<(), Error> {
        self.check(interface)?;
        endpoints.queue_for_send(sie, self.in_addr, &self.tx_report[..self.report_len])
    }

    /// Gives the OUT buffer back to the SIE for the next report. Whatever was
    /// in it is gone.
    pub fn re_arm(
        &mut self,
        endpoints: &mut EndpointManager,
        sie: &mut impl Sie,
        interface: u8,
    ) -> Result<(), Error> {
        self.check(interface)?;
        endpoints.arm(sie, self.out_addr)
    }

    /// Handles a transaction completion on one of the report endpoints.
    /// Returns `false` if the endpoint isn't ours.
    pub fn on_transaction(
        &mut self,
        endpoints: &mut EndpointManager,
        sie: &mut impl Sie,
        address: u8,
    ) -> Result<bool, Error> {
        if address == self.in_addr {
            endpoints.commit_sent(address)?;
        } else if address == self.out_addr {
            let n = endpoints.commit_received(sie, address)?;
            trace!("HID OUT report, {} bytes", n);
            if n == 0 {
                // Never shows up as available, so nobody would re-arm it.
                endpoints.arm(sie, address)?;
            }
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    /// Decodes a class request addressed to our interface. The caller has
    /// already checked the recipient.
    pub fn class_request(&mut self, setup: &UsbSetupPacket, scratch: &mut [u8]) -> Result<Response, Stall> {
        let request = HidRequest::from_u8(setup.request).ok_or(Stall::UnsupportedRequest)?;
        let expected = match request {
            HidRequest::GetReport | HidRequest::GetIdle | HidRequest::GetProtocol => UsbDir::In,
            HidRequest::SetReport | HidRequest::SetIdle | HidRequest::SetProtocol => UsbDir::Out,
        };
        if setup.direction() != expected {
            return Err(Stall::WrongDirection);
        }
        // No report IDs in our report descriptor.
        let report_id = setup.value_low();

        match request {
            HidRequest::GetReport => {
                if report_id != 0 {
                    return Err(Stall::UnsupportedRequest);
                }
                let ty = HidReportType::from_u8(setup.value_high()).ok_or(Stall::UnsupportedRequest)?;
                let report = match ty {
                    HidReportType::Input => &self.tx_report,
                    HidReportType::Output => &self.output_report,
                    HidReportType::Feature => &self.feature_report,
                };
                let n = self.report_len.min(scratch.len());
                scratch[..n].copy_from_slice(&report[..n]);
                Ok(Response::In(InData::Scratch(n)))
            }
            HidRequest::SetReport => {
                if report_id != 0 {
                    return Err(Stall::UnsupportedRequest);
                }
                match HidReportType::from_u8(setup.value_high()) {
                    Some(HidReportType::Output | HidReportType::Feature) => {}
                    _ => return Err(Stall::UnsupportedRequest),
                }
                if usize::from(setup.length.get()) > self.report_len {
                    return Err(Stall::OversizedDataStage);
                }
                Ok(Response::Out)
            }
            HidRequest::GetIdle => {
                scratch[0] = self.idle;
                Ok(Response::In(InData::Scratch(1)))
            }
            HidRequest::SetIdle => {
                self.idle = setup.value_high();
                debug!("HID idle {}", self.idle);
                Ok(Response::Ack)
            }
            HidRequest::GetProtocol => {
                scratch[0] = self.protocol;
                Ok(Response::In(InData::Scratch(1)))
            }
            HidRequest::SetProtocol => match setup.value_low() {
                p @ (PROTOCOL_BOOT | PROTOCOL_REPORT) => {
                    self.protocol = p;
                    Ok(Response::Ack)
                }
                _ => Err(Stall::UnsupportedRequest),
            },
        }
    }

    /// Data stage of a `SET_REPORT` finished; store the report. Short
    /// reports are zero-filled.
    pub fn on_set_report(&mut self, setup: &UsbSetupPacket, data: &[u8]) {
        let slot = match HidReportType::from_u8(setup.value_high()) {
            Some(HidReportType::Output) => &mut self.output_report,
            Some(HidReportType::Feature) => &mut self.feature_report,
            // Refused when the SETUP arrived.
            _ => return,
        };
        let n = data.len().min(self.report_len);
        slot[..n].copy_from_slice(&data[..n]);
        slot[n..self.report_len].fill(0);
    }

    fn check(&self, interface: u8) -> Result<(), Error> {
        if interface == self.interface {
            Ok(())
        } else {
            Err(Error::UnknownInterface(interface))
        }
    }
}
