// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control transfer handler for endpoint 0.
//!
//! A control transfer is three stages: SETUP, an optional data stage in the
//! direction the SETUP names, and a status stage in the opposite direction
//! (or IN, when there was no data). The handler walks one transfer at a
//! time through
//!
//! ```text
//! Idle -> SetupReceived -> (DataIn | DataOut | no data) -> StatusIn/StatusOut -> Idle
//! ```
//!
//! A new SETUP always wins. Whatever the previous transfer was doing is
//! dropped on the floor without complaint, because that's what a host retry
//! looks like from down here.
//!
//! Requests we don't understand, or can't honor in the current state, are
//! answered with a protocol STALL on EP0 and the handler goes back to Idle.

use num_traits::FromPrimitive;

use crate::config::DeviceConfiguration;
use crate::endpoint::EndpointManager;
use crate::hid::HidClass;
use crate::sie::Sie;
use crate::state::{ConfigChange, DeviceState, DeviceStateController};
use crate::usb::{
    endpoint_number, DataPid, Recipient, RequestKind, UsbDescType, UsbDir, UsbSetupPacket,
    UsbSetupRequest, EP0_IN_ADDR, EP0_MAX_PACKET_SIZE, EP0_OUT_ADDR,
    FEATURE_DEVICE_REMOTE_WAKEUP, FEATURE_ENDPOINT_HALT,
};

/// Largest data stage we'll stage in scratch memory, either direction.
pub const SCRATCH_SIZE: usize = 64;

/// Why a request was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stall {
    UnsupportedRequest,
    UnknownDescriptor,
    InvalidConfiguration,
    /// The request isn't allowed in the current device state.
    InvalidState,
    /// Host wants to send more than we can hold.
    OversizedDataStage,
    InvalidAddress,
    /// The request names an interface or endpoint we don't have, or the
    /// wrong kind of recipient.
    InvalidRecipient,
    /// The SETUP direction doesn't match the request.
    WrongDirection,
    /// An endpoint operation failed underneath us.
    EndpointFault,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlStage {
    Idle,
    SetupReceived,
    DataIn,
    DataOut,
    /// Device sends the zero-length status packet.
    StatusIn,
    /// Device waits for the host's zero-length status packet.
    StatusOut,
}

/// What a decoded request wants to happen next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Send these bytes (trimmed to `wLength`).
    In(InData),
    /// Receive exactly `wLength` bytes into scratch.
    Out,
    /// No data stage; acknowledge with a zero-length IN.
    Ack,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InData {
    Static(&'static [u8]),
    /// The first `n` bytes of the handler's scratch buffer.
    Scratch(usize),
}

/// Work deferred until the transfer's status stage completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Completion {
    None,
    CommitAddress,
}

#[derive(Copy, Clone, Debug)]
struct ControlTransfer {
    setup: UsbSetupPacket,
    data: InData,
    /// Bytes moved so far in the data stage.
    offset: usize,
    /// Bytes the data stage will move in total.
    total: usize,
    /// A zero-length packet still has to terminate the IN data stage.
    zlp_pending: bool,
    completion: Completion,
}

/// Everything a request may touch, borrowed for the duration of one event.
pub struct ControlEnv<'a, S: Sie> {
    pub sie: &'a mut S,
    pub endpoints: &'a mut EndpointManager,
    pub state: &'a mut DeviceStateController,
    pub hid: &'a mut HidClass,
    pub config: &'static DeviceConfiguration,
}

pub struct ControlHandler {
    stage: ControlStage,
    transfer: Option<ControlTransfer>,
    scratch: [u8; SCRATCH_SIZE],
    stalls: u32,
}

impl Default for ControlHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandler {
    pub fn new() -> Self {
        Self {
            stage: ControlStage::Idle,
            transfer: None,
            scratch: [0; SCRATCH_SIZE],
            stalls: 0,
        }
    }

    pub fn stage(&self) -> ControlStage {
        self.stage
    }

    /// Number of requests answered with a STALL since power-up.
    pub fn stalls(&self) -> u32 {
        self.stalls
    }

    /// Forgets any transfer in flight. Used on bus reset.
    pub fn reset(&mut self) {
        self.stage = ControlStage::Idle;
        self.transfer = None;
    }

    /// A SETUP packet arrived on EP0.
    pub fn on_setup<S: Sie>(&mut self, raw: [u8; 8], env: &mut ControlEnv<'_, S>) {
        if self.stage != ControlStage::Idle {
            debug!("SETUP aborts transfer in stage {}", self.stage);
        }
        self.transfer = None;
        // An address staged by an unfinished SET_ADDRESS dies with it.
        env.state.clear_pending_address();
        self.stage = ControlStage::SetupReceived;

        // SETUP reclaims both halves of EP0, and the first data packet in
        // either direction, as well as the status packet, is DATA1.
        let reclaimed = env
            .endpoints
            .release(env.sie, EP0_IN_ADDR)
            .and_then(|_| env.endpoints.release(env.sie, EP0_OUT_ADDR))
            .and_then(|_| env.endpoints.set_next_pid(EP0_IN_ADDR, DataPid::Data1))
            .and_then(|_| env.endpoints.set_next_pid(EP0_OUT_ADDR, DataPid::Data1));
        if let Err(e) = reclaimed {
            error!("EP0 unavailable: {}", e);
            self.stall(Stall::EndpointFault, env);
            return;
        }

        let Some(setup) = UsbSetupPacket::parse(&raw) else {
            self.stall(Stall::UnsupportedRequest, env);
            return;
        };
        trace!(
            "SETUP {:#x} {:#x} value={:#x} index={:#x} length={}",
            setup.request_type,
            setup.request,
            setup.value.get(),
            setup.index.get(),
            setup.length.get()
        );

        match self.dispatch(&setup, env) {
            Ok((response, completion)) => {
                if let Err(stall) = self.begin(setup, response, completion, env) {
                    self.stall(stall, env);
                }
            }
            Err(stall) => self.stall(stall, env),
        }
    }

    /// The SIE finished sending a packet on EP0 IN.
    pub fn on_in_complete<S: Sie>(&mut self, env: &mut ControlEnv<'_, S>) {
        if let Err(e) = env.endpoints.commit_sent(EP0_IN_ADDR) {
            error!("EP0 IN commit failed: {}", e);
        }
        match self.stage {
            ControlStage::DataIn => {
                let result = match self.transfer {
                    Some(t) if t.offset < t.total => self.send_chunk(env),
                    Some(mut t) if t.zlp_pending => {
                        t.zlp_pending = false;
                        self.transfer = Some(t);
                        env.endpoints
                            .queue_for_send(env.sie, EP0_IN_ADDR, &[])
                            .map_err(|_| Stall::EndpointFault)
                    }
                    _ => {
                        // Data stage done; EP0 OUT is already armed for
                        // the host's status packet.
                        self.stage = ControlStage::StatusOut;
                        Ok(())
                    }
                };
                if let Err(stall) = result {
                    self.stall(stall, env);
                }
            }
            ControlStage::StatusIn => {
                if let Some(ControlTransfer {
                    completion: Completion::CommitAddress,
                    ..
                }) = self.transfer
                {
                    if let Some(address) = env.state.on_set_address_status_stage_complete() {
                        env.sie.set_address(address);
                    }
                }
                self.finish(env);
            }
            stage => {
                debug!("EP0 IN complete in stage {}", stage);
            }
        }
    }

    /// The SIE finished receiving a (non-SETUP) packet on EP0 OUT.
    pub fn on_out_complete<S: Sie>(&mut self, env: &mut ControlEnv<'_, S>) {
        let n = match env.endpoints.commit_received(env.sie, EP0_OUT_ADDR) {
            Ok(n) => n,
            Err(e) => {
                error!("EP0 OUT commit failed: {}", e);
                return;
            }
        };
        match self.stage {
            ControlStage::DataOut => {
                if let Err(stall) = self.receive_chunk(n, env) {
                    self.stall(stall, env);
                }
            }
            ControlStage::StatusOut | ControlStage::DataIn => {
                // Host status packet. During DataIn this means the host
                // has seen enough and is cutting the data stage short.
                if self.stage == ControlStage::DataIn {
                    if let Err(e) = env.endpoints.release(env.sie, EP0_IN_ADDR) {
                        error!("could not release EP0 IN: {}", e);
                    }
                }
                self.finish(env);
            }
            stage => {
                debug!("unexpected EP0 OUT ({} bytes) in stage {}", n, stage);
                self.arm_out(env);
            }
        }
    }

    fn begin<S: Sie>(
        &mut self,
        setup: UsbSetupPacket,
        response: Response,
        completion: Completion,
        env: &mut ControlEnv<'_, S>,
    ) -> Result<(), Stall> {
        let requested = usize::from(setup.length.get());
        let mut transfer = ControlTransfer {
            setup,
            data: InData::Scratch(0),
            offset: 0,
            total: 0,
            zlp_pending: false,
            completion,
        };
        match response {
            // No data stage at all: straight to the device's status packet.
            Response::In(_) if requested == 0 => {
                self.transfer = Some(transfer);
                self.send_status(env)
            }
            Response::In(data) => {
                let available = match data {
                    InData::Static(bytes) => bytes.len(),
                    InData::Scratch(n) => n,
                };
                transfer.data = data;
                transfer.total = available.min(requested);
                // A data stage that ends on a full packet, short of what the
                // host asked for, needs a zero-length packet to end it.
                transfer.zlp_pending =
                    transfer.total < requested && transfer.total % EP0_MAX_PACKET_SIZE == 0;
                self.transfer = Some(transfer);
                self.stage = ControlStage::DataIn;
                self.arm_out(env);
                self.send_chunk(env)
            }
            Response::Out if requested > 0 => {
                if requested > SCRATCH_SIZE {
                    return Err(Stall::OversizedDataStage);
                }
                transfer.total = requested;
                self.transfer = Some(transfer);
                self.stage = ControlStage::DataOut;
                self.arm_out(env);
                Ok(())
            }
            Response::Out | Response::Ack => {
                self.transfer = Some(transfer);
                self.send_status(env)
            }
        }
    }

    fn send_chunk<S: Sie>(&mut self, env: &mut ControlEnv<'_, S>) -> Result<(), Stall> {
        let Some(t) = self.transfer.as_mut() else {
            return Err(Stall::EndpointFault);
        };
        let end = (t.offset + EP0_MAX_PACKET_SIZE).min(t.total);
        let chunk = match t.data {
            InData::Static(bytes) => &bytes[t.offset..end],
            InData::Scratch(_) => &self.scratch[t.offset..end],
        };
        t.offset = end;
        env.endpoints
            .queue_for_send(env.sie, EP0_IN_ADDR, chunk)
            .map_err(|_| Stall::EndpointFault)
    }

    fn receive_chunk<S: Sie>(
        &mut self,
        n: usize,
        env: &mut ControlEnv<'_, S>,
    ) -> Result<(), Stall> {
        let Some(t) = self.transfer.as_mut() else {
            return Err(Stall::EndpointFault);
        };
        if t.offset + n > t.total {
            return Err(Stall::OversizedDataStage);
        }
        if let Some(data) = env.endpoints.received(EP0_OUT_ADDR) {
            self.scratch[t.offset..t.offset + data.len()].copy_from_slice(data);
        }
        t.offset += n;

        if t.offset < t.total && n == EP0_MAX_PACKET_SIZE {
            self.arm_out(env);
            return Ok(());
        }

        // Data stage complete (full length, or cut short by a short packet).
        let setup = t.setup;
        let received = t.offset;
        if setup.kind() == RequestKind::Class {
            env.hid.on_set_report(&setup, &self.scratch[..received]);
        }
        self.send_status(env)
    }

    fn send_status<S: Sie>(&mut self, env: &mut ControlEnv<'_, S>) -> Result<(), Stall> {
        self.stage = ControlStage::StatusIn;
        env.endpoints
            .queue_for_send(env.sie, EP0_IN_ADDR, &[])
            .map_err(|_| Stall::EndpointFault)
    }

    fn finish<S: Sie>(&mut self, env: &mut ControlEnv<'_, S>) {
        self.stage = ControlStage::Idle;
        self.transfer = None;
        self.arm_out(env);
    }

    fn stall<S: Sie>(&mut self, reason: Stall, env: &mut ControlEnv<'_, S>) {
        warn!("STALL: {}", reason);
        self.stalls = self.stalls.wrapping_add(1);
        env.sie.stall_control();
        // The SIE dropped both halves of EP0; keep our books in step.
        for address in [EP0_IN_ADDR, EP0_OUT_ADDR] {
            if let Err(e) = env.endpoints.release(env.sie, address) {
                error!("could not release {:#x}: {}", address, e);
            }
        }
        self.stage = ControlStage::Idle;
        self.transfer = None;
        self.arm_out(env);
    }

    fn arm_out<S: Sie>(&mut self, env: &mut ControlEnv<'_, S>) {
        if let Err(e) = env.endpoints.arm(env.sie, EP0_OUT_ADDR) {
            error!("could not arm EP0 OUT: {}", e);
        }
    }

    fn dispatch<S: Sie>(
        &mut self,
        setup: &UsbSetupPacket,
        env: &mut ControlEnv<'_, S>,
    ) -> Result<(Response, Completion), Stall> {
        match setup.kind() {
            RequestKind::Standard => self.standard(setup, env),
            RequestKind::Class => {
                if setup.recipient() != Some(Recipient::Interface)
                    || setup.index.get() != u16::from(env.config.hid_interface)
                {
                    return Err(Stall::InvalidRecipient);
                }
                if env.state.state() != DeviceState::Configured {
                    return Err(Stall::InvalidState);
                }
                env.hid
                    .class_request(setup, &mut self.scratch)
                    .map(|r| (r, Completion::None))
            }
            RequestKind::Vendor | RequestKind::Reserved => Err(Stall::UnsupportedRequest),
        }
    }

    fn standard<S: Sie>(
        &mut self,
        setup: &UsbSetupPacket,
        env: &mut ControlEnv<'_, S>,
    ) -> Result<(Response, Completion), Stall> {
        let request =
            UsbSetupRequest::from_u8(setup.request).ok_or(Stall::UnsupportedRequest)?;
        let recipient = setup.recipient().ok_or(Stall::InvalidRecipient)?;
        let expected = match request {
            UsbSetupRequest::GetStatus
            | UsbSetupRequest::GetDescriptor
            | UsbSetupRequest::GetConfiguration
            | UsbSetupRequest::GetInterface
            | UsbSetupRequest::SynchFrame => UsbDir::In,
            _ => UsbDir::Out,
        };
        if setup.direction() != expected {
            return Err(Stall::WrongDirection);
        }
        let configured = env.state.state() == DeviceState::Configured;
        let ack = Ok((Response::Ack, Completion::None));

        match request {
            UsbSetupRequest::GetStatus => {
                let status = match recipient {
                    Recipient::Device => {
                        let self_powered = env.config.descriptors.configuration.config.attributes
                            & 0x40
                            != 0;
                        u16::from(self_powered) | u16::from(env.state.remote_wakeup()) << 1
                    }
                    Recipient::Interface => {
                        self.check_interface(setup, env)?;
                        0
                    }
                    Recipient::Endpoint => u16::from(self.endpoint_halted(setup, env)?),
                    Recipient::Other => return Err(Stall::InvalidRecipient),
                };
                self.scratch[..2].copy_from_slice(&status.to_le_bytes());
                Ok((Response::In(InData::Scratch(2)), Completion::None))
            }

            UsbSetupRequest::ClearFeature | UsbSetupRequest::SetFeature => {
                let set = request == UsbSetupRequest::SetFeature;
                match (recipient, setup.value.get()) {
                    (Recipient::Device, FEATURE_DEVICE_REMOTE_WAKEUP) => {
                        env.state.set_remote_wakeup(set);
                        ack
                    }
                    (Recipient::Endpoint, FEATURE_ENDPOINT_HALT) => {
                        // Validates the endpoint as a side effect.
                        self.endpoint_halted(setup, env)?;
                        let address = setup.index.get() as u8;
                        if endpoint_number(address) != 0 {
                            env.endpoints
                                .set_halt(env.sie, address, set)
                                .map_err(|_| Stall::InvalidRecipient)?;
                        }
                        ack
                    }
                    _ => Err(Stall::UnsupportedRequest),
                }
            }

            UsbSetupRequest::SetAddress => {
                let address = setup.value.get();
                if recipient != Recipient::Device {
                    return Err(Stall::InvalidRecipient);
                }
                if address > 127 || setup.index.get() != 0 || setup.length.get() != 0 {
                    return Err(Stall::InvalidAddress);
                }
                if configured {
                    return Err(Stall::InvalidState);
                }
                debug!("SET_ADDRESS {}", address);
                env.state.stage_address(address as u8);
                Ok((Response::Ack, Completion::CommitAddress))
            }

            UsbSetupRequest::GetDescriptor => {
                let ty = UsbDescType::from_u8(setup.value_high()).ok_or(Stall::UnknownDescriptor)?;
                let allowed = match recipient {
                    Recipient::Device => matches!(
                        ty,
                        UsbDescType::Device | UsbDescType::Config | UsbDescType::String
                    ),
                    Recipient::Interface => {
                        self.check_interface_exists(setup, env)?;
                        matches!(ty, UsbDescType::Hid | UsbDescType::Report)
                    }
                    _ => false,
                };
                if !allowed {
                    return Err(Stall::UnknownDescriptor);
                }
                let bytes = env
                    .config
                    .descriptors
                    .get(ty, setup.value_low())
                    .ok_or(Stall::UnknownDescriptor)?;
                debug!(
                    "GET_DESCRIPTOR {} {} ({} of {} bytes)",
                    ty,
                    setup.value_low(),
                    setup.length.get(),
                    bytes.len()
                );
                Ok((Response::In(InData::Static(bytes)), Completion::None))
            }

            UsbSetupRequest::GetConfiguration => {
                if recipient != Recipient::Device {
                    return Err(Stall::InvalidRecipient);
                }
                self.scratch[0] = env.state.configuration();
                Ok((Response::In(InData::Scratch(1)), Completion::None))
            }

            UsbSetupRequest::SetConfiguration => {
                if recipient != Recipient::Device {
                    return Err(Stall::InvalidRecipient);
                }
                let value = setup.value_low();
                let change = env
                    .state
                    .on_set_configuration(value)
                    .map_err(|_| Stall::InvalidConfiguration)?;
                let armed = match change {
                    ConfigChange::Configured => env.hid.activate(env.endpoints, env.sie),
                    ConfigChange::Deconfigured => env.hid.deactivate(env.endpoints, env.sie),
                    ConfigChange::Unchanged => Ok(()),
                };
                armed.map_err(|_| Stall::EndpointFault)?;
                ack
            }

            UsbSetupRequest::GetInterface => {
                self.check_interface(setup, env)?;
                self.scratch[0] = 0;
                Ok((Response::In(InData::Scratch(1)), Completion::None))
            }

            UsbSetupRequest::SetInterface => {
                self.check_interface(setup, env)?;
                if setup.value.get() != 0 {
                    return Err(Stall::UnsupportedRequest);
                }
                // Selecting the (only) alternate setting resets its endpoints.
                env.hid
                    .activate(env.endpoints, env.sie)
                    .map_err(|_| Stall::EndpointFault)?;
                ack
            }

            UsbSetupRequest::SetDescriptor | UsbSetupRequest::SynchFrame => {
                Err(Stall::UnsupportedRequest)
            }
        }
    }

    /// Interface requests other than descriptor reads need the device
    /// configured and the interface to exist.
    fn check_interface<S: Sie>(
        &self,
        setup: &UsbSetupPacket,
        env: &ControlEnv<'_, S>,
    ) -> Result<(), Stall> {
        if env.state.state() != DeviceState::Configured {
            return Err(Stall::InvalidState);
        }
        self.check_interface_exists(setup, env)
    }

    fn check_interface_exists<S: Sie>(
        &self,
        setup: &UsbSetupPacket,
        env: &ControlEnv<'_, S>,
    ) -> Result<(), Stall> {
        if setup.recipient() != Some(Recipient::Interface)
            || setup.index.get() != u16::from(env.config.hid_interface)
        {
            return Err(Stall::InvalidRecipient);
        }
        Ok(())
    }

    /// Halt state of the endpoint named in `wIndex`. Endpoint 0 is always
    /// available; the others only once configured.
    fn endpoint_halted<S: Sie>(
        &self,
        setup: &UsbSetupPacket,
        env: &ControlEnv<'_, S>,
    ) -> Result<bool, Stall> {
        let address = u8::try_from(setup.index.get()).map_err(|_| Stall::InvalidRecipient)?;
        if endpoint_number(address) == 0 {
            return Ok(false);
        }
        if env.state.state() != DeviceState::Configured {
            return Err(Stall::InvalidState);
        }
        env.endpoints
            .is_halted(address)
            .ok_or(Stall::InvalidRecipient)
    }
}
