// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Errors surfaced to firmware calling into the engine.
///
/// Protocol-level problems never show up here; those are answered on the wire
/// with a STALL (see `control::Stall`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Tried to queue more bytes than the endpoint buffer holds. This is a
    /// programming error.
    #[error("{len} bytes exceed endpoint buffer capacity of {capacity}")]
    BufferOverflow { len: usize, capacity: usize },
    #[error("endpoint {0:#04x} is not in the buffer registry")]
    UnknownEndpoint(u8),
    /// The buffer currently belongs to the SIE; firmware may not touch it.
    #[error("endpoint {0:#04x} buffer is owned by the SIE")]
    EndpointBusy(u8),
    #[error("interface {0} does not exist")]
    UnknownInterface(u8),
    /// Non-control endpoints are only usable once configured and awake.
    #[error("device is not configured or is suspended")]
    NotReady,
    #[error("configuration value {0} is not supported")]
    InvalidConfiguration(u8),
    #[error("endpoint table has more entries than the buffer registry")]
    RegistryFull,
    #[error("endpoint {0:#04x} appears twice in the endpoint table")]
    DuplicateEndpoint(u8),
    #[error("endpoint {0:#04x} is larger than the largest supported packet")]
    CapacityTooLarge(u8),
}
