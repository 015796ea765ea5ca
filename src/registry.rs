// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffer registry: the fixed table of endpoint buffers.
//!
//! Each endpoint direction named in the `DeviceConfiguration` gets a slot
//! holding its capacity and its storage. Slots are found by endpoint address.
//! The table is sized at compile time and filled once, at initialization;
//! nothing is added or removed afterwards.

use crate::config::EndpointConfig;
use crate::error::Error;

/// Largest packet any slot can hold (full-speed bulk/interrupt maximum).
pub const MAX_PACKET_SIZE: usize = 64;

/// Number of endpoint directions the registry can hold.
pub const MAX_SLOTS: usize = 8;

/// Index of a slot in the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotId(u8);

impl SlotId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

struct Slot {
    config: EndpointConfig,
    storage: [u8; MAX_PACKET_SIZE],
}

pub struct BufferRegistry {
    slots: [Option<Slot>; MAX_SLOTS],
}

impl BufferRegistry {
    /// Builds the registry from an endpoint table, rejecting tables that do
    /// not fit or that name an endpoint twice.
    pub fn new(endpoints: &[EndpointConfig]) -> Result<Self, Error> {
        const EMPTY: Option<Slot> = None;
        let mut slots = [EMPTY; MAX_SLOTS];

        if endpoints.len() > MAX_SLOTS {
            return Err(Error::RegistryFull);
        }
        for (i, ep) in endpoints.iter().enumerate() {
            if usize::from(ep.capacity) > MAX_PACKET_SIZE {
                return Err(Error::CapacityTooLarge(ep.address));
            }
            if endpoints[..i].iter().any(|e| e.address == ep.address) {
                return Err(Error::DuplicateEndpoint(ep.address));
            }
            slots[i] = Some(Slot {
                config: *ep,
                storage: [0; MAX_PACKET_SIZE],
            });
        }
        Ok(Self { slots })
    }

    pub fn lookup(&self, address: u8) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(s) if s.config.address == address))
            .map(|i| SlotId(i as u8))
    }

    /// Iterates over every registered slot in table order.
    pub fn slots(&self) -> impl Iterator<Item = (SlotId, &EndpointConfig)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SlotId(i as u8), &s.config)))
    }

    pub fn config(&self, id: SlotId) -> Option<&EndpointConfig> {
        self.slot(id).map(|s| &s.config)
    }

    pub fn capacity(&self, id: SlotId) -> usize {
        self.slot(id).map_or(0, |s| usize::from(s.config.capacity))
    }

    /// The slot's storage, trimmed to its capacity.
    pub fn storage(&self, id: SlotId) -> &[u8] {
        match self.slot(id) {
            Some(s) => &s.storage[..usize::from(s.config.capacity)],
            None => &[],
        }
    }

    pub fn storage_mut(&mut self, id: SlotId) -> &mut [u8] {
        match self.slots.get_mut(id.index()).and_then(Option::as_mut) {
            Some(s) => &mut s.storage[..usize::from(s.config.capacity)],
            None => &mut [],
        }
    }

    fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }
}
