// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint/buffer manager.
//!
//! Every endpoint buffer belongs either to the CPU or to the SIE, never both.
//! Firmware may only read or write a buffer it owns. Arming a buffer hands it
//! to the SIE; the SIE hands it back by completing a transaction, which the
//! dispatcher reports through `commit_received` / `commit_sent`.
//!
//! An endpoint that is not armed NAKs every token aimed at it. That's how
//! backpressure works here: if firmware doesn't re-arm an OUT endpoint after
//! draining it, the host simply keeps retrying.

use crate::error::Error;
use crate::registry::{BufferRegistry, SlotId, MAX_SLOTS};
use crate::sie::Sie;
use crate::usb::{DataPid, UsbDir};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Owner {
    Cpu,
    Sie,
}

/// Bookkeeping for one endpoint direction. The bytes themselves live in the
/// registry slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointBuffer {
    pub address: u8,
    pub direction: UsbDir,
    pub capacity: usize,
    /// Bytes received (OUT, CPU-owned) or queued (IN, SIE-owned).
    pub len: usize,
    pub owner: Owner,
    /// Whether the SIE has actually been told about the buffer. A SIE-owned
    /// buffer that isn't armed is simply parked, e.g. after a bus reset.
    pub armed: bool,
    pub next_pid: DataPid,
    pub halted: bool,
}

impl EndpointBuffer {
    fn parked(address: u8, capacity: usize) -> Self {
        Self {
            address,
            direction: UsbDir::of_endpoint_addr(address),
            capacity,
            len: 0,
            owner: Owner::Sie,
            armed: false,
            next_pid: DataPid::Data0,
            halted: false,
        }
    }
}

pub struct EndpointManager {
    registry: BufferRegistry,
    buffers: [Option<EndpointBuffer>; MAX_SLOTS],
}

impl EndpointManager {
    pub fn new(registry: BufferRegistry) -> Self {
        let mut buffers = [None; MAX_SLOTS];
        for (id, ep) in registry.slots() {
            buffers[id.index()] = Some(EndpointBuffer::parked(ep.address, usize::from(ep.capacity)));
        }
        Self { registry, buffers }
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn buffer(&self, address: u8) -> Option<&EndpointBuffer> {
        let id = self.registry.lookup(address)?;
        self.buffers[id.index()].as_ref()
    }

    /// Takes every buffer away from firmware: SIE-owned, empty, toggles back
    /// to DATA0, halts cleared. Nothing is armed; the caller re-arms EP0.
    pub fn reset(&mut self, sie: &mut impl Sie) {
        for buf in self.buffers.iter_mut().flatten() {
            if buf.armed {
                sie.disarm(buf.address);
            }
            if buf.halted {
                sie.set_stall(buf.address, false);
            }
            *buf = EndpointBuffer::parked(buf.address, buf.capacity);
        }
    }

    /// Hands a buffer to the SIE. OUT buffers become ready to receive up to
    /// their capacity; IN buffers transmit whatever was last queued.
    ///
    /// Arming a buffer that is already armed is a no-op.
    pub fn arm(&mut self, sie: &mut impl Sie, address: u8) -> Result<(), Error> {
        let id = self.id(address)?;
        let buf = self.buffer_mut(id)?;
        if buf.owner == Owner::Sie && buf.armed {
            return Ok(());
        }
        let (direction, pid, capacity, len) = (buf.direction, buf.next_pid, buf.capacity, buf.len);
        let num = crate::usb::endpoint_number(address);
        let len = match direction {
            UsbDir::Out => {
                sie.arm_out(num, capacity, pid);
                0
            }
            UsbDir::In => {
                sie.arm_in(num, &self.registry.storage(id)[..len], pid);
                len
            }
        };
        let buf = self.buffer_mut(id)?;
        buf.owner = Owner::Sie;
        buf.armed = true;
        buf.len = len;
        trace!("armed {:#x} ({} bytes)", address, buf.len);
        Ok(())
    }

    /// Takes a buffer back from the SIE without a transaction and gives it
    /// to firmware, empty.
    pub fn release(&mut self, sie: &mut impl Sie, address: u8) -> Result<(), Error> {
        let id = self.id(address)?;
        let buf = self.buffer_mut(id)?;
        if buf.armed {
            sie.disarm(address);
        }
        buf.owner = Owner::Cpu;
        buf.armed = false;
        buf.len = 0;
        Ok(())
    }

    /// Parks a buffer: SIE-owned but not armed, so the endpoint NAKs and
    /// firmware can't touch it.
    pub fn park(&mut self, sie: &mut impl Sie, address: u8) -> Result<(), Error> {
        let id = self.id(address)?;
        let buf = self.buffer_mut(id)?;
        if buf.armed {
            sie.disarm(address);
        }
        buf.owner = Owner::Sie;
        buf.armed = false;
        buf.len = 0;
        Ok(())
    }

    /// The SIE finished an OUT transaction: copy the data out, flip ownership
    /// to the CPU, and return how many bytes arrived.
    pub fn commit_received(&mut self, sie: &mut impl Sie, address: u8) -> Result<usize, Error> {
        let id = self.id(address)?;
        let buf = self.buffer_mut(id)?;
        if buf.owner == Owner::Cpu {
            warn!("OUT completion on CPU-owned buffer {:#x}", address);
            return Ok(buf.len);
        }
        let num = crate::usb::endpoint_number(address);
        let n = sie.read_out(num, self.registry.storage_mut(id));
        let buf = self.buffer_mut(id)?;
        buf.len = n.min(buf.capacity);
        buf.owner = Owner::Cpu;
        buf.armed = false;
        buf.next_pid = buf.next_pid.toggled();
        Ok(buf.len)
    }

    /// The SIE finished an IN transaction: the buffer is free for the next
    /// packet.
    pub fn commit_sent(&mut self, address: u8) -> Result<(), Error> {
        let id = self.id(address)?;
        let buf = self.buffer_mut(id)?;
        if buf.owner == Owner::Cpu {
            warn!("IN completion on CPU-owned buffer {:#x}", address);
            return Ok(());
        }
        buf.len = 0;
        buf.owner = Owner::Cpu;
        buf.armed = false;
        buf.next_pid = buf.next_pid.toggled();
        Ok(())
    }

    /// Copies `data` into an IN buffer and hands it to the SIE.
    ///
    /// Fails with `BufferOverflow` if `data` is longer than the buffer, and
    /// with `EndpointBusy` if the previous packet hasn't been collected yet.
    pub fn queue_for_send(
        &mut self,
        sie: &mut impl Sie,
        address: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        let id = self.id(address)?;
        let buf = self.buffer_mut(id)?;
        if data.len() > buf.capacity {
            return Err(Error::BufferOverflow {
                len: data.len(),
                capacity: buf.capacity,
            });
        }
        if buf.owner == Owner::Sie {
            return Err(Error::EndpointBusy(address));
        }
        buf.len = data.len();
        self.registry.storage_mut(id)[..data.len()].copy_from_slice(data);
        self.arm(sie, address)
    }

    /// Data received on a CPU-owned OUT buffer, if there is any.
    pub fn received(&self, address: u8) -> Option<&[u8]> {
        let id = self.registry.lookup(address)?;
        let buf = self.buffers[id.index()].as_ref()?;
        if buf.direction == UsbDir::Out && buf.owner == Owner::Cpu && buf.len > 0 {
            Some(&self.registry.storage(id)[..buf.len])
        } else {
            None
        }
    }

    pub fn is_cpu_owned(&self, address: u8) -> bool {
        self.buffer(address).map_or(false, |b| b.owner == Owner::Cpu)
    }

    pub fn set_next_pid(&mut self, address: u8, pid: DataPid) -> Result<(), Error> {
        let id = self.id(address)?;
        self.buffer_mut(id)?.next_pid = pid;
        Ok(())
    }

    /// Sets or clears the endpoint halt feature. Clearing it also resets the
    /// data toggle, as chapter 9 requires.
    pub fn set_halt(&mut self, sie: &mut impl Sie, address: u8, halted: bool) -> Result<(), Error> {
        let id = self.id(address)?;
        let buf = self.buffer_mut(id)?;
        buf.halted = halted;
        if !halted {
            buf.next_pid = DataPid::Data0;
        }
        sie.set_stall(address, halted);
        Ok(())
    }

    pub fn is_halted(&self, address: u8) -> Option<bool> {
        self.buffer(address).map(|b| b.halted)
    }

    fn id(&self, address: u8) -> Result<SlotId, Error> {
        self.registry
            .lookup(address)
            .ok_or(Error::UnknownEndpoint(address))
    }

    fn buffer_mut(&mut self, id: SlotId) -> Result<&mut EndpointBuffer, Error> {
        self.buffers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(Error::UnknownEndpoint(0xFF))
    }
}
