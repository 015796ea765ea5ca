// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt dispatcher.
//!
//! The USB interrupt handler does as little as it can: it reads what the SIE
//! has pending, turns it into `UsbEvent`s, and pushes them onto an
//! `EventQueue` for the main loop. Bus errors are counted right here and
//! never reach the queue. The protocol engine itself runs in the foreground
//! (`UsbDevice::service`), one event at a time.
//!
//! The queue is single-producer (the interrupt handler) single-consumer (the
//! main loop) and uses only atomic loads and stores, which is all a
//! Cortex-M0+ has.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::sie::{BusErrors, Interrupts, Sie};
use crate::usb::{TokenPid, UsbDir};

/// Something the SIE reported, in the order it happened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbEvent {
    Reset,
    /// A SETUP packet, copied out of the SIE before anything can
    /// overwrite it.
    Setup([u8; 8]),
    /// An OUT transaction completed on this endpoint number.
    Out(u8),
    /// An IN transaction completed on this endpoint number.
    In(u8),
    Suspend,
    Resume,
}

/// Fixed-capacity event channel from the interrupt handler to the main loop.
///
/// Bus reset doesn't go through the ring. It's a sticky flag that, when the
/// consumer sees it, also throws away every event queued before it, so a
/// reset can never be lost to a full queue.
pub struct EventQueue<const N: usize> {
    slots: UnsafeCell<[UsbEvent; N]>,
    /// Next slot to read. Only the consumer writes it.
    head: AtomicUsize,
    /// Next slot to write. Only the producer writes it.
    tail: AtomicUsize,
    reset: AtomicBool,
    /// `tail` at the moment of the most recent reset.
    reset_at: AtomicUsize,
    throttled: AtomicBool,
}

// Safety: the producer only writes slots in [tail, head + N) and the
// consumer only reads slots in [head, tail); the atomics publish each slot
// before the other side can look at it.
unsafe impl<const N: usize> Sync for EventQueue<N> {}

impl<const N: usize> Default for EventQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> EventQueue<N> {
    pub const fn new() -> Self {
        Self {
            slots: UnsafeCell::new([UsbEvent::Reset; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            reset: AtomicBool::new(false),
            reset_at: AtomicUsize::new(0),
            throttled: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && !self.reset.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Producer side. Hands the event back if there's no room.
    pub fn push(&self, event: UsbEvent) -> Result<(), UsbEvent> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= N {
            return Err(event);
        }
        // Safety: slot `tail` is outside [head, tail), so the consumer isn't
        // reading it, and we are the only producer.
        unsafe {
            (self.slots.get() as *mut UsbEvent).add(tail % N).write(event);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Producer side. Always succeeds.
    pub fn push_reset(&self) {
        self.reset_at
            .store(self.tail.load(Ordering::Relaxed), Ordering::Relaxed);
        self.reset.store(true, Ordering::Release);
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<UsbEvent> {
        // Tail first: anything pushed after a reset was pushed after the
        // reset flag was raised, so we can't see one without the other.
        let tail = self.tail.load(Ordering::Acquire);
        if self.reset.load(Ordering::Acquire) {
            self.reset.store(false, Ordering::Relaxed);
            let at = self.reset_at.load(Ordering::Acquire);
            self.head.store(at, Ordering::Release);
            return Some(UsbEvent::Reset);
        }
        let head = self.head.load(Ordering::Relaxed);
        if head == tail {
            return None;
        }
        // Safety: slot `head` is in [head, tail), published by the producer's
        // release store of `tail`, and won't be rewritten until we move
        // `head` past it.
        let event = unsafe { (self.slots.get() as *const UsbEvent).add(head % N).read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(event)
    }

    /// Producer side: the queue filled up and some sources were masked.
    pub fn throttle(&self) {
        self.throttled.store(true, Ordering::Release);
    }

    /// Consumer side: whether sources were masked since the last call.
    pub fn take_throttled(&self) -> bool {
        if self.throttled.load(Ordering::Acquire) {
            self.throttled.store(false, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// Bus error tallies. Only the interrupt handler writes these, so a plain
/// load and store is enough to bump one.
#[derive(Default)]
pub struct ErrorCounters {
    pid: AtomicU32,
    crc5: AtomicU32,
    crc16: AtomicU32,
    data_field: AtomicU32,
    turnaround: AtomicU32,
    bit_stuff: AtomicU32,
    overruns: AtomicU32,
}

/// A copy of the counters at one instant.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCounts {
    pub pid: u32,
    pub crc5: u32,
    pub crc16: u32,
    pub data_field: u32,
    pub turnaround: u32,
    pub bit_stuff: u32,
    /// Times the event queue was full and interrupt sources were masked.
    pub overruns: u32,
}

impl ErrorCounts {
    pub fn bus_errors(&self) -> u32 {
        self.pid + self.crc5 + self.crc16 + self.data_field + self.turnaround + self.bit_stuff
    }
}

fn bump(counter: &AtomicU32) {
    counter.store(counter.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
}

impl ErrorCounters {
    pub const fn new() -> Self {
        Self {
            pid: AtomicU32::new(0),
            crc5: AtomicU32::new(0),
            crc16: AtomicU32::new(0),
            data_field: AtomicU32::new(0),
            turnaround: AtomicU32::new(0),
            bit_stuff: AtomicU32::new(0),
            overruns: AtomicU32::new(0),
        }
    }

    fn record(&self, errors: BusErrors) {
        let table = [
            (BusErrors::PID, &self.pid),
            (BusErrors::CRC5, &self.crc5),
            (BusErrors::CRC16, &self.crc16),
            (BusErrors::DATA_FIELD, &self.data_field),
            (BusErrors::TURNAROUND_TIMEOUT, &self.turnaround),
            (BusErrors::BIT_STUFF, &self.bit_stuff),
        ];
        for (flag, counter) in table {
            if errors.contains(flag) {
                bump(counter);
            }
        }
    }

    pub fn snapshot(&self) -> ErrorCounts {
        ErrorCounts {
            pid: self.pid.load(Ordering::Relaxed),
            crc5: self.crc5.load(Ordering::Relaxed),
            crc16: self.crc16.load(Ordering::Relaxed),
            data_field: self.data_field.load(Ordering::Relaxed),
            turnaround: self.turnaround.load(Ordering::Relaxed),
            bit_stuff: self.bit_stuff.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

/// Sources still allowed while the queue is full: reset doesn't need a
/// slot, and errors are only counted.
const THROTTLED: Interrupts = Interrupts::RESET.union(Interrupts::ERROR);

/// The interrupt-context half of the engine. Meant to live in a `static`
/// next to the `EventQueue`.
pub struct InterruptDispatcher {
    errors: ErrorCounters,
}

impl Default for InterruptDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptDispatcher {
    pub const fn new() -> Self {
        Self {
            errors: ErrorCounters::new(),
        }
    }

    pub fn errors(&self) -> ErrorCounts {
        self.errors.snapshot()
    }

    /// Interrupt entry point. Handles, in order: bus reset, completed
    /// transactions, start of frame, bus errors, then suspend and resume.
    /// Acknowledges the aggregate interrupt exactly once on the way out.
    pub fn capture<S: Sie, const N: usize>(&self, sie: &mut S, queue: &EventQueue<N>) {
        let pending = sie.pending();

        if pending.contains(Interrupts::RESET) {
            // Whatever the SIE still had queued belongs to the old session.
            while sie.next_transaction().is_some() {}
            sie.clear(Interrupts::RESET | Interrupts::TRANSACTION | Interrupts::STALL);
            queue.push_reset();
            debug!("bus reset");
        } else if pending.contains(Interrupts::TRANSACTION) {
            self.capture_transactions(sie, queue);
        }

        if pending.contains(Interrupts::SOF) {
            sie.clear(Interrupts::SOF);
        }

        if pending.contains(Interrupts::STALL) {
            // Only tells us a STALL handshake went out.
            sie.clear(Interrupts::STALL);
        }

        if pending.contains(Interrupts::ERROR) {
            let errors = sie.take_bus_errors();
            self.errors.record(errors);
            sie.clear(Interrupts::ERROR);
            debug!("bus errors {:#x}", errors.bits());
        }

        for (flag, event) in [
            (Interrupts::IDLE, UsbEvent::Suspend),
            (Interrupts::ACTIVITY, UsbEvent::Resume),
        ] {
            if pending.contains(flag) {
                if queue.push(event).is_ok() {
                    sie.clear(flag);
                } else {
                    self.throttle(sie, queue);
                }
            }
        }

        sie.clear_aggregate();
    }

    fn capture_transactions<S: Sie, const N: usize>(&self, sie: &mut S, queue: &EventQueue<N>) {
        loop {
            if queue.is_full() {
                // Leave the rest in the SIE's status queue; the SIE NAKs
                // until there's room again.
                self.throttle(sie, queue);
                return;
            }
            let Some(t) = sie.next_transaction() else {
                break;
            };
            let event = match (t.pid, t.direction) {
                (TokenPid::Setup, _) => UsbEvent::Setup(sie.read_setup()),
                (_, UsbDir::Out) => UsbEvent::Out(t.endpoint),
                (_, UsbDir::In) => UsbEvent::In(t.endpoint),
            };
            // Room was checked above and we're the only producer.
            let _ = queue.push(event);
        }
        sie.clear(Interrupts::TRANSACTION);
    }

    fn throttle<S: Sie, const N: usize>(&self, sie: &mut S, queue: &EventQueue<N>) {
        warn!("event queue full, masking USB sources");
        bump(&self.errors.overruns);
        sie.enable(THROTTLED);
        queue.throttle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSie;

    fn sie() -> SimSie {
        let mut sie = SimSie::new();
        sie.enable(Interrupts::ENABLED);
        sie
    }

    #[test]
    fn queue_is_fifo() {
        let q: EventQueue<4> = EventQueue::new();
        assert!(q.is_empty());
        q.push(UsbEvent::Out(1)).unwrap();
        q.push(UsbEvent::In(1)).unwrap();
        assert_eq!(q.pop(), Some(UsbEvent::Out(1)));
        assert_eq!(q.pop(), Some(UsbEvent::In(1)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn queue_refuses_when_full() {
        let q: EventQueue<2> = EventQueue::new();
        q.push(UsbEvent::Suspend).unwrap();
        q.push(UsbEvent::Resume).unwrap();
        assert!(q.is_full());
        assert_eq!(q.push(UsbEvent::In(0)), Err(UsbEvent::In(0)));
        // Wraps around cleanly.
        q.pop();
        q.push(UsbEvent::In(0)).unwrap();
        assert_eq!(q.pop(), Some(UsbEvent::Resume));
        assert_eq!(q.pop(), Some(UsbEvent::In(0)));
    }

    #[test]
    fn reset_discards_older_events_only() {
        let q: EventQueue<2> = EventQueue::new();
        q.push(UsbEvent::Out(1)).unwrap();
        q.push(UsbEvent::Out(1)).unwrap();
        // Full, but a reset still gets through.
        q.push_reset();
        assert_eq!(q.pop(), Some(UsbEvent::Reset));
        assert_eq!(q.pop(), None);

        q.push_reset();
        q.push(UsbEvent::Setup([0; 8])).unwrap();
        assert_eq!(q.pop(), Some(UsbEvent::Reset));
        assert_eq!(q.pop(), Some(UsbEvent::Setup([0; 8])));
    }

    #[test]
    fn transactions_become_events_in_order() {
        let d = InterruptDispatcher::new();
        let q: EventQueue<8> = EventQueue::new();
        let mut sie = sie();
        let setup = [0x80, 0x06, 0, 1, 0, 0, 0x40, 0];
        sie.host_setup(setup);
        sie.arm_out(1, 8, crate::usb::DataPid::Data0);
        sie.host_out(1, &[1, 2, 3]);

        d.capture(&mut sie, &q);
        assert_eq!(q.pop(), Some(UsbEvent::Setup(setup)));
        assert_eq!(q.pop(), Some(UsbEvent::Out(1)));
        assert_eq!(q.pop(), None);
        assert_eq!(sie.aggregate_clears(), 1);
        assert!(!sie.interrupt_line());
    }

    #[test]
    fn reset_wins_over_stale_transactions() {
        let d = InterruptDispatcher::new();
        let q: EventQueue<8> = EventQueue::new();
        let mut sie = sie();
        sie.host_setup([0; 8]);
        d.capture(&mut sie, &q);
        sie.host_reset();
        d.capture(&mut sie, &q);
        assert_eq!(q.pop(), Some(UsbEvent::Reset));
        assert_eq!(q.pop(), None);
        assert_eq!(sie.pending(), Interrupts::empty());
    }

    #[test]
    fn bus_errors_are_counted_not_queued() {
        let d = InterruptDispatcher::new();
        let q: EventQueue<8> = EventQueue::new();
        let mut sie = sie();
        sie.inject_bus_errors(BusErrors::CRC16 | BusErrors::BIT_STUFF);
        d.capture(&mut sie, &q);
        sie.inject_bus_errors(BusErrors::CRC16);
        d.capture(&mut sie, &q);

        let counts = d.errors();
        assert_eq!(counts.crc16, 2);
        assert_eq!(counts.bit_stuff, 1);
        assert_eq!(counts.bus_errors(), 3);
        assert!(q.is_empty());
        assert_eq!(sie.aggregate_clears(), 2);
    }

    #[test]
    fn suspend_and_resume() {
        let d = InterruptDispatcher::new();
        let q: EventQueue<8> = EventQueue::new();
        let mut sie = sie();
        sie.host_suspend();
        d.capture(&mut sie, &q);
        sie.host_resume();
        d.capture(&mut sie, &q);
        assert_eq!(q.pop(), Some(UsbEvent::Suspend));
        assert_eq!(q.pop(), Some(UsbEvent::Resume));
    }

    #[test]
    fn full_queue_masks_sources_and_keeps_transactions() {
        let d = InterruptDispatcher::new();
        let q: EventQueue<1> = EventQueue::new();
        let mut sie = sie();
        sie.host_setup([1; 8]);
        sie.host_setup([2; 8]);

        d.capture(&mut sie, &q);
        assert_eq!(sie.queued_transactions(), 1);
        assert_eq!(sie.enabled(), THROTTLED);
        assert!(q.take_throttled());
        assert_eq!(d.errors().overruns, 1);
        assert!(matches!(q.pop(), Some(UsbEvent::Setup(_))));
    }
}
