// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-producer single-consumer frame ring.
//!
//! Eight 20 ms frames sit between each stream's decoder and the mixer.
//! Overflow overwrites: when the mixer falls behind, the oldest unplayed
//! frame is silently replaced, never reordered. Each slot moves through
//! EMPTY → BUSY → READY (producer) and READY → BUSY → EMPTY (consumer);
//! the BUSY claim is what makes the overwrite race safe.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use super::SAMPLES_PER_FRAME;

/// Slots per stream. Frames are normally mixed within a tick or
/// two of arriving.
pub const RING_SLOTS: usize = 8;

/// One decoded 20 ms block: 480 signed 16-bit samples at 48 kHz mono.
pub type FrameSamples = [i16; SAMPLES_PER_FRAME];

const SLOT_EMPTY: u8 = 0;
const SLOT_READY: u8 = 1;
const SLOT_BUSY: u8 = 2;

struct Slot {
    state: AtomicU8,
    samples: UnsafeCell<FrameSamples>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: AtomicU8::new(SLOT_EMPTY),
            samples: UnsafeCell::new([0; SAMPLES_PER_FRAME]),
        }
    }
}

pub struct FrameRing {
    slots: [Slot; RING_SLOTS],
    write: AtomicUsize,
    read: AtomicUsize,
}

// SAFETY: slot payloads are only touched while the owning side holds the
// slot in the BUSY state, and the write/read indices are each mutated by
// exactly one thread.
unsafe impl Sync for FrameRing {}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub fn new() -> Self {
        FrameRing {
            slots: std::array::from_fn(|_| Slot::new()),
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        }
    }

    /// Producer side: stores one frame in the current write slot, marks it
    /// ready, and advances. A slot the consumer has not drained yet is
    /// overwritten. If the consumer is mid-copy of this exact slot the
    /// claim spins for the microseconds that copy takes.
    pub fn publish(&self, samples: &FrameSamples) {
        let index = self.write.load(Ordering::Relaxed);
        let slot = &self.slots[index];
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if state == SLOT_BUSY {
                std::hint::spin_loop();
                continue;
            }
            if slot
                .state
                .compare_exchange(state, SLOT_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        // SAFETY: we hold the BUSY claim, so nothing else reads or writes
        // this slot's payload.
        unsafe {
            *slot.samples.get() = *samples;
        }
        slot.state.store(SLOT_READY, Ordering::Release);
        self.write.store((index + 1) % RING_SLOTS, Ordering::Release);
    }

    /// Consumer side: copies the current read slot out if it is ready,
    /// clears its flag, and advances. Returns false (leaving `out`
    /// untouched) when there is nothing to play this tick.
    pub fn consume(&self, out: &mut FrameSamples) -> bool {
        let index = self.read.load(Ordering::Relaxed);
        let slot = &self.slots[index];
        if slot
            .state
            .compare_exchange(SLOT_READY, SLOT_BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // SAFETY: we hold the BUSY claim, so the producer cannot overwrite
        // the payload while we copy it.
        unsafe {
            *out = *slot.samples.get();
        }
        slot.state.store(SLOT_EMPTY, Ordering::Release);
        self.read.store((index + 1) % RING_SLOTS, Ordering::Release);
        true
    }

    pub fn write_index(&self) -> usize {
        self.write.load(Ordering::Acquire)
    }

    pub fn read_index(&self) -> usize {
        self.read.load(Ordering::Acquire)
    }

    /// Whether the slot under the read index currently holds an unplayed
    /// frame.
    pub fn has_ready_frame(&self) -> bool {
        self.slots[self.read_index()].state.load(Ordering::Acquire) == SLOT_READY
    }
}
