//! Group / slot store.
//!
//! Each group bins classes whose `lmax / weight` falls in the same power-of-
//! two range. Within a group, 32 slots form a circular buffer indexed from
//! `front`; slot k holds the classes whose rounded start time is k slot
//! widths past the group's S. `full_slots` mirrors slot occupancy so the
//! earliest backlogged slot is one bit-scan away. All operations are O(1)
//! except removal of a specific class, which walks one (short) slot list.

use crate::fixed::round_down;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Slots per group. The group-index calculation guarantees the span of
/// occupied slots never reaches this bound.
pub const NUM_SLOTS: usize = 32;

static OVERFLOW_EVENTS: AtomicU64 = AtomicU64::new(0);

/// One scheduling group: quantized timestamps plus the circular slot store.
pub struct Group {
    pub index: usize,
    pub slot_shift: u32,
    /// Group start/finish, always quantized to `slot_shift`.
    pub s: u64,
    pub f: u64,
    front: usize,
    full_slots: u64,
    slots: [VecDeque<u64>; NUM_SLOTS],
}

impl Group {
    pub fn new(index: usize, slot_shift: u32) -> Self {
        Self {
            index,
            slot_shift,
            s: 0,
            f: 0,
            front: 0,
            full_slots: 0,
            slots: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    #[inline]
    pub fn full_slots(&self) -> u64 {
        self.full_slots
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.full_slots == 0
    }

    #[inline]
    fn physical(&self, logical: u64) -> usize {
        (self.front + logical as usize) % NUM_SLOTS
    }

    /// Round `ts` down to this group's slot resolution.
    #[inline]
    pub fn round(&self, ts: u64) -> u64 {
        round_down(ts, self.slot_shift)
    }

    /// Insert a class at its rounded start time.
    ///
    /// The slot offset must be below [`NUM_SLOTS`]; the index calculation
    /// guarantees it for admissible weight/lmax pairs, so a violation is a
    /// broken invariant. Debug builds fail loudly, release builds clamp to
    /// the last slot and emit a rate-limited diagnostic.
    pub fn insert(&mut self, classid: u64, rounded_s: u64) {
        let mut slot = rounded_s.wrapping_sub(self.s) >> self.slot_shift;
        if slot >= NUM_SLOTS as u64 {
            debug_assert!(
                false,
                "slot {} out of range (grp {} S={:#x} roundedS={:#x})",
                slot, self.index, self.s, rounded_s
            );
            let n = OVERFLOW_EVENTS.fetch_add(1, Ordering::Relaxed);
            if n % 1000 == 0 {
                eprintln!(
                    "qfq: slot {} out of range, clamped (grp {} S={:#x} roundedS={:#x} full={:#x} front={})",
                    slot, self.index, self.s, rounded_s, self.full_slots, self.front
                );
            }
            slot = NUM_SLOTS as u64 - 1;
        }
        let i = self.physical(slot);
        self.slots[i].push_front(classid);
        self.full_slots |= 1 << slot;
    }

    /// Remove a specific class given its rounded start time.
    pub fn remove(&mut self, classid: u64, rounded_s: u64) {
        let offset = rounded_s.wrapping_sub(self.s) >> self.slot_shift;
        let i = self.physical(offset.min(NUM_SLOTS as u64 - 1));
        if let Some(pos) = self.slots[i].iter().position(|&c| c == classid) {
            self.slots[i].remove(pos);
        }
        if self.slots[i].is_empty() {
            self.full_slots &= !(1 << offset.min(NUM_SLOTS as u64 - 1));
        }
    }

    /// First class in the front slot.
    pub fn head(&self) -> Option<u64> {
        self.slots[self.front].front().copied()
    }

    /// Unlink the head of the front slot, clearing logical bit 0 when the
    /// slot empties.
    pub fn front_remove(&mut self) -> Option<u64> {
        let cl = self.slots[self.front].pop_front();
        if self.slots[self.front].is_empty() {
            self.full_slots &= !1;
        }
        cl
    }

    /// Whether the front slot currently holds any class.
    pub fn front_is_empty(&self) -> bool {
        self.slots[self.front].is_empty()
    }

    /// Advance the logical origin to the lowest non-empty slot and return
    /// its head class.
    pub fn scan(&mut self) -> Option<u64> {
        if self.full_slots == 0 {
            return None;
        }
        let i = self.full_slots.trailing_zeros() as usize;
        if i > 0 {
            self.front = (self.front + i) % NUM_SLOTS;
            self.full_slots >>= i;
        }
        self.head()
    }

    /// Make room for a start time earlier than the current group S by
    /// moving the origin back. Occupied slots keep their physical position;
    /// only the mask and `front` shift.
    pub fn rotate(&mut self, rounded_s: u64) {
        let i = self.s.wrapping_sub(rounded_s) >> self.slot_shift;
        debug_assert!(i < NUM_SLOTS as u64, "rotate distance {i} out of range");
        let i = i.min(NUM_SLOTS as u64 - 1) as usize;
        self.full_slots <<= i;
        self.front = (self.front + NUM_SLOTS - i) % NUM_SLOTS;
    }

    /// Iterate every slotted classid, front slot first. Used by reset and
    /// the invariant checks.
    pub fn slotted(&self) -> impl Iterator<Item = u64> + '_ {
        (0..NUM_SLOTS).flat_map(move |k| self.slots[(self.front + k) % NUM_SLOTS].iter().copied())
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("index", &self.index)
            .field("S", &self.s)
            .field("F", &self.f)
            .field("front", &self.front)
            .field("full_slots", &format_args!("{:#x}", self.full_slots))
            .finish()
    }
}
