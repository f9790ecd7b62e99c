//! Per-producer activation queues.
//!
//! Producers never touch scheduler state. When an enqueue makes a class go
//! idle -> backlogged, the producer records `{class, head length}` in its
//! own executor's queue and raises that executor's bit in the shared work
//! bitmap; the dispatcher test-and-clears bits and performs the actual
//! activation. A second activation for an already-active class is harmless:
//! the producer only posts on the 0 -> 1 queue transition, and the length
//! gate on that transition makes reposting idempotent.

use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Record of a class that needs activating, posted by a producer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Activation {
    pub classid: u64,
    /// Length of the packet that made the class backlogged.
    pub pkt_len: u32,
}

/// The set of per-executor queues plus the bitmap summarizing which
/// executors have pending work.
pub(crate) struct ActivationQueues {
    queues: Vec<Mutex<Vec<Activation>>>,
    work_bitmap: AtomicU64,
}

impl ActivationQueues {
    pub(crate) fn new(executors: usize) -> Self {
        assert!(
            (1..=64).contains(&executors),
            "executor count {executors} must fit the work bitmap"
        );
        Self {
            queues: (0..executors).map(|_| Mutex::new(Vec::new())).collect(),
            work_bitmap: AtomicU64::new(0),
        }
    }

    pub(crate) fn executors(&self) -> usize {
        self.queues.len()
    }

    /// Producer side: append a record and raise this executor's bit.
    pub(crate) fn post(&self, executor: usize, classid: u64, pkt_len: u32) {
        self.queues[executor].lock().push(Activation { classid, pkt_len });
        // The record must be visible before the dispatcher can observe the
        // bit.
        fence(Ordering::SeqCst);
        self.work_bitmap.fetch_or(1 << executor, Ordering::Release);
    }

    /// Cheap unlocked peek; a stale read only delays work to the next loop
    /// iteration.
    pub(crate) fn has_work(&self) -> bool {
        self.work_bitmap.load(Ordering::Relaxed) != 0
    }

    /// Dispatcher side: clear each raised bit, then drain that executor's
    /// queue in posting order.
    pub(crate) fn drain(&self, mut apply: impl FnMut(Activation)) {
        if !self.has_work() {
            return;
        }
        for executor in 0..self.queues.len() {
            let bit = 1u64 << executor;
            if self.work_bitmap.fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
                continue;
            }
            let batch = std::mem::take(&mut *self.queues[executor].lock());
            for record in batch {
                apply(record);
            }
        }
    }

    /// Discard every outstanding record. Used by reset and shutdown.
    pub(crate) fn clear(&self) {
        for queue in &self.queues {
            queue.lock().clear();
        }
        self.work_bitmap.store(0, Ordering::Release);
    }
}
