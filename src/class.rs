//! Shared per-class state.
//!
//! A class splits in two. The half defined here is reachable from producers
//! and configuration paths through an `Arc`: the inner FIFO with its own
//! lock, traffic counters, the filter reference count, and the mirrors of
//! weight/lmax that the enqueue path reads. The scheduling half (S, F,
//! group assignment, authoritative `inv_w`) lives inside the dispatcher and
//! is never visible outside it.

use crate::packet::Packet;
use crate::stats::RateEstimator;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Traffic counters updated on the enqueue path.
#[derive(Debug, Default)]
pub struct ClassCounters {
    /// Bytes accepted into the inner queue.
    pub bytes: AtomicU64,
    /// Packets accepted into the inner queue.
    pub packets: AtomicU64,
    /// Packets refused because the inner queue was full.
    pub drops: AtomicU64,
}

/// Result of pushing a packet into a class's inner queue.
pub(crate) struct PushOutcome {
    /// False if the queue was full and the packet was dropped.
    pub queued: bool,
    /// Queue length after the operation.
    pub qlen: usize,
}

/// Producer- and configuration-visible half of a flow class.
pub struct ClassShared {
    pub classid: u64,
    /// Mirror of the configured weight; 0 while the class is disabled. The
    /// enqueue path reads this to decide whether to post an activation, the
    /// dispatcher's own copy (`inv_w`) stays authoritative for timestamps.
    weight: AtomicU32,
    lmax: AtomicU32,
    /// Set once the class has been removed from the index; stale flow-cache
    /// hits check it so deleted classes stop attracting traffic.
    dead: AtomicBool,
    /// Number of filters currently bound to this class; delete refuses
    /// while non-zero.
    filter_cnt: AtomicU32,
    pub counters: ClassCounters,
    pub(crate) rate: Mutex<RateEstimator>,
    queue: Mutex<VecDeque<Packet>>,
    queue_limit: usize,
}

impl ClassShared {
    pub(crate) fn new(classid: u64, weight: u32, lmax: u32, queue_limit: usize) -> Self {
        Self {
            classid,
            weight: AtomicU32::new(weight),
            lmax: AtomicU32::new(lmax),
            dead: AtomicBool::new(false),
            filter_cnt: AtomicU32::new(0),
            counters: ClassCounters::default(),
            rate: Mutex::new(RateEstimator::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_limit,
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn lmax(&self) -> u32 {
        self.lmax.load(Ordering::Relaxed)
    }

    pub(crate) fn set_params(&self, weight: u32, lmax: u32) {
        self.weight.store(weight, Ordering::Relaxed);
        self.lmax.store(lmax, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.weight.load(Ordering::Relaxed) == 0
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }

    pub fn filter_cnt(&self) -> u32 {
        self.filter_cnt.load(Ordering::Relaxed)
    }

    pub(crate) fn bind_filter(&self) {
        self.filter_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unbind_filter(&self) {
        self.filter_cnt.fetch_sub(1, Ordering::Relaxed);
    }

    /// Push under the class lock; counts the drop if the queue is full.
    pub(crate) fn push(&self, packet: Packet) -> PushOutcome {
        let len = packet.len() as u64;
        let mut queue = self.queue.lock();
        if queue.len() >= self.queue_limit {
            drop(queue);
            self.counters.drops.fetch_add(1, Ordering::Relaxed);
            return PushOutcome {
                queued: false,
                qlen: self.queue_limit,
            };
        }
        queue.push_back(packet);
        let qlen = queue.len();
        drop(queue);
        self.counters.bytes.fetch_add(len, Ordering::Relaxed);
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        PushOutcome { queued: true, qlen }
    }

    /// Pop the head packet and report the next head length and remaining
    /// queue length, all under one acquisition of the class lock. Dispatcher
    /// only.
    pub(crate) fn pop_head(&self) -> (Option<Packet>, u32, usize) {
        let mut queue = self.queue.lock();
        let packet = queue.pop_front();
        let next_len = queue.front().map(|p| p.len()).unwrap_or(0);
        let qlen = queue.len();
        (packet, next_len, qlen)
    }

    /// Length of the head packet, 0 if the queue is empty.
    pub(crate) fn peek_len(&self) -> u32 {
        self.queue.lock().front().map(|p| p.len()).unwrap_or(0)
    }

    pub fn qlen(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop every queued packet, returning how many were discarded.
    pub(crate) fn purge(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }
}

impl std::fmt::Debug for ClassShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassShared")
            .field("classid", &self.classid)
            .field("weight", &self.weight())
            .field("lmax", &self.lmax())
            .field("dead", &self.is_dead())
            .finish()
    }
}
