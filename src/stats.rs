//! Statistics export.
//!
//! Counters are updated with relaxed atomics on the hot paths and gathered
//! into serde-serializable snapshots on demand, so an operator thread can
//! poll and ship them without touching any scheduler lock.

use crate::class::ClassShared;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Exponentially weighted byte-rate estimator.
///
/// Stands in for the host's rate estimator: it is fed cumulative byte
/// counts at snapshot time and keeps an EWMA over the sampling intervals
/// (weight 1/8 per sample, the customary estimator gain).
#[derive(Debug)]
pub struct RateEstimator {
    last_bytes: u64,
    last_ns: u64,
    ewma_bps: u64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_ns: 0,
            ewma_bps: 0,
        }
    }

    /// Feed a cumulative byte count observed at `now_ns`; returns the
    /// updated estimate in bytes per second.
    pub fn sample(&mut self, total_bytes: u64, now_ns: u64) -> u64 {
        let dt = now_ns.saturating_sub(self.last_ns);
        if self.last_ns == 0 || dt == 0 {
            self.last_ns = now_ns;
            self.last_bytes = total_bytes;
            return self.ewma_bps;
        }
        let delta = total_bytes.saturating_sub(self.last_bytes);
        let inst = (delta as u128 * 1_000_000_000u128 / dt as u128) as u64;
        self.ewma_bps = self.ewma_bps - (self.ewma_bps >> 3) + (inst >> 3);
        self.last_bytes = total_bytes;
        self.last_ns = now_ns;
        self.ewma_bps
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler-wide counters shared between the dispatcher and observers.
#[derive(Debug, Default)]
pub struct SchedCounters {
    /// Packets dropped because no class matched.
    pub classify_drops: AtomicU64,
    /// Packets dropped because a class queue was full.
    pub enqueue_drops: AtomicU64,
    /// Mirror of the dispatcher's active weight sum.
    pub wsum_active: AtomicU64,
    /// Mirror of the number of classes currently holding a slot.
    pub active_classes: AtomicU64,
    /// Packets handed to the transmit device.
    pub tx_packets: AtomicU64,
    /// Bytes handed to the transmit device.
    pub tx_bytes: AtomicU64,
}

/// Point-in-time view of one class.
#[derive(Debug, Clone, Serialize)]
pub struct ClassSnapshot {
    pub classid: u64,
    pub weight: u32,
    pub lmax: u32,
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub qlen: usize,
    pub rate_bps: u64,
}

impl ClassSnapshot {
    pub(crate) fn capture(class: &ClassShared, now_ns: u64) -> Self {
        let bytes = class.counters.bytes.load(Ordering::Relaxed);
        let rate_bps = class.rate.lock().sample(bytes, now_ns);
        Self {
            classid: class.classid,
            weight: class.weight(),
            lmax: class.lmax(),
            bytes,
            packets: class.counters.packets.load(Ordering::Relaxed),
            drops: class.counters.drops.load(Ordering::Relaxed),
            qlen: class.qlen(),
            rate_bps,
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedSnapshot {
    pub wsum: u64,
    pub wsum_active: u64,
    pub active_classes: u64,
    pub classify_drops: u64,
    pub enqueue_drops: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub classes: Vec<ClassSnapshot>,
}
