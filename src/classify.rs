//! Packet classification.
//!
//! Three tiers, cheapest first: a per-connection [`FlowCache`] carried by
//! the packet short-circuits repeated traffic from one endpoint; a miss
//! falls back to a direct classid match on the packet priority; and only
//! then does the ordered filter chain run. Filters that drop short-circuit
//! the chain.

use crate::class::ClassShared;
use crate::error::QfqError;
use crate::packet::Packet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-connection classification cache held by the producing endpoint.
///
/// Caches `(scheduler id, class)` so the scheduler can tell its own cache
/// entries from those of a previous scheduler bound to the same endpoint.
/// Deleted classes are detected through their dead flag rather than by
/// invalidating every cache that may point at them.
pub struct FlowCache {
    cached: Mutex<Option<(u64, Arc<ClassShared>)>>,
}

impl FlowCache {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    fn lookup(&self, sched_id: u64) -> Option<Arc<ClassShared>> {
        let guard = self.cached.lock();
        match &*guard {
            Some((id, class)) if *id == sched_id && !class.is_dead() => Some(class.clone()),
            _ => None,
        }
    }

    fn store(&self, sched_id: u64, class: Arc<ClassShared>) {
        *self.cached.lock() = Some((sched_id, class));
    }
}

impl Default for FlowCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FlowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.cached.lock();
        f.debug_struct("FlowCache")
            .field("cached", &cached.as_ref().map(|(id, c)| (*id, c.classid)))
            .finish()
    }
}

/// Outcome of one filter's look at a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Route the packet to this classid.
    Class(u64),
    /// Shoot the packet down; later filters do not run.
    Drop,
    /// No opinion; try the next filter.
    Pass,
}

/// One element of the ordered filter chain.
pub trait PacketFilter: Send + Sync {
    fn classify(&self, packet: &Packet) -> FilterVerdict;
}

/// Convenience: closures are filters.
impl<F> PacketFilter for F
where
    F: Fn(&Packet) -> FilterVerdict + Send + Sync,
{
    fn classify(&self, packet: &Packet) -> FilterVerdict {
        self(packet)
    }
}

/// Handle returned by `attach`, used to detach the filter again.
pub type FilterId = u64;

struct FilterEntry {
    id: FilterId,
    filter: Box<dyn PacketFilter>,
    /// Class whose `filter_cnt` this filter pins, if any.
    bound: Option<Arc<ClassShared>>,
}

/// Class index plus filter chain; the lookup side of the scheduler.
pub(crate) struct Classifier {
    sched_id: u64,
    index: RwLock<HashMap<u64, Arc<ClassShared>>>,
    chain: RwLock<Vec<FilterEntry>>,
    next_filter_id: Mutex<FilterId>,
}

impl Classifier {
    pub(crate) fn new(sched_id: u64) -> Self {
        Self {
            sched_id,
            index: RwLock::new(HashMap::new()),
            chain: RwLock::new(Vec::new()),
            next_filter_id: Mutex::new(0),
        }
    }

    pub(crate) fn insert_class(&self, class: Arc<ClassShared>) -> Result<(), QfqError> {
        let mut index = self.index.write();
        if index.contains_key(&class.classid) {
            return Err(QfqError::ClassExists(class.classid));
        }
        index.insert(class.classid, class);
        Ok(())
    }

    pub(crate) fn find_class(&self, classid: u64) -> Option<Arc<ClassShared>> {
        self.index.read().get(&classid).cloned()
    }

    pub(crate) fn remove_class(&self, classid: u64) -> Option<Arc<ClassShared>> {
        let removed = self.index.write().remove(&classid);
        if let Some(class) = &removed {
            class.mark_dead();
        }
        removed
    }

    pub(crate) fn classes(&self) -> Vec<Arc<ClassShared>> {
        self.index.read().values().cloned().collect()
    }

    /// Append a filter to the chain, optionally binding it to a class so
    /// the class cannot be deleted while the filter lives.
    pub(crate) fn attach_filter(
        &self,
        filter: Box<dyn PacketFilter>,
        bind_to: Option<u64>,
    ) -> Result<FilterId, QfqError> {
        let bound = match bind_to {
            Some(classid) => {
                let class = self
                    .find_class(classid)
                    .ok_or(QfqError::NoSuchClass(classid))?;
                class.bind_filter();
                Some(class)
            }
            None => None,
        };
        let mut next = self.next_filter_id.lock();
        let id = *next;
        *next += 1;
        self.chain.write().push(FilterEntry { id, filter, bound });
        Ok(id)
    }

    pub(crate) fn detach_filter(&self, id: FilterId) {
        let mut chain = self.chain.write();
        if let Some(pos) = chain.iter().position(|e| e.id == id) {
            let entry = chain.remove(pos);
            if let Some(class) = entry.bound {
                class.unbind_filter();
            }
        }
    }

    /// Map a packet to a class, or None to drop it.
    pub(crate) fn classify(&self, packet: &Packet) -> Option<Arc<ClassShared>> {
        if let Some(flow) = &packet.flow {
            if let Some(class) = flow.lookup(self.sched_id) {
                return Some(class);
            }
        }

        if let Some(class) = self.find_class(packet.priority) {
            self.remember(packet, &class);
            return Some(class);
        }

        let chain = self.chain.read();
        for entry in chain.iter() {
            match entry.filter.classify(packet) {
                FilterVerdict::Class(classid) => {
                    let class = self.find_class(classid)?;
                    self.remember(packet, &class);
                    return Some(class);
                }
                FilterVerdict::Drop => return None,
                FilterVerdict::Pass => continue,
            }
        }
        None
    }

    fn remember(&self, packet: &Packet, class: &Arc<ClassShared>) {
        if let Some(flow) = &packet.flow {
            flow.store(self.sched_id, class.clone());
        }
    }
}
