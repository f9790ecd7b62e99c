//! Packet representation carried through the scheduler.

use crate::buffer_pool::{lease_copy, PacketBuf};
use crate::classify::FlowCache;
use std::sync::Arc;

/// A unit of work travelling from a producer through a class queue to the
/// transmit device.
///
/// `priority` plays the role of the classid hint carried by the host stack:
/// the classifier first tries to resolve it directly against the class index
/// before consulting the filter chain. Packets originating from a long-lived
/// connection may carry a [`FlowCache`] so repeated classification is a
/// single pointer load.
#[derive(Debug)]
pub struct Packet {
    /// Classid hint used by the direct-match classify step.
    pub priority: u64,
    /// Per-connection classification cache, if the producer has one.
    pub flow: Option<Arc<FlowCache>>,
    buf: PacketBuf,
}

impl Packet {
    /// Build a packet by copying `payload` into a pooled buffer.
    pub fn new(priority: u64, payload: &[u8]) -> Packet {
        Packet {
            priority,
            flow: None,
            buf: lease_copy(payload),
        }
    }

    /// Build a packet from an already-filled pooled buffer.
    pub fn from_buf(priority: u64, buf: PacketBuf) -> Packet {
        Packet {
            priority,
            flow: None,
            buf,
        }
    }

    /// Attach a per-connection flow cache.
    pub fn with_flow(mut self, flow: Arc<FlowCache>) -> Packet {
        self.flow = Some(flow);
        self
    }

    pub fn payload(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Length charged to the owning class, in bytes.
    pub fn len(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
