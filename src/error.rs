//! Error kinds surfaced by configuration paths.
//!
//! Packet drops (classify miss, full class queue) are not errors: they are
//! accounted in the statistics counters and the enqueue path stays silent,
//! matching the drop accounting of the host-facing contract.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QfqError {
    /// Requested weight exceeds `2^MAX_WSHIFT`.
    InvalidWeight(u32),
    /// Requested lmax is zero or exceeds `2^MTU_SHIFT`.
    InvalidLmax(u32),
    /// Admitting the weight change would push the weight sum past the cap.
    WsumExceeded { requested: u64, limit: u64 },
    /// A class with this classid already exists.
    ClassExists(u64),
    /// No class with this classid is known.
    NoSuchClass(u64),
    /// Delete attempted while filters are still bound to the class.
    ClassBusy(u64),
    /// The dispatcher has shut down and no longer accepts commands.
    Shutdown,
}

impl fmt::Display for QfqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QfqError::InvalidWeight(w) => write!(f, "invalid weight {w}"),
            QfqError::InvalidLmax(l) => write!(f, "invalid max packet length {l}"),
            QfqError::WsumExceeded { requested, limit } => {
                write!(f, "total weight out of range ({requested} > {limit})")
            }
            QfqError::ClassExists(id) => write!(f, "class {id:#x} already exists"),
            QfqError::NoSuchClass(id) => write!(f, "no such class {id:#x}"),
            QfqError::ClassBusy(id) => write!(f, "class {id:#x} has bound filters"),
            QfqError::Shutdown => write!(f, "scheduler is shut down"),
        }
    }
}

impl std::error::Error for QfqError {}
