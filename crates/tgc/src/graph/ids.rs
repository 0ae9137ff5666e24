//! Stable identifiers resolved through the owning graph.
//!
//! Producer/consumer and predecessor/successor links are stored as plain ids
//! rather than references, so the graph remains the sole owner of its nodes
//! and edge surgery never has to fight ownership cycles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Creation-order counter shared by tensors and operators, so ids double as
/// process-unique guids in dumps.
static GUID_COUNTER: AtomicU64 = AtomicU64::new(0);
static FUID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_guid() -> u64 {
    GUID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Identifier of a tensor node; unique per creation across the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    pub(crate) fn fresh() -> Self {
        TensorId(next_guid())
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an operator node; unique per creation across the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl OpId {
    pub(crate) fn fresh() -> Self {
        OpId(next_guid())
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Functional identifier of a tensor.
///
/// Assigned at tensor creation and stable across shape updates, so planning
/// tables keyed by fuid survive in-place rewrites. Two live tensors in one
/// graph never share an fuid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fuid(u64);

impl Fuid {
    pub(crate) fn fresh() -> Self {
        Fuid(FUID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
