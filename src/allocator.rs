use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{LineId, MAX_RESERVED_ID};

/// Outcome of an id allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// `count` consecutive ids starting here are granted.
    Ready(LineId),
    /// The allocator has no ids available right now; the operation is
    /// retried when [`Cache::id_allocator_ready`](crate::Cache::id_allocator_ready)
    /// fires.
    Pending,
}

/// Source of fresh reference ids for put()/alloc().
pub trait IdAllocator: Send + Sync {
    fn allocate_ids(&self, count: usize) -> Allocation;
}

/// Process-local allocator handing out ids above the reserved range.
/// Suitable for single-node deployments and tests; clustered deployments
/// plug in a coordinated allocator.
pub struct SequentialIdAllocator {
    next: AtomicU64,
}

impl SequentialIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(MAX_RESERVED_ID + 1),
        }
    }
}

impl Default for SequentialIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator for SequentialIdAllocator {
    fn allocate_ids(&self, count: usize) -> Allocation {
        Allocation::Ready(self.next.fetch_add(count as u64, Ordering::Relaxed))
    }
}
