//! Dirty-read bookkeeping.
//!
//! An invalidated line may still be read safely as long as nothing newer
//! has been heard from its owner: each node tracks, per owner, the highest
//! message id of content-bearing traffic (`last_put`) and the number of
//! invalidations seen since (`inv_counter`). A state-I line stamped with
//! an `owner_clock` above the owner's `last_put` is provably the latest
//! thing this node knows from that owner.

use dashmap::DashMap;

use crate::types::{MsgId, NodeId};

#[derive(Debug, Default)]
struct OwnerClock {
    last_put: i64,
    inv_counter: u64,
}

#[derive(Default)]
pub(crate) struct DirtyReadTracker {
    clocks: DashMap<NodeId, OwnerClock>,
}

impl DirtyReadTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record an inbound PUT/PUTX/MSG from `owner`. Returns the number of
    /// invalidations the message renders moot.
    pub(crate) fn record_put(&self, owner: NodeId, msg_id: MsgId) -> u64 {
        let mut clock = self.clocks.entry(owner).or_default();
        clock.last_put = clock.last_put.max(msg_id as i64);
        std::mem::take(&mut clock.inv_counter)
    }

    /// Record an inbound INV concerning a line of `owner`.
    pub(crate) fn record_inv(&self, owner: NodeId) {
        self.clocks.entry(owner).or_default().inv_counter += 1;
    }

    /// Whether a state-I line of `owner`, stamped at `line_clock`, may be
    /// served without a network fetch.
    pub(crate) fn may_serve_stale(&self, owner: NodeId, line_clock: i64) -> bool {
        let Some(clock) = self.clocks.get(&owner) else {
            return false;
        };
        clock.last_put >= 0 && line_clock > clock.last_put
    }

    /// Disable dirty reads from `node` for the duration of a master
    /// switch.
    pub(crate) fn suspend(&self, node: NodeId) {
        self.clocks.entry(node).or_default().last_put = -1;
    }

    /// Re-enable dirty reads from `node` after a master switch; lines
    /// stamped before the switch stay unservable until refreshed.
    pub(crate) fn resume(&self, node: NodeId) {
        self.clocks.entry(node).or_default().last_put = 1;
    }
}
