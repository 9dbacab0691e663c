//! The per-line record. The record's mutex is the sole ordering authority
//! for that line's state machine: every observation and mutation of line
//! state happens under it.

use std::collections::HashSet;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::listener::CacheListener;
use crate::types::{LineId, NodeId, Version, NO_NODE};

/// Coherence state of a line, totally ordered I < S < O < E.
///
/// A line is *owned* (locally authoritative) at `Owned` and above;
/// otherwise it is a non-authoritative replica, possibly invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LineState {
    Invalid,
    Shared,
    Owned,
    Exclusive,
}

impl LineState {
    pub fn is_owned(self) -> bool {
        self >= LineState::Owned
    }
}

pub(crate) struct Line {
    inner: Mutex<LineInner>,
}

impl Line {
    pub(crate) fn new(id: LineId) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LineInner::new(id)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, LineInner> {
        self.inner.lock()
    }
}

pub(crate) struct LineInner {
    pub id: LineId,
    pub state: LineState,
    /// Target of an in-progress transition. Advances monotonically while
    /// set; cleared on completion and on invalidation.
    pub next_state: Option<LineState>,
    /// Believed owner; `NO_NODE` when unknown. For state S the belief may
    /// be stale. For a line taken over from a previous owner in state O,
    /// this retains the previous owner for INV routing.
    pub owner: NodeId,
    /// Nodes believed to hold replicas. `Some` iff the line is owned.
    pub sharers: Option<HashSet<NodeId>>,
    pub version: Version,
    /// Id of the message that last established this line's content from
    /// its owner; negative when no message-established content exists.
    pub owner_clock: i64,
    pub data: Option<Box<[u8]>>,
    /// Reentrant lock count held by transactions.
    pub locks: u16,
    /// Local writes not yet acknowledged by the slave.
    pub modified: bool,
    /// The slave believes this line is owned by the local master.
    pub slave: bool,
    pub deleted: bool,
    /// Record removed from the tables; eligible for recycling.
    pub destroyed: bool,
    pub listener: Option<Arc<dyn CacheListener>>,
    // Drain-loop re-entrance guard; see Cache::line_changed.
    pub draining: bool,
    pub redrain: bool,
}

impl LineInner {
    fn new(id: LineId) -> Self {
        Self {
            id,
            state: LineState::Invalid,
            next_state: None,
            owner: NO_NODE,
            sharers: None,
            version: 0,
            owner_clock: -1,
            data: None,
            locks: 0,
            modified: false,
            slave: false,
            deleted: false,
            destroyed: false,
            listener: None,
            draining: false,
            redrain: false,
        }
    }

    /// Reinitialize a recycled record for a new id. The caller has already
    /// detached data and sharers.
    pub(crate) fn reset(&mut self, id: LineId) {
        *self = Self::new(id);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locks > 0
    }

    /// Weighted size for the shared-cache capacity bound.
    pub(crate) fn weight(&self) -> u64 {
        1 + self.data.as_ref().map_or(0, |d| d.len() as u64)
    }

    /// Whether the line is in the sharer-invalidation phase of an
    /// ownership upgrade. Fetches toward O/E (state < O) do not count:
    /// they must still admit the PUT/PUTX that completes them.
    pub(crate) fn mid_upgrade_to_exclusive(&self) -> bool {
        self.state >= LineState::Owned && self.next_state == Some(LineState::Exclusive)
    }

    /// Change coherence state, maintaining the sharers invariant. Table
    /// migration between `owned` and `shared` is the caller's concern.
    pub(crate) fn set_state(&mut self, new: LineState, empty_sharers: HashSet<NodeId>) {
        if self.state == new {
            return;
        }
        trace!("line {}: {:?} -> {:?}", self.id, self.state, new);
        if new.is_owned() {
            if self.sharers.is_none() {
                self.sharers = Some(empty_sharers);
            }
        } else {
            self.sharers = None;
        }
        self.state = new;
    }

    /// Raise `next_state` toward `target`; never lowers an existing one.
    pub(crate) fn raise_next_state(&mut self, target: LineState) {
        match self.next_state {
            Some(current) if current >= target => {}
            _ => self.next_state = Some(target),
        }
    }

    pub(crate) fn sharer_count(&self) -> usize {
        self.sharers.as_ref().map_or(0, |s| s.len())
    }

    pub(crate) fn has_sharer(&self, node: NodeId) -> bool {
        self.sharers.as_ref().is_some_and(|s| s.contains(&node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_matches_protocol() {
        assert!(LineState::Invalid < LineState::Shared);
        assert!(LineState::Shared < LineState::Owned);
        assert!(LineState::Owned < LineState::Exclusive);
        assert!(LineState::Owned.is_owned());
        assert!(!LineState::Shared.is_owned());
    }

    #[test]
    fn set_state_maintains_sharers_invariant() {
        let mut inner = LineInner::new(9);
        assert!(inner.sharers.is_none());
        inner.set_state(LineState::Exclusive, HashSet::new());
        assert!(inner.sharers.is_some());
        inner.set_state(LineState::Invalid, HashSet::new());
        assert!(inner.sharers.is_none());
    }

    #[test]
    fn next_state_only_rises() {
        let mut inner = LineInner::new(9);
        inner.raise_next_state(LineState::Exclusive);
        inner.raise_next_state(LineState::Shared);
        assert_eq!(inner.next_state, Some(LineState::Exclusive));
    }
}
