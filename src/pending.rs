//! Deferred work, keyed by line id.
//!
//! Ops wait in FIFO order for the line to change; messages wait in an
//! insertion-ordered set (deduplicated by sender and message id) for the
//! line to become unlocked and clean. Both queues reference lines by id
//! only — the line table is re-consulted at every drain.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::message::Message;
use crate::ops::Op;
use crate::types::{LineId, NodeId};

#[derive(Default)]
pub(crate) struct PendingQueues {
    ops: DashMap<LineId, VecDeque<Op>>,
    messages: DashMap<LineId, VecDeque<Message>>,
}

impl PendingQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue_op(&self, op: Op) {
        self.ops.entry(op.line).or_default().push_back(op);
    }

    pub(crate) fn take_ops(&self, id: LineId) -> VecDeque<Op> {
        self.ops.remove(&id).map(|(_, q)| q).unwrap_or_default()
    }

    pub(crate) fn put_back_ops(&self, id: LineId, ops: VecDeque<Op>) {
        if ops.is_empty() {
            return;
        }
        let mut entry = self.ops.entry(id).or_default();
        // Ops enqueued while this drain ran (same line lock, deeper in the
        // call) stay behind the survivors to preserve FIFO order.
        let newer = std::mem::replace(&mut *entry, ops);
        entry.extend(newer);
    }

    pub(crate) fn has_ops(&self, id: LineId) -> bool {
        self.ops.get(&id).is_some_and(|q| !q.is_empty())
    }

    /// Deferred messages form a set: redelivery of a (sender, id) pair
    /// already waiting is dropped.
    pub(crate) fn enqueue_message(&self, msg: Message) {
        let Some(line) = msg.body.line() else {
            return;
        };
        let mut entry = self.messages.entry(line).or_default();
        if entry.iter().any(|m| m.from == msg.from && m.id == msg.id) {
            return;
        }
        entry.push_back(msg);
    }

    pub(crate) fn take_messages(&self, id: LineId) -> VecDeque<Message> {
        self.messages.remove(&id).map(|(_, q)| q).unwrap_or_default()
    }

    pub(crate) fn has_messages(&self, id: LineId) -> bool {
        self.messages.get(&id).is_some_and(|q| !q.is_empty())
    }

    pub(crate) fn drop_messages(&self, id: LineId) {
        self.messages.remove(&id);
    }

    /// Forget deferred messages from a departed node, everywhere.
    pub(crate) fn drop_messages_from(&self, node: NodeId) {
        for mut entry in self.messages.iter_mut() {
            entry.value_mut().retain(|m| m.from != node);
        }
        self.messages.retain(|_, q| !q.is_empty());
    }
}
