//! Local-operation half of the state machine: preconditions, holding
//! rules, and the transitions an op drives to satisfy them.

use log::{debug, warn};

use crate::error::CacheError;
use crate::line::{LineInner, LineState};
use crate::message::{Destination, MessageBody};
use crate::monitor::DrainReason;
use crate::ops::{Op, OpKind, OpOutcome, OpResult};
use crate::transaction::RollbackRecord;
use crate::types::{is_reserved, NodeId, Version, NO_NODE, SERVER};

use super::{Cache, Effects};

impl Cache {
    /// Evaluate an op against the line. Returns `Pending` when the line
    /// must change before the op can complete; pending ops are re-run
    /// through here on every such change.
    pub(crate) fn try_op(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        eff: &mut Effects,
    ) -> Result<OpOutcome, CacheError> {
        if inner.destroyed {
            return Err(CacheError::RefNotFound { id: inner.id });
        }
        if self.op_held(inner, op) {
            return Ok(OpOutcome::Pending);
        }
        match op.kind {
            OpKind::Get => self.op_get(inner, op, eff),
            OpKind::GetShared => self.op_get_locked(inner, op, eff, false),
            OpKind::GetExclusive => self.op_get_locked(inner, op, eff, true),
            OpKind::Set => self.op_set(inner, op, eff),
            OpKind::Del => self.op_del(inner, op, eff),
            OpKind::Push => self.op_push(inner, op, eff),
            OpKind::PushExclusive => self.op_push_exclusive(inner, op, eff),
            OpKind::Send => self.op_send(inner, op, eff),
            OpKind::Listen => {
                inner.listener = op.listener.take();
                Ok(OpOutcome::Ready(OpResult::Done))
            }
            OpKind::Put | OpKind::Alloc => {
                debug!("allocation op routed to a line; ignoring");
                Ok(OpOutcome::Ready(OpResult::Done))
            }
        }
    }

    /// Back-pressure: a locking op yields to deferred messages unless the
    /// line is already locked or upgrading to exclusive; a push waits for
    /// the slave to acknowledge outstanding writes.
    fn op_held(&self, inner: &LineInner, op: &Op) -> bool {
        if op.kind.is_locking()
            && self.pending.has_messages(inner.id)
            && !inner.is_locked()
            && !inner.mid_upgrade_to_exclusive()
        {
            return true;
        }
        op.kind.is_push() && inner.modified
    }

    fn op_get(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        _eff: &mut Effects,
    ) -> Result<OpOutcome, CacheError> {
        if inner.deleted {
            return Err(CacheError::RefNotFound { id: inner.id });
        }
        if inner.state >= LineState::Shared {
            self.monitor.hit();
            return Ok(OpOutcome::Ready(self.read_result(inner)));
        }
        if inner.data.is_some()
            && inner.owner >= 0
            && self.dirty.may_serve_stale(inner.owner, inner.owner_clock)
        {
            self.monitor.stale_served();
            return Ok(OpOutcome::Ready(self.read_result(inner)));
        }
        self.request_state(inner, LineState::Shared, op.node_hint);
        Ok(OpOutcome::Pending)
    }

    fn op_get_locked(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        eff: &mut Effects,
        exclusive: bool,
    ) -> Result<OpOutcome, CacheError> {
        if inner.deleted && !is_reserved(inner.id) {
            return Err(CacheError::RefNotFound { id: inner.id });
        }
        let reached = if exclusive {
            self.ensure_exclusive(inner, eff, op.node_hint)
        } else {
            self.ensure_owned(inner, op.node_hint)
        };
        if !reached {
            return Ok(OpOutcome::Pending);
        }
        self.lock_line(inner, op);
        self.monitor.hit();
        Ok(OpOutcome::Ready(self.read_result(inner)))
    }

    fn op_set(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        eff: &mut Effects,
    ) -> Result<OpOutcome, CacheError> {
        if inner.deleted && !is_reserved(inner.id) {
            return Err(CacheError::RefNotFound { id: inner.id });
        }
        if !self.ensure_exclusive(inner, eff, op.node_hint) {
            return Ok(OpOutcome::Pending);
        }
        if op.txn.is_some() {
            self.lock_line(inner, op);
        }
        let version = self.write_data(inner, op, eff);
        if op.txn.is_none() && !inner.is_locked() && inner.modified {
            // No transaction to defer to; ship the write to the slave now.
            inner.slave = true;
            self.backup.backup(inner.id, version);
            if self.pending.has_messages(inner.id) {
                self.backup.flush();
            }
        }
        Ok(OpOutcome::Ready(OpResult::Version(version)))
    }

    fn op_del(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        eff: &mut Effects,
    ) -> Result<OpOutcome, CacheError> {
        if inner.deleted && !is_reserved(inner.id) {
            return Err(CacheError::RefNotFound { id: inner.id });
        }
        if !self.ensure_exclusive(inner, eff, op.node_hint) {
            return Ok(OpOutcome::Pending);
        }
        if op.txn.is_some() {
            self.lock_line(inner, op);
        }
        if is_reserved(inner.id) {
            // Reserved ids survive deletion: drop the content, keep E.
            if let Some(buf) = inner.data.take() {
                self.storage.deallocate(inner.id, buf);
            }
            inner.version += 1;
            inner.deleted = false;
            inner.modified = self.backup.has_slave();
            self.table.update_weight(inner.id, inner.weight());
            self.line_changed(inner, eff, DrainReason::StateChanged);
            return Ok(OpOutcome::Ready(OpResult::Done));
        }
        inner.deleted = true;
        if self.has_server {
            // Stay owned until the directory acknowledges; its INVACK
            // empties the wait set and retires the record.
            if let Some(sharers) = inner.sharers.as_mut() {
                sharers.insert(SERVER);
            }
            self.transmit(
                Destination::Node(SERVER),
                None,
                MessageBody::Inv {
                    line: inner.id,
                    previous_owner: self.my_node,
                },
            );
        } else if !inner.is_locked() {
            self.set_line_state(inner, eff, LineState::Invalid);
            self.destroy_line(inner);
        }
        Ok(OpOutcome::Ready(OpResult::Done))
    }

    fn op_push(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        eff: &mut Effects,
    ) -> Result<OpOutcome, CacheError> {
        if !inner.state.is_owned() || inner.deleted {
            warn!("push on line {} ignored: not owned here", inner.id);
            return Ok(OpOutcome::Ready(OpResult::Done));
        }
        if inner.state == LineState::Exclusive {
            self.set_line_state(inner, eff, LineState::Owned);
        }
        for node in op.nodes.clone() {
            if node == self.my_node || node == SERVER {
                continue;
            }
            if let Some(sharers) = inner.sharers.as_mut() {
                sharers.insert(node);
            }
            self.transmit(
                Destination::Node(node),
                None,
                MessageBody::Put {
                    line: inner.id,
                    version: inner.version,
                    data: inner.data.clone(),
                },
            );
        }
        self.line_changed(inner, eff, DrainReason::StateChanged);
        Ok(OpOutcome::Ready(OpResult::Done))
    }

    fn op_push_exclusive(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        eff: &mut Effects,
    ) -> Result<OpOutcome, CacheError> {
        if inner.state != LineState::Exclusive || inner.deleted {
            warn!("ownership transfer of line {} ignored: not exclusive here", inner.id);
            return Ok(OpOutcome::Ready(OpResult::Done));
        }
        let Some(&target) = op.nodes.first() else {
            return Ok(OpOutcome::Ready(OpResult::Done));
        };
        let handed: Vec<NodeId> = inner
            .sharers
            .as_ref()
            .map(|s| {
                s.iter()
                    .copied()
                    .filter(|&n| n != SERVER && n != target)
                    .collect()
            })
            .unwrap_or_default();
        self.transmit(
            Destination::Node(target),
            None,
            MessageBody::PutX {
                line: inner.id,
                sharers: handed,
                version: inner.version,
                data: inner.data.clone(),
            },
        );
        inner.next_state = None;
        inner.owner = target;
        inner.owner_clock = 0;
        self.set_line_state(inner, eff, LineState::Invalid);
        self.line_changed(inner, eff, DrainReason::StateChanged);
        Ok(OpOutcome::Ready(OpResult::Done))
    }

    fn op_send(
        &self,
        inner: &mut LineInner,
        op: &mut Op,
        eff: &mut Effects,
    ) -> Result<OpOutcome, CacheError> {
        if inner.deleted {
            return Err(CacheError::RefNotFound { id: inner.id });
        }
        if inner.state.is_owned() {
            // We are the owner; deliver without touching the wire.
            let data = op.data.as_ref().map(|d| d.to_vec()).unwrap_or_default();
            eff.message(inner, data);
            return Ok(OpOutcome::Ready(OpResult::Done));
        }
        let to = if inner.owner >= 0 {
            Destination::Node(inner.owner)
        } else if op.node_hint >= 0 {
            Destination::Node(op.node_hint)
        } else {
            Destination::Broadcast
        };
        let target = match to {
            Destination::Node(n) => n,
            Destination::Broadcast => NO_NODE,
        };
        // (Re)send when this op has no message in flight, or the believed
        // owner moved since the last attempt.
        if op.msg_id.is_none() || op.nodes.first() != Some(&target) {
            let data = op.data.clone().unwrap_or_default();
            let msg_id = self.transmit(to, None, MessageBody::Msg { line: inner.id, data });
            op.msg_id = Some(msg_id);
            op.nodes = vec![target];
        }
        Ok(OpOutcome::Pending)
    }

    // ------------------------------------------------------------------
    // Transition helpers
    // ------------------------------------------------------------------

    /// Ask the network to bring this line to `target`. Repeated calls
    /// while a sufficient fetch is outstanding send nothing.
    pub(crate) fn request_state(
        &self,
        inner: &mut LineInner,
        target: LineState,
        hint: NodeId,
    ) {
        let need_ownership = target >= LineState::Owned;
        if let Some(next) = inner.next_state {
            let have_ownership_fetch = next >= LineState::Owned;
            inner.raise_next_state(target);
            if have_ownership_fetch || !need_ownership {
                return;
            }
        } else {
            inner.raise_next_state(target);
        }
        self.monitor.miss();
        let body = if need_ownership {
            MessageBody::GetX { line: inner.id }
        } else {
            MessageBody::Get { line: inner.id }
        };
        let to = if inner.owner >= 0 {
            Destination::Node(inner.owner)
        } else if hint >= 0 {
            Destination::Node(hint)
        } else {
            Destination::Broadcast
        };
        self.transmit(to, None, body);
    }

    fn ensure_owned(&self, inner: &mut LineInner, hint: NodeId) -> bool {
        if inner.state >= LineState::Owned {
            return true;
        }
        self.request_state(inner, LineState::Owned, hint);
        false
    }

    fn ensure_exclusive(&self, inner: &mut LineInner, eff: &mut Effects, hint: NodeId) -> bool {
        match inner.state {
            LineState::Exclusive => true,
            LineState::Owned => {
                if !inner.mid_upgrade_to_exclusive() {
                    self.advance_to_exclusive(inner, eff);
                }
                inner.state == LineState::Exclusive
            }
            _ => {
                self.request_state(inner, LineState::Exclusive, hint);
                false
            }
        }
    }

    /// O -> E: invalidate every sharer, then enter E per the wait rule:
    /// wait for the server's acknowledgement when broadcasts route through
    /// it, wait for the previous owner's when there is no server (it must
    /// have cleaned its slaves first), and otherwise enter E immediately,
    /// leaving the acknowledgements to trickle in.
    pub(crate) fn advance_to_exclusive(&self, inner: &mut LineInner, eff: &mut Effects) {
        inner.raise_next_state(LineState::Exclusive);
        let prev_owner = inner.owner;
        let targets: Vec<NodeId> = inner
            .sharers
            .as_ref()
            .map(|s| s.iter().copied().filter(|&n| n != SERVER).collect())
            .unwrap_or_default();
        for node in &targets {
            self.transmit(
                Destination::Node(*node),
                None,
                MessageBody::Inv {
                    line: inner.id,
                    previous_owner: prev_owner,
                },
            );
        }
        let route_via_server = self.comm.is_send_to_server_instead_of_multicast();
        if self.has_server && route_via_server {
            if let Some(sharers) = inner.sharers.as_mut() {
                sharers.insert(SERVER);
            }
            self.transmit(
                Destination::Node(SERVER),
                None,
                MessageBody::Inv {
                    line: inner.id,
                    previous_owner: prev_owner,
                },
            );
        } else if !self.has_server
            && prev_owner >= 0
            && prev_owner != self.my_node
            && !inner.has_sharer(prev_owner)
        {
            if let Some(sharers) = inner.sharers.as_mut() {
                sharers.insert(prev_owner);
            }
            self.transmit(
                Destination::Node(prev_owner),
                None,
                MessageBody::Inv {
                    line: inner.id,
                    previous_owner: prev_owner,
                },
            );
        } else if self.has_server {
            // No wait required: enter E now, with stragglers' INVACKs
            // cleaning the sharer set asynchronously.
            inner.next_state = None;
            self.set_line_state(inner, eff, LineState::Exclusive);
            inner.owner = self.my_node;
            return;
        }
        if inner.sharer_count() == 0 {
            inner.next_state = None;
            self.set_line_state(inner, eff, LineState::Exclusive);
            inner.owner = self.my_node;
        }
    }

    /// The last sharer acknowledged: finish at E, or retire the record if
    /// a deletion was awaiting the acknowledgements.
    pub(crate) fn complete_ownership(&self, inner: &mut LineInner, eff: &mut Effects) {
        if inner.deleted {
            self.set_line_state(inner, eff, LineState::Invalid);
            self.destroy_line(inner);
            return;
        }
        self.set_line_state(inner, eff, LineState::Exclusive);
        inner.owner = self.my_node;
        if inner.next_state == Some(LineState::Exclusive) {
            inner.next_state = None;
        }
    }

    fn lock_line(&self, inner: &mut LineInner, op: &Op) {
        inner.locks += 1;
        if let Some(txn) = &op.txn {
            txn.record_lock(inner.id);
        }
    }

    /// Apply a write to an exclusive line. Bumps the version unless
    /// `compare_before_write` proves the write redundant; the very first
    /// write always establishes version 1.
    fn write_data(&self, inner: &mut LineInner, op: &mut Op, eff: &mut Effects) -> Version {
        let Some(new) = op.data.take() else {
            return inner.version;
        };
        if inner.version > 0
            && self.config.compare_before_write
            && inner.data.as_deref() == Some(new.as_ref())
        {
            self.storage.deallocate(inner.id, new);
            return inner.version;
        }
        if let Some(txn) = &op.txn {
            let id = inner.id;
            let version = inner.version;
            let modified = inner.modified;
            let current = inner.data.as_deref();
            let storage = &self.storage;
            txn.record_rollback(id, || RollbackRecord {
                version,
                modified,
                data: current.map(|d| {
                    let mut buf = storage.allocate(d.len());
                    buf.copy_from_slice(d);
                    buf
                }),
            });
        }
        inner.version += 1;
        if let Some(old) = inner.data.take() {
            self.storage.deallocate(inner.id, old);
        }
        inner.data = Some(new);
        inner.modified = self.backup.has_slave();
        self.table.update_weight(inner.id, inner.weight());
        self.line_changed(inner, eff, DrainReason::StateChanged);
        inner.version
    }

    fn read_result(&self, inner: &LineInner) -> OpResult {
        OpResult::Data {
            version: inner.version,
            data: inner.data.as_ref().map(|d| d.to_vec()),
        }
    }
}
