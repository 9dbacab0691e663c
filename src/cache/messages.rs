//! Inbound-message half of the state machine.
//!
//! Every handler runs under the line lock. A message that arrives in a
//! state the protocol does not admit is logged and discarded; a message
//! the line cannot absorb yet (locked, modified, or upgrading) is parked
//! in the pending set and redelivered when the line changes.

use log::{debug, trace};

use crate::line::{LineInner, LineState};
use crate::message::{Destination, Message, MessageBody, MessageKind};
use crate::monitor::DrainReason;
use crate::ops::OpKind;
use crate::error::CacheError;
use crate::types::{NodeId, Version, NO_NODE, SERVER};

use super::{Cache, Effects};

impl Cache {
    pub(super) fn route_message(&self, msg: Message) {
        let kind = msg.body.kind();
        self.monitor.message_received(kind);
        // Content-bearing traffic from an owner advances its dirty-read
        // clock no matter what happens to the line below.
        if matches!(kind, MessageKind::Put | MessageKind::PutX | MessageKind::Msg) {
            let purged = self.dirty.record_put(msg.from, msg.id);
            if purged > 0 {
                self.monitor.stale_purged(purged);
            }
        }
        let Some(id) = msg.body.line() else {
            trace!("ack from {}", msg.from);
            return;
        };
        let line = match kind {
            // These establish or mutate a replica: materialize the line.
            MessageKind::Put
            | MessageKind::PutX
            | MessageKind::Inv
            | MessageKind::Backup => self.acquire_line(id),
            // The rest only make sense against a line we already track.
            _ => match self.lookup_line(id) {
                Some(line) => line,
                None => {
                    trace!("{kind:?} from {} for unknown line {id}; dropped", msg.from);
                    return;
                }
            },
        };
        self.with_line_mut(&line, |cache, inner, eff| {
            cache.handle_line_message_locked(inner, msg, eff)
        });
    }

    pub(crate) fn handle_line_message_locked(
        &self,
        inner: &mut LineInner,
        msg: Message,
        eff: &mut Effects,
    ) {
        if inner.destroyed {
            trace!("message for destroyed line {}; dropped", inner.id);
            return;
        }
        if self.message_held(inner, &msg) {
            trace!(
                "line {}: holding {:?} from {}",
                inner.id,
                msg.body.kind(),
                msg.from
            );
            self.pending.enqueue_message(msg);
            return;
        }
        match msg.body.clone() {
            MessageBody::Get { .. } => self.handle_get(inner, &msg, eff),
            MessageBody::GetX { .. } => self.handle_getx(inner, &msg, eff),
            MessageBody::Put { version, data, .. } => {
                self.handle_put(inner, &msg, version, data, eff)
            }
            MessageBody::PutX {
                sharers,
                version,
                data,
                ..
            } => self.handle_putx(inner, &msg, sharers, version, data, eff),
            MessageBody::Inv { previous_owner, .. } => {
                self.handle_inv(inner, msg, previous_owner, eff)
            }
            MessageBody::InvAck { .. } => self.handle_invack(inner, msg, eff),
            MessageBody::NotFound { .. } => self.handle_not_found(inner, &msg, eff),
            MessageBody::ChangedOwner {
                new_owner, certain, ..
            } => self.handle_changed_owner(inner, new_owner, certain, eff),
            MessageBody::Msg { data, .. } => self.handle_msg(inner, &msg, data, eff),
            MessageBody::MsgAck { .. } => self.handle_msgack(inner, &msg),
            MessageBody::Backup { version, data, .. } => {
                self.handle_backup(inner, &msg, version, data, eff)
            }
            MessageBody::BackupAck { version, .. } => {
                self.handle_backupack(inner, version, eff)
            }
            MessageBody::Timeout { .. } => self.handle_timeout(inner, eff),
            MessageBody::Ack => {}
        }
    }

    /// Holding rules: coherence traffic yields to a locked, modified, or
    /// upgrading line — except that a lock alone never blocks an INV.
    fn message_held(&self, inner: &LineInner, msg: &Message) -> bool {
        match msg.body.kind() {
            MessageKind::Inv => inner.modified || inner.mid_upgrade_to_exclusive(),
            MessageKind::Get | MessageKind::GetX | MessageKind::Put | MessageKind::PutX => {
                inner.is_locked() || inner.modified || inner.mid_upgrade_to_exclusive()
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------

    fn handle_get(&self, inner: &mut LineInner, msg: &Message, eff: &mut Effects) {
        let peer = msg.from;
        if !inner.state.is_owned() {
            if inner.deleted {
                self.transmit(
                    Destination::Node(peer),
                    Some(msg.id),
                    MessageBody::NotFound { line: inner.id },
                );
            } else if inner.owner >= 0 && inner.owner != peer {
                self.transmit(
                    Destination::Node(peer),
                    Some(msg.id),
                    MessageBody::ChangedOwner {
                        line: inner.id,
                        new_owner: inner.owner,
                        certain: false,
                    },
                );
            } else {
                trace!("line {}: GET from {peer} but not owner; dropped", inner.id);
            }
            return;
        }
        if inner.deleted {
            self.transmit(
                Destination::Node(peer),
                Some(msg.id),
                MessageBody::NotFound { line: inner.id },
            );
            return;
        }
        if inner.state == LineState::Exclusive {
            self.set_line_state(inner, eff, LineState::Owned);
        }
        if let Some(sharers) = inner.sharers.as_mut() {
            sharers.insert(peer);
        }
        self.transmit(
            Destination::Node(peer),
            Some(msg.id),
            MessageBody::Put {
                line: inner.id,
                version: inner.version,
                data: inner.data.clone(),
            },
        );
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn handle_getx(&self, inner: &mut LineInner, msg: &Message, eff: &mut Effects) {
        let peer = msg.from;
        if !inner.state.is_owned() {
            if inner.deleted {
                self.transmit(
                    Destination::Node(peer),
                    Some(msg.id),
                    MessageBody::NotFound { line: inner.id },
                );
            } else if inner.owner >= 0 && inner.owner != peer {
                self.transmit(
                    Destination::Node(peer),
                    Some(msg.id),
                    MessageBody::ChangedOwner {
                        line: inner.id,
                        new_owner: inner.owner,
                        certain: false,
                    },
                );
            } else {
                trace!("line {}: GETX from {peer} but not owner; dropped", inner.id);
            }
            return;
        }
        if inner.deleted {
            self.transmit(
                Destination::Node(peer),
                Some(msg.id),
                MessageBody::NotFound { line: inner.id },
            );
            return;
        }
        if inner.slave && self.backup.inv(inner.id, peer) {
            inner.slave = false;
        }
        let handed: Vec<_> = inner
            .sharers
            .as_ref()
            .map(|s| {
                s.iter()
                    .copied()
                    .filter(|&n| n != peer && n != SERVER && n != self.my_node)
                    .collect()
            })
            .unwrap_or_default();
        self.transmit(
            Destination::Node(peer),
            Some(msg.id),
            MessageBody::PutX {
                line: inner.id,
                sharers: handed,
                version: inner.version,
                data: inner.data.clone(),
            },
        );
        if self.has_server && peer != SERVER {
            self.transmit(
                Destination::Node(SERVER),
                None,
                MessageBody::Inv {
                    line: inner.id,
                    previous_owner: self.my_node,
                },
            );
        }
        inner.next_state = None;
        inner.owner = peer;
        inner.owner_clock = 0;
        // A still-dirty slave without a directory keeps us at S so the
        // stale backup view cannot resurface as ownership.
        let fallback = if inner.slave && !self.has_server {
            LineState::Shared
        } else {
            LineState::Invalid
        };
        self.set_line_state(inner, eff, fallback);
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn handle_put(
        &self,
        inner: &mut LineInner,
        msg: &Message,
        version: Version,
        data: Option<Box<[u8]>>,
        eff: &mut Effects,
    ) {
        if inner.state.is_owned() {
            debug!("line {}: PUT from {} while owned; dropped", inner.id, msg.from);
            return;
        }
        if version < inner.version {
            trace!(
                "line {}: stale PUT v{version} (have v{}); dropped",
                inner.id,
                inner.version
            );
            return;
        }
        self.set_line_state(inner, eff, LineState::Shared);
        inner.owner = msg.from;
        // An equal version merely revalidates the replica we hold.
        if version > inner.version {
            inner.version = version;
            self.install_data(inner, data, eff);
            eff.received(inner);
        }
        inner.owner_clock = msg.id as i64;
        if inner.next_state == Some(LineState::Shared) {
            inner.next_state = None;
        }
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn handle_putx(
        &self,
        inner: &mut LineInner,
        msg: &Message,
        sharers: Vec<NodeId>,
        version: Version,
        data: Option<Box<[u8]>>,
        eff: &mut Effects,
    ) {
        if inner.state.is_owned() {
            debug!("line {}: PUTX from {} while owned; dropped", inner.id, msg.from);
            return;
        }
        let mut set = self.take_sharer_set();
        set.extend(sharers);
        if self.has_server {
            set.insert(SERVER);
        }
        set.remove(&self.my_node);
        if version > inner.version {
            inner.version = version;
            self.install_data(inner, data, eff);
            eff.received(inner);
        }
        inner.owner_clock = msg.id as i64;
        if set.is_empty() {
            self.return_sharer_set(set);
            self.set_line_state(inner, eff, LineState::Exclusive);
            inner.owner = self.my_node;
            inner.next_state = None;
        } else {
            self.set_line_state(inner, eff, LineState::Owned);
            // Retain the previous owner for INV routing.
            inner.owner = msg.from;
            if let Some(old) = inner.sharers.replace(set) {
                self.return_sharer_set(old);
            }
            if inner.next_state == Some(LineState::Exclusive) {
                self.advance_to_exclusive(inner, eff);
            } else {
                inner.next_state = None;
            }
        }
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn handle_inv(
        &self,
        inner: &mut LineInner,
        msg: Message,
        previous_owner: NodeId,
        eff: &mut Effects,
    ) {
        let peer = msg.from;
        if self.cluster.is_master() {
            if inner.state == LineState::Exclusive {
                debug!("line {}: INV from {peer} while exclusive; dropped", inner.id);
                return;
            }
            if inner.slave {
                if self.backup.inv(inner.id, peer) {
                    inner.slave = false;
                } else {
                    // The slave still holds a view; retry once it reports
                    // clean through a self-addressed INVACK.
                    self.pending.enqueue_message(msg);
                    return;
                }
            }
        } else if !matches!(inner.state, LineState::Invalid | LineState::Exclusive) {
            debug!("line {}: INV from {peer} in slave role; dropped", inner.id);
            return;
        }
        if inner.owner >= 0 {
            self.dirty.record_inv(inner.owner);
        }
        inner.next_state = None;
        self.set_line_state(inner, eff, LineState::Invalid);
        inner.owner = if peer == SERVER || peer == self.my_node {
            previous_owner
        } else {
            peer
        };
        inner.owner_clock = msg.id as i64;
        eff.invalidated(inner);
        if peer != SERVER && peer != self.my_node {
            self.transmit(
                Destination::Node(peer),
                Some(msg.id),
                MessageBody::InvAck { line: inner.id },
            );
        }
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn handle_invack(&self, inner: &mut LineInner, msg: Message, eff: &mut Effects) {
        let peer = msg.from;
        if peer == self.my_node {
            // Our slave finished invalidating its view of this line.
            if inner.state.is_owned() {
                debug!("line {}: self INVACK while owned; dropped", inner.id);
                return;
            }
            if inner.is_locked() {
                self.pending.enqueue_message(msg);
                return;
            }
            inner.slave = false;
            if inner.state == LineState::Shared {
                self.set_line_state(inner, eff, LineState::Invalid);
                if inner.owner >= 0 {
                    self.transmit(
                        Destination::Node(inner.owner),
                        None,
                        MessageBody::InvAck { line: inner.id },
                    );
                }
            }
            self.line_changed(inner, eff, DrainReason::StateChanged);
            return;
        }
        if !inner.state.is_owned() {
            debug!("line {}: INVACK from {peer} but not owned; dropped", inner.id);
            return;
        }
        if let Some(sharers) = inner.sharers.as_mut() {
            sharers.remove(&peer);
        }
        if inner.sharer_count() == 0
            && (inner.state == LineState::Owned || inner.deleted)
        {
            self.complete_ownership(inner, eff);
        }
        // Deliberately signalled even when no transition happened: the
        // pending-message drain rides on it.
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn handle_not_found(&self, inner: &mut LineInner, msg: &Message, eff: &mut Effects) {
        if inner.state != LineState::Invalid {
            debug!("line {}: NOT_FOUND in state {:?}; dropped", inner.id, inner.state);
            return;
        }
        if msg.from == SERVER || !self.has_server {
            inner.deleted = true;
            inner.next_state = None;
            self.fail_pending_ops(inner, CacheError::RefNotFound { id: inner.id });
            self.line_changed(inner, eff, DrainReason::StateChanged);
        } else {
            // A peer lost the line; the directory is the better authority.
            inner.owner = SERVER;
            inner.next_state = None;
            self.line_changed(inner, eff, DrainReason::StateChanged);
        }
    }

    fn handle_changed_owner(
        &self,
        inner: &mut LineInner,
        new_owner: NodeId,
        certain: bool,
        eff: &mut Effects,
    ) {
        if inner.state.is_owned() {
            debug!("line {}: CHNGD_OWNR while owned; dropped", inner.id);
            return;
        }
        if new_owner >= 0 && self.cluster.is_member(new_owner) {
            inner.owner = new_owner;
        } else {
            inner.owner = if self.has_server { SERVER } else { NO_NODE };
        }
        trace!(
            "line {}: owner now {} (certain: {certain})",
            inner.id,
            inner.owner
        );
        // Pending ops re-target and re-send on the drain below.
        inner.next_state = None;
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn handle_msg(
        &self,
        inner: &mut LineInner,
        msg: &Message,
        data: Box<[u8]>,
        eff: &mut Effects,
    ) {
        let peer = msg.from;
        if inner.state.is_owned() {
            if inner.deleted {
                self.transmit(
                    Destination::Node(peer),
                    Some(msg.id),
                    MessageBody::NotFound { line: inner.id },
                );
                return;
            }
            eff.message(inner, data.to_vec());
            self.transmit(
                Destination::Node(peer),
                Some(msg.id),
                MessageBody::MsgAck { line: inner.id },
            );
        } else if inner.owner >= 0 && inner.owner != peer {
            self.transmit(
                Destination::Node(peer),
                Some(msg.id),
                MessageBody::ChangedOwner {
                    line: inner.id,
                    new_owner: inner.owner,
                    certain: false,
                },
            );
        } else {
            trace!("line {}: MSG from {peer} but owner unknown; dropped", inner.id);
        }
    }

    fn handle_msgack(&self, inner: &mut LineInner, msg: &Message) {
        let Some(acked) = msg.in_reply_to else {
            trace!("line {}: MSGACK without request id; dropped", inner.id);
            return;
        };
        let mut ops = self.pending.take_ops(inner.id);
        let mut keep = std::collections::VecDeque::new();
        let mut found = false;
        while let Some(mut op) = ops.pop_front() {
            if !found && op.kind == OpKind::Send && op.msg_id == Some(acked) {
                found = true;
                op.complete(Ok(crate::ops::OpResult::Done));
            } else {
                keep.push_back(op);
            }
        }
        self.pending.put_back_ops(inner.id, keep);
        if !found {
            trace!("line {}: MSGACK for unknown message {acked}; dropped", inner.id);
        }
    }

    fn handle_backup(
        &self,
        inner: &mut LineInner,
        msg: &Message,
        version: Version,
        data: Option<Box<[u8]>>,
        eff: &mut Effects,
    ) {
        if self.cluster.is_master() {
            debug!("line {}: BACKUP received in master role; dropped", inner.id);
            return;
        }
        if version <= inner.version {
            trace!("line {}: stale BACKUP v{version}; dropped", inner.id);
            return;
        }
        inner.version = version;
        self.install_data(inner, data, eff);
        self.set_line_state(inner, eff, LineState::Exclusive);
        inner.owner = msg.from;
        self.transmit(
            Destination::Node(msg.from),
            Some(msg.id),
            MessageBody::BackupAck {
                line: inner.id,
                version,
            },
        );
    }

    fn handle_backupack(&self, inner: &mut LineInner, version: Version, eff: &mut Effects) {
        if inner.modified && inner.version == version {
            inner.modified = false;
            self.line_changed(inner, eff, DrainReason::BackupCleared);
        }
    }

    fn handle_timeout(&self, inner: &mut LineInner, eff: &mut Effects) {
        inner.next_state = None;
        self.fail_pending_ops(
            inner,
            CacheError::Timeout {
                id: inner.id,
                timeout_ms: self.config.timeout.as_millis() as u64,
            },
        );
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    #[cfg(test)]
    pub(crate) fn pending_message_count(&self, id: crate::types::LineId) -> usize {
        if self.pending.has_messages(id) {
            self.pending.take_messages(id).into_iter().fold(0, |n, m| {
                self.pending.enqueue_message(m);
                n + 1
            })
        } else {
            0
        }
    }
}
