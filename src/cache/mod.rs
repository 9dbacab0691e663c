//! The per-node coherence engine.
//!
//! Client threads call operations here; the transport delivers inbound
//! coherence messages here. Both are dispatched against the per-line state
//! machine under the line's own lock, with work that cannot proceed parked
//! in the pending queues until the line changes.

mod local_ops;
mod messages;
mod node_events;

#[cfg(test)]
mod tests;

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_channel::Receiver;
use dashmap::DashMap;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::allocator::{Allocation, IdAllocator};
use crate::backup::Backup;
use crate::cluster::Cluster;
use crate::comm::Comm;
use crate::config::CacheConfig;
use crate::dirty::DirtyReadTracker;
use crate::error::{CacheError, ConfigError};
use crate::line::{Line, LineInner, LineState};
use crate::listener::CacheListener;
use crate::message::{Destination, Message, MessageBody, MessageKind};
use crate::monitor::{CacheMonitor, DrainReason, NoopMonitor};
use crate::ops::{Op, OpKind, OpOutcome, OpResult};
use crate::pending::PendingQueues;
use crate::storage::CacheStorage;
use crate::table::LineTable;
use crate::transaction::{RollbackRecord, Transaction};
use crate::types::{LineId, MsgId, NodeId, Version, NO_NODE, SERVER};

use node_events::NodeEvent;

/// Content of a line as returned to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemData {
    pub version: Version,
    pub data: Option<Vec<u8>>,
}

/// The coherence engine of one cluster node.
pub struct Cache {
    config: CacheConfig,
    comm: Arc<dyn Comm>,
    cluster: Arc<dyn Cluster>,
    backup: Arc<dyn Backup>,
    storage: Arc<dyn CacheStorage>,
    allocator: Arc<dyn IdAllocator>,
    monitor: Arc<dyn CacheMonitor>,
    my_node: NodeId,
    has_server: bool,
    table: LineTable,
    pending: PendingQueues,
    dirty: DirtyReadTracker,
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
    node_events: DashMap<NodeId, NodeEvent>,
    alloc_waiters: Mutex<VecDeque<Op>>,
    next_msg_id: AtomicU64,
    threads: ThreadStates,
    line_pool: Mutex<Vec<Arc<Line>>>,
    sharer_pool: Mutex<Vec<HashSet<NodeId>>>,
}

const POOL_LIMIT: usize = 256;

impl Cache {
    pub fn new(
        config: CacheConfig,
        cluster: Arc<dyn Cluster>,
        comm: Arc<dyn Comm>,
        backup: Arc<dyn Backup>,
        storage: Arc<dyn CacheStorage>,
        allocator: Arc<dyn IdAllocator>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_monitor(
            config,
            cluster,
            comm,
            backup,
            storage,
            allocator,
            Arc::new(NoopMonitor),
        )
    }

    pub fn with_monitor(
        config: CacheConfig,
        cluster: Arc<dyn Cluster>,
        comm: Arc<dyn Comm>,
        backup: Arc<dyn Backup>,
        storage: Arc<dyn CacheStorage>,
        allocator: Arc<dyn IdAllocator>,
        monitor: Arc<dyn CacheMonitor>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let my_node = cluster.my_node_id();
        let has_server = cluster.has_server();
        Ok(Arc::new(Self {
            table: LineTable::new(config.max_capacity),
            config,
            comm,
            cluster,
            backup,
            storage,
            allocator,
            monitor,
            my_node,
            has_server,
            pending: PendingQueues::new(),
            dirty: DirtyReadTracker::new(),
            listeners: RwLock::new(Vec::new()),
            node_events: DashMap::new(),
            alloc_waiters: Mutex::new(VecDeque::new()),
            next_msg_id: AtomicU64::new(1),
            threads: ThreadStates::default(),
            line_pool: Mutex::new(Vec::new()),
            sharer_pool: Mutex::new(Vec::new()),
        }))
    }

    // ------------------------------------------------------------------
    // Public operations. All block up to `config.timeout` when the line
    // must transition first.
    // ------------------------------------------------------------------

    /// Read a line. May be served from invalidated data when that is
    /// provably the latest content this node has heard from the owner.
    pub fn get(&self, id: LineId) -> Result<ItemData, CacheError> {
        self.run_blocking(Op::new(OpKind::Get, id))
            .map(Self::into_item)
    }

    /// As [`get`](Self::get), with a routing hint for an unknown owner.
    pub fn get_from(&self, id: LineId, node_hint: NodeId) -> Result<ItemData, CacheError> {
        let mut op = Op::new(OpKind::Get, id);
        op.node_hint = node_hint;
        self.run_blocking(op).map(Self::into_item)
    }

    /// Read a line and lock it under `txn`, acquiring ownership first.
    pub fn get_shared(&self, id: LineId, txn: &Transaction) -> Result<ItemData, CacheError> {
        let mut op = Op::new(OpKind::GetShared, id);
        op.txn = Some(txn.shared.clone());
        self.run_blocking(op).map(Self::into_item)
    }

    /// Read a line exclusively and lock it under `txn`.
    pub fn get_exclusive(&self, id: LineId, txn: &Transaction) -> Result<ItemData, CacheError> {
        let mut op = Op::new(OpKind::GetExclusive, id);
        op.txn = Some(txn.shared.clone());
        self.run_blocking(op).map(Self::into_item)
    }

    /// Write a line, acquiring exclusive state first. Returns the version
    /// the write produced (or kept, when `compare_before_write` elides an
    /// identical write).
    pub fn set(
        &self,
        id: LineId,
        data: &[u8],
        txn: Option<&Transaction>,
    ) -> Result<Version, CacheError> {
        let mut op = Op::new(OpKind::Set, id);
        op.data = Some(self.copy_in(data)?);
        op.txn = txn.map(|t| t.shared.clone());
        match self.run_blocking(op)? {
            OpResult::Version(version) => Ok(version),
            other => Ok(Self::into_item(other).version),
        }
    }

    /// Delete a line, acquiring exclusive state first. Reserved ids are
    /// reset to an empty exclusive line instead of deleted.
    pub fn del(&self, id: LineId, txn: Option<&Transaction>) -> Result<(), CacheError> {
        let mut op = Op::new(OpKind::Del, id);
        op.txn = txn.map(|t| t.shared.clone());
        self.run_blocking(op).map(|_| ())
    }

    /// Allocate a fresh id and store `data` under it.
    pub fn put(
        &self,
        data: &[u8],
        txn: Option<&Transaction>,
    ) -> Result<(LineId, Version), CacheError> {
        let mut op = Op::new(OpKind::Put, 0);
        op.count = 1;
        op.data = Some(self.copy_in(data)?);
        op.txn = txn.map(|t| t.shared.clone());
        match self.run_blocking(op)? {
            OpResult::Stored { id, version } => Ok((id, version)),
            _ => Err(CacheError::RefNotFound { id: 0 }),
        }
    }

    /// Allocate `count` consecutive ids, all exclusively owned and empty.
    /// Returns the first id of the run.
    pub fn alloc(&self, count: usize, txn: Option<&Transaction>) -> Result<LineId, CacheError> {
        let mut op = Op::new(OpKind::Alloc, 0);
        op.count = count;
        op.txn = txn.map(|t| t.shared.clone());
        match self.run_blocking(op)? {
            OpResult::Allocated { first_id, .. } => Ok(first_id),
            _ => Err(CacheError::RefNotFound { id: 0 }),
        }
    }

    /// Proactively replicate an owned line to `nodes`.
    pub fn push(&self, id: LineId, nodes: &[NodeId]) -> Result<(), CacheError> {
        let mut op = Op::new(OpKind::Push, id);
        op.nodes = nodes.to_vec();
        self.run_blocking(op).map(|_| ())
    }

    /// Transfer exclusive ownership of a line to `node`.
    pub fn push_exclusive(&self, id: LineId, node: NodeId) -> Result<(), CacheError> {
        let mut op = Op::new(OpKind::PushExclusive, id);
        op.nodes = vec![node];
        self.run_blocking(op).map(|_| ())
    }

    /// Deliver an application message to the line's owner; completes when
    /// the owner acknowledges it.
    pub fn send(&self, id: LineId, data: &[u8]) -> Result<(), CacheError> {
        let mut op = Op::new(OpKind::Send, id);
        op.data = Some(data.to_vec().into_boxed_slice());
        self.run_blocking(op).map(|_| ())
    }

    /// Install a per-line listener. Permitted in slave role.
    pub fn listen(&self, id: LineId, listener: Arc<dyn CacheListener>) -> Result<(), CacheError> {
        let mut op = Op::new(OpKind::Listen, id);
        op.listener = Some(listener);
        self.run_blocking(op).map(|_| ())
    }

    /// Register a process-wide listener observing every line.
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.config.rollback_supported)
    }

    /// Commit (or abort) a transaction: unlock every line locked under
    /// it, schedule backups of the modified ones, and drain work the
    /// locks were holding back. The first operation error collected under
    /// the transaction is re-raised after cleanup.
    pub fn end_transaction(&self, txn: &Transaction, abort: bool) -> Result<(), CacheError> {
        self.with_dispatch(|| {
            if abort && txn.shared.rollback_supported {
                self.rollback(txn);
            }
            self.backup.start_backup();
            let mut flush = false;
            for id in txn.shared.take_lines() {
                let Some(line) = self.lookup_line(id) else {
                    continue;
                };
                self.with_line_mut(&line, |cache, inner, eff| {
                    if inner.locks > 0 {
                        inner.locks -= 1;
                    }
                    if inner.locks > 0 {
                        return;
                    }
                    if inner.modified {
                        inner.slave = true;
                        cache.backup.backup(id, inner.version);
                        if cache.pending.has_messages(id) {
                            flush = true;
                        }
                    }
                    cache.finish_unlock(inner, eff);
                });
            }
            self.backup.end_backup();
            if flush {
                self.backup.flush();
            }
            // Snapshots that were never restored still hold storage.
            for (id, record) in txn.shared.take_journal() {
                if let Some(buf) = record.data {
                    self.storage.deallocate(id, buf);
                }
            }
        });
        match txn.shared.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Single-line counterpart of commit, for lines locked outside a
    /// transaction object.
    pub fn release(&self, id: LineId) {
        self.with_dispatch(|| {
            let Some(line) = self.lookup_line(id) else {
                return;
            };
            self.with_line_mut(&line, |cache, inner, eff| {
                if inner.locks > 0 {
                    inner.locks -= 1;
                }
                if inner.locks > 0 {
                    return;
                }
                if inner.modified {
                    inner.slave = true;
                    cache.backup.backup(id, inner.version);
                    if cache.pending.has_messages(id) {
                        cache.backup.flush();
                    }
                }
                cache.finish_unlock(inner, eff);
            });
        });
    }

    fn rollback(&self, txn: &Transaction) {
        for (id, record) in txn.shared.take_journal() {
            let Some(line) = self.lookup_line(id) else {
                continue;
            };
            self.with_line_mut(&line, |cache, inner, eff| {
                cache.restore_snapshot(inner, record, eff);
            });
        }
    }

    fn restore_snapshot(&self, inner: &mut LineInner, record: RollbackRecord, eff: &mut Effects) {
        trace!(
            "line {}: rollback to version {}",
            inner.id,
            record.version
        );
        inner.version = record.version;
        inner.modified = record.modified;
        if let Some(old) = inner.data.take() {
            self.storage.deallocate(inner.id, old);
        }
        inner.data = record.data;
        self.table.update_weight(inner.id, inner.weight());
        self.line_changed(inner, eff, DrainReason::StateChanged);
    }

    fn finish_unlock(&self, inner: &mut LineInner, eff: &mut Effects) {
        if inner.deleted && !self.has_server && inner.state == LineState::Exclusive {
            // A delete deferred by the lock completes now.
            self.set_line_state(inner, eff, LineState::Invalid);
            self.destroy_line(inner);
            return;
        }
        self.line_changed(inner, eff, DrainReason::LockReleased);
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Entry point for the transport. Messages from one sender must be
    /// delivered in send order.
    pub fn receive(&self, msg: Message) {
        self.with_dispatch(|| self.route_message(msg));
    }

    /// The id allocator recovered; retry operations parked on it.
    pub fn id_allocator_ready(&self) {
        self.with_dispatch(|| {
            let mut waiters = std::mem::take(&mut *self.alloc_waiters.lock());
            while let Some(mut op) = waiters.pop_front() {
                match self.allocator.allocate_ids(op.count) {
                    Allocation::Ready(first) => {
                        let result = self.materialize_allocation(first, &mut op);
                        op.complete(result);
                    }
                    Allocation::Pending => {
                        // Still dry; keep this and everything behind it.
                        let mut rest = self.alloc_waiters.lock();
                        rest.push_back(op);
                        rest.extend(waiters);
                        return;
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Dispatch plumbing
    // ------------------------------------------------------------------

    fn run_blocking(&self, op: Op) -> Result<OpResult, CacheError> {
        if !self.cluster.is_master() && op.kind != OpKind::Listen {
            return Err(CacheError::NotMaster);
        }
        let id = op.line;
        let mut waiter: Option<Receiver<Result<OpResult, CacheError>>> = None;
        let outcome = self.with_dispatch(|| self.start_op(op, &mut waiter))?;
        match outcome {
            OpOutcome::Ready(result) => Ok(result),
            OpOutcome::Pending => {
                let Some(rx) = waiter else {
                    return Err(CacheError::RefNotFound { id });
                };
                if self.threads.depth() > 0 {
                    warn!("blocking cache operation on a transport thread (line {id})");
                }
                match rx.recv_timeout(self.config.timeout) {
                    Ok(result) => result,
                    Err(_) => {
                        self.monitor.op_timeout();
                        Err(CacheError::Timeout {
                            id,
                            timeout_ms: self.config.timeout.as_millis() as u64,
                        })
                    }
                }
            }
        }
    }

    fn start_op(
        &self,
        op: Op,
        waiter: &mut Option<Receiver<Result<OpResult, CacheError>>>,
    ) -> Result<OpOutcome, CacheError> {
        match op.kind {
            OpKind::Put | OpKind::Alloc => self.start_alloc_op(op, waiter),
            _ => self.start_line_op(op, waiter),
        }
    }

    fn start_line_op(
        &self,
        op: Op,
        waiter: &mut Option<Receiver<Result<OpResult, CacheError>>>,
    ) -> Result<OpOutcome, CacheError> {
        let line = self.acquire_line(op.line);
        self.with_line_mut(&line, move |cache, inner, eff| {
            let mut op = op;
            let outcome = cache.try_op(inner, &mut op, eff);
            if let Ok(OpOutcome::Pending) = outcome {
                let (tx, rx) = crossbeam_channel::bounded(1);
                op.completion = Some(tx);
                *waiter = Some(rx);
                cache.pending.enqueue_op(op);
            }
            outcome
        })
    }

    fn start_alloc_op(
        &self,
        mut op: Op,
        waiter: &mut Option<Receiver<Result<OpResult, CacheError>>>,
    ) -> Result<OpOutcome, CacheError> {
        match self.allocator.allocate_ids(op.count) {
            Allocation::Ready(first) => self
                .materialize_allocation(first, &mut op)
                .map(OpOutcome::Ready),
            Allocation::Pending => {
                let (tx, rx) = crossbeam_channel::bounded(1);
                op.completion = Some(tx);
                *waiter = Some(rx);
                self.alloc_waiters.lock().push_back(op);
                Ok(OpOutcome::Pending)
            }
        }
    }

    /// Create the freshly allocated lines in exclusive state.
    fn materialize_allocation(
        &self,
        first: LineId,
        op: &mut Op,
    ) -> Result<OpResult, CacheError> {
        for id in first..first + op.count as u64 {
            let line = self.new_line(id);
            let mut eff = Effects::new();
            {
                let mut inner = line.lock();
                self.set_line_state(&mut inner, &mut eff, LineState::Exclusive);
                inner.owner = self.my_node;
                if let Some(data) = op.data.take() {
                    inner.version = 1;
                    inner.data = Some(data);
                    inner.modified = self.backup.has_slave();
                }
                if let Some(txn) = &op.txn {
                    inner.locks += 1;
                    txn.record_lock(id);
                } else if inner.modified {
                    inner.slave = true;
                    self.backup.backup(id, inner.version);
                }
                self.table.insert_owned(id, line.clone());
            }
            self.fire_effects(eff);
        }
        match op.kind {
            OpKind::Put => Ok(OpResult::Stored {
                id: first,
                version: 1,
            }),
            _ => Ok(OpResult::Allocated {
                first_id: first,
                count: op.count,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Line access
    // ------------------------------------------------------------------

    fn lookup_line(&self, id: LineId) -> Option<Arc<Line>> {
        self.table.get(id)
    }

    fn acquire_line(&self, id: LineId) -> Arc<Line> {
        loop {
            let (line, created) = self.table.get_or_insert_shared(id, || self.new_line(id));
            if created {
                trace!("line {id}: created");
                return line;
            }
            if !line.lock().destroyed {
                return line;
            }
            // Raced with a destroy; the record already left the table.
        }
    }

    fn new_line(&self, id: LineId) -> Arc<Line> {
        if self.config.reuse_lines {
            if let Some(line) = self.line_pool.lock().pop() {
                line.lock().reset(id);
                return line;
            }
        }
        Line::new(id)
    }

    fn take_sharer_set(&self) -> HashSet<NodeId> {
        if self.config.reuse_sharer_sets {
            if let Some(set) = self.sharer_pool.lock().pop() {
                return set;
            }
        }
        HashSet::new()
    }

    fn return_sharer_set(&self, mut set: HashSet<NodeId>) {
        if !self.config.reuse_sharer_sets {
            return;
        }
        let mut pool = self.sharer_pool.lock();
        if pool.len() < POOL_LIMIT {
            set.clear();
            pool.push(set);
        }
    }

    /// Run `f` under the line lock, applying any registered node events
    /// first, then fire the accumulated listener events and eviction
    /// checks after the lock is released.
    fn with_line_mut<R>(
        &self,
        line: &Arc<Line>,
        f: impl FnOnce(&Self, &mut LineInner, &mut Effects) -> R,
    ) -> R {
        let mut eff = Effects::new();
        let result = {
            let mut inner = line.lock();
            self.apply_registered_events(&mut inner, &mut eff);
            f(self, &mut inner, &mut eff)
        };
        self.maybe_recycle(line);
        self.fire_effects(eff);
        result
    }

    /// Recycle a destroyed record once nothing else references it.
    fn maybe_recycle(&self, line: &Arc<Line>) {
        if !self.config.reuse_lines {
            return;
        }
        if !line.lock().destroyed {
            return;
        }
        if Arc::strong_count(line) != 1 {
            return;
        }
        let mut pool = self.line_pool.lock();
        if pool.len() < POOL_LIMIT {
            pool.push(line.clone());
        }
    }

    // ------------------------------------------------------------------
    // State-change bookkeeping
    // ------------------------------------------------------------------

    /// Change a line's coherence state: maintains the sharers invariant
    /// (recycling sets through the pool) and migrates the record between
    /// the owned and shared tables when it crosses the ownership boundary.
    pub(crate) fn set_line_state(
        &self,
        inner: &mut LineInner,
        eff: &mut Effects,
        new: LineState,
    ) {
        if inner.state == new {
            return;
        }
        let was_owned = inner.state.is_owned();
        let empty = if new.is_owned() && inner.sharers.is_none() {
            Some(self.take_sharer_set())
        } else {
            None
        };
        if !new.is_owned() {
            if let Some(set) = inner.sharers.take() {
                self.return_sharer_set(set);
            }
        }
        inner.set_state(new, empty.unwrap_or_default());
        if was_owned != new.is_owned() {
            if new.is_owned() {
                self.table.promote(inner.id);
            } else {
                self.table.demote(inner.id, inner.weight());
                eff.check_eviction = true;
            }
        }
    }

    /// The line completed a state or modified-flag change: re-evaluate
    /// deferred ops in FIFO order, and deferred messages once the line is
    /// neither locked nor modified.
    pub(crate) fn line_changed(
        &self,
        inner: &mut LineInner,
        eff: &mut Effects,
        reason: DrainReason,
    ) {
        if inner.draining {
            inner.redrain = true;
            return;
        }
        inner.draining = true;
        loop {
            inner.redrain = false;
            self.drain_ops(inner, eff);
            if !inner.is_locked() && !inner.modified {
                self.drain_messages(inner, eff, reason);
            }
            if !inner.redrain {
                break;
            }
        }
        inner.draining = false;
    }

    fn drain_ops(&self, inner: &mut LineInner, eff: &mut Effects) {
        let mut ops = self.pending.take_ops(inner.id);
        if ops.is_empty() {
            return;
        }
        let mut keep = VecDeque::new();
        while let Some(mut op) = ops.pop_front() {
            match self.try_op(inner, &mut op, eff) {
                Ok(OpOutcome::Pending) => keep.push_back(op),
                Ok(OpOutcome::Ready(result)) => op.complete(Ok(result)),
                Err(err) => op.complete(Err(err)),
            }
        }
        self.pending.put_back_ops(inner.id, keep);
    }

    fn drain_messages(&self, inner: &mut LineInner, eff: &mut Effects, reason: DrainReason) {
        let msgs = self.pending.take_messages(inner.id);
        if msgs.is_empty() {
            return;
        }
        self.monitor.messages_drained(reason, msgs.len());
        for msg in msgs {
            self.handle_line_message_locked(inner, msg, eff);
        }
    }

    pub(crate) fn fail_pending_ops(&self, inner: &mut LineInner, err: CacheError) {
        let mut ops = self.pending.take_ops(inner.id);
        while let Some(mut op) = ops.pop_front() {
            op.complete(Err(err.clone()));
        }
    }

    /// Tear down a line record: remove it from the tables, release its
    /// storage, and fail whatever was still waiting on it.
    pub(crate) fn destroy_line(&self, inner: &mut LineInner) {
        let id = inner.id;
        trace!("line {id}: destroyed");
        self.table.remove(id);
        if let Some(buf) = inner.data.take() {
            self.storage.deallocate(id, buf);
        }
        self.pending.drop_messages(id);
        self.fail_pending_ops(inner, CacheError::RefNotFound { id });
        if let Some(set) = inner.sharers.take() {
            self.return_sharer_set(set);
        }
        inner.listener = None;
        inner.destroyed = true;
    }

    /// Replace a line's payload with bytes arriving off the wire.
    pub(crate) fn install_data(
        &self,
        inner: &mut LineInner,
        data: Option<Box<[u8]>>,
        eff: &mut Effects,
    ) {
        if let Some(old) = inner.data.take() {
            self.storage.deallocate(inner.id, old);
        }
        inner.data = data.map(|d| {
            let mut buf = self.storage.allocate(d.len());
            buf.copy_from_slice(&d);
            buf
        });
        self.table.update_weight(inner.id, inner.weight());
        eff.check_eviction = true;
    }

    /// Copy caller bytes into a storage buffer, enforcing the size bound.
    fn copy_in(&self, data: &[u8]) -> Result<Box<[u8]>, CacheError> {
        if data.len() > self.config.max_item_size {
            return Err(CacheError::SizeExceeded {
                size: data.len(),
                max: self.config.max_item_size,
            });
        }
        let mut buf = self.storage.allocate(data.len());
        buf.copy_from_slice(data);
        Ok(buf)
    }

    fn into_item(result: OpResult) -> ItemData {
        match result {
            OpResult::Data { version, data } => ItemData { version, data },
            OpResult::Version(version) => ItemData {
                version,
                data: None,
            },
            _ => ItemData {
                version: 0,
                data: None,
            },
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Stamp and send a message. Self-addressed messages short-circuit
    /// through the local delivery path; a departed target produces the
    /// documented auto-response instead of an error.
    pub(crate) fn transmit(
        &self,
        to: Destination,
        in_reply_to: Option<MsgId>,
        body: MessageBody,
    ) -> MsgId {
        let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let to = match to {
            Destination::Broadcast if self.comm.is_send_to_server_instead_of_multicast() => {
                Destination::Node(SERVER)
            }
            other => other,
        };
        let msg = Message {
            from: self.my_node,
            to,
            id,
            in_reply_to,
            body,
        };
        if let Destination::Node(node) = to {
            if node == self.my_node {
                self.deliver_local(msg);
                return id;
            }
        }
        let retry = matches!(
            msg.body.kind(),
            MessageKind::Inv | MessageKind::Get | MessageKind::GetX
        )
        .then(|| msg.clone());
        if let Err(err) = self.comm.send(msg) {
            debug!("send failed: {err}");
            if let Some(original) = retry {
                self.auto_respond(err.node, original);
            }
        }
        id
    }

    /// Synthesize the local reply a departed node can no longer send.
    fn auto_respond(&self, node: NodeId, original: Message) {
        let body = match original.body {
            MessageBody::Inv { line, .. } => MessageBody::InvAck { line },
            MessageBody::Get { line } | MessageBody::GetX { line } => MessageBody::ChangedOwner {
                line,
                new_owner: NO_NODE,
                certain: false,
            },
            _ => return,
        };
        self.deliver_local(Message {
            from: node,
            to: Destination::Node(self.my_node),
            id: 0,
            in_reply_to: Some(original.id),
            body,
        });
    }

    /// Deliver a message to ourselves. Re-entrant deliveries (the thread
    /// is already inside a dispatch) are parked and drained after the
    /// outermost dispatch returns, preserving outermost-first order.
    fn deliver_local(&self, msg: Message) {
        if self.threads.depth() > 0 {
            self.threads.park(msg);
        } else {
            self.with_dispatch(|| self.route_message(msg));
        }
    }

    /// Run `f` as a dispatch: while it runs, self-addressed deliveries
    /// park; on outermost return the parked queue is drained.
    pub(crate) fn with_dispatch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.threads.enter();
        let result = f();
        if self.threads.leave() {
            while let Some(msg) = self.threads.unpark() {
                self.threads.enter();
                self.route_message(msg);
                self.threads.leave();
            }
            self.threads.forget();
        }
        result
    }

    // ------------------------------------------------------------------
    // Listener plumbing
    // ------------------------------------------------------------------

    fn fire_effects(&self, eff: Effects) {
        for event in eff.events {
            self.fire_event(event);
        }
        if eff.check_eviction {
            self.evict_overflow();
        }
    }

    fn fire_event(&self, event: ListenerEvent) {
        let line_listener = event.line_listener().cloned();
        let global: Vec<Arc<dyn CacheListener>> = self.listeners.read().clone();
        for listener in line_listener.iter().chain(global.iter()) {
            let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
                ListenerEvent::Invalidated { id, .. } => listener.invalidated(*id),
                ListenerEvent::Received {
                    id, version, data, ..
                } => listener.received(*id, *version, data.as_deref()),
                ListenerEvent::Evicted { id, .. } => listener.evicted(*id),
                ListenerEvent::Message { id, data, .. } => listener.message_received(*id, data),
            }));
            if outcome.is_err() {
                warn!("cache listener panicked; event dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Shrink the shared table back under its weighted capacity. Runs
    /// with no line lock held; victims are locked one at a time.
    fn evict_overflow(&self) {
        let mut skipped = Vec::new();
        while let Some((id, line, weight)) = self.table.pop_victim() {
            let mut eff = Effects::new();
            {
                let mut inner = line.lock();
                if inner.is_locked() || inner.state.is_owned() || self.pending.has_ops(id) {
                    // Raced with a promotion or has waiters; put it back.
                    drop(inner);
                    skipped.push((id, line, weight));
                    continue;
                }
                trace!("line {id}: evicted (weight {weight})");
                if inner.state == LineState::Shared && inner.owner >= 0 {
                    self.transmit(
                        Destination::Node(inner.owner),
                        None,
                        MessageBody::InvAck { line: id },
                    );
                }
                if let Some(buf) = inner.data.take() {
                    self.storage.deallocate(id, buf);
                }
                self.pending.drop_messages(id);
                eff.events.push(ListenerEvent::Evicted {
                    id,
                    line_listener: inner.listener.take(),
                });
                inner.destroyed = true;
                self.monitor.line_evicted(weight);
            }
            self.maybe_recycle(&line);
            self.fire_effects(eff);
        }
        for (id, line, weight) in skipped {
            self.table.insert_shared(id, line, weight);
        }
    }
}

// ----------------------------------------------------------------------
// Effects: listener events and follow-up work accumulated under a line
// lock, executed after it is released.
// ----------------------------------------------------------------------

pub(crate) struct Effects {
    events: Vec<ListenerEvent>,
    check_eviction: bool,
}

impl Effects {
    pub(crate) fn new() -> Self {
        Self {
            events: Vec::new(),
            check_eviction: false,
        }
    }

    pub(crate) fn invalidated(&mut self, inner: &LineInner) {
        self.events.push(ListenerEvent::Invalidated {
            id: inner.id,
            line_listener: inner.listener.clone(),
        });
    }

    pub(crate) fn received(&mut self, inner: &LineInner) {
        self.events.push(ListenerEvent::Received {
            id: inner.id,
            version: inner.version,
            data: inner.data.as_ref().map(|d| d.to_vec()),
            line_listener: inner.listener.clone(),
        });
    }

    pub(crate) fn message(&mut self, inner: &LineInner, data: Vec<u8>) {
        self.events.push(ListenerEvent::Message {
            id: inner.id,
            data,
            line_listener: inner.listener.clone(),
        });
    }
}

enum ListenerEvent {
    Invalidated {
        id: LineId,
        line_listener: Option<Arc<dyn CacheListener>>,
    },
    Received {
        id: LineId,
        version: Version,
        data: Option<Vec<u8>>,
        line_listener: Option<Arc<dyn CacheListener>>,
    },
    Evicted {
        id: LineId,
        line_listener: Option<Arc<dyn CacheListener>>,
    },
    Message {
        id: LineId,
        data: Vec<u8>,
        line_listener: Option<Arc<dyn CacheListener>>,
    },
}

impl ListenerEvent {
    fn line_listener(&self) -> Option<&Arc<dyn CacheListener>> {
        match self {
            ListenerEvent::Invalidated { line_listener, .. }
            | ListenerEvent::Received { line_listener, .. }
            | ListenerEvent::Evicted { line_listener, .. }
            | ListenerEvent::Message { line_listener, .. } => line_listener.as_ref(),
        }
    }
}

// ----------------------------------------------------------------------
// Per-thread dispatch state: reentrancy depth, parked self-deliveries,
// and the node-event sweep flag. Carried on the engine instance rather
// than in true globals so independent engines in one process (and one
// thread) never interfere.
// ----------------------------------------------------------------------

#[derive(Default)]
struct ThreadStates {
    depth: DashMap<ThreadId, usize>,
    parked: DashMap<ThreadId, VecDeque<Message>>,
    in_event: DashMap<ThreadId, ()>,
}

impl ThreadStates {
    fn enter(&self) {
        *self.depth.entry(thread::current().id()).or_insert(0) += 1;
    }

    /// Returns true when the outermost dispatch just ended.
    fn leave(&self) -> bool {
        let tid = thread::current().id();
        let mut entry = match self.depth.get_mut(&tid) {
            Some(entry) => entry,
            None => return false,
        };
        *entry = entry.saturating_sub(1);
        *entry == 0
    }

    fn depth(&self) -> usize {
        self.depth
            .get(&thread::current().id())
            .map_or(0, |d| *d)
    }

    fn park(&self, msg: Message) {
        self.parked
            .entry(thread::current().id())
            .or_default()
            .push_back(msg);
    }

    fn unpark(&self) -> Option<Message> {
        self.parked
            .get_mut(&thread::current().id())
            .and_then(|mut q| q.pop_front())
    }

    /// Drop this thread's bookkeeping once it is idle.
    fn forget(&self) {
        let tid = thread::current().id();
        self.depth.remove_if(&tid, |_, depth| *depth == 0);
        self.parked.remove_if(&tid, |_, q| q.is_empty());
    }

    fn set_in_event(&self, active: bool) {
        let tid = thread::current().id();
        if active {
            self.in_event.insert(tid, ());
        } else {
            self.in_event.remove(&tid);
        }
    }

    fn in_event(&self) -> bool {
        self.in_event.contains_key(&thread::current().id())
    }
}
