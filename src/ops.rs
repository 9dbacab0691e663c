use std::sync::Arc;

use crossbeam_channel::Sender;
use log::trace;

use crate::error::CacheError;
use crate::listener::CacheListener;
use crate::transaction::TxnShared;
use crate::types::{LineId, MsgId, NodeId, Version, NO_NODE};

/// The closed set of local operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Read, possibly from provably-safe stale data.
    Get,
    /// Read and lock under a transaction (acquires ownership first).
    GetShared,
    /// Read exclusively and lock under a transaction.
    GetExclusive,
    /// Write; requires exclusive state.
    Set,
    /// Delete; requires exclusive state.
    Del,
    /// Proactively replicate to a set of nodes.
    Push,
    /// Transfer ownership to another node.
    PushExclusive,
    /// Deliver an application message to the line's owner.
    Send,
    /// Install a per-line listener.
    Listen,
    /// Allocate an id and store a fresh item.
    Put,
    /// Allocate a run of consecutive ids.
    Alloc,
}

impl OpKind {
    /// Ops that take the line's transaction lock.
    pub(crate) fn is_locking(self) -> bool {
        matches!(
            self,
            OpKind::GetShared | OpKind::GetExclusive | OpKind::Set | OpKind::Del
        )
    }

    pub(crate) fn is_push(self) -> bool {
        matches!(self, OpKind::Push | OpKind::PushExclusive)
    }
}

/// Successful outcome of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpResult {
    /// Line content, from GET/GETS/GETX.
    Data {
        version: Version,
        data: Option<Vec<u8>>,
    },
    /// Id and version of a freshly stored item.
    Stored { id: LineId, version: Version },
    /// A run of consecutive ids, all exclusively owned locally.
    Allocated { first_id: LineId, count: usize },
    /// Version after a write.
    Version(Version),
    Done,
}

/// Whether an operation resolved or must wait for the line to change.
pub(crate) enum OpOutcome {
    Ready(OpResult),
    Pending,
}

/// A deferred operation record. Holds the line by id, not by pointer, so
/// node-event sweeps and evictions can invalidate queued work safely; the
/// line table is consulted again on every processing step.
pub(crate) struct Op {
    pub kind: OpKind,
    pub line: LineId,
    pub data: Option<Box<[u8]>>,
    /// PUSH targets, or the single PUSHX transferee.
    pub nodes: Vec<NodeId>,
    /// ALLOC run length.
    pub count: usize,
    pub node_hint: NodeId,
    pub listener: Option<Arc<dyn CacheListener>>,
    pub txn: Option<Arc<TxnShared>>,
    /// Message id of the in-flight MSG a SEND is waiting on.
    pub msg_id: Option<MsgId>,
    /// One-shot future; absent while the op is still on the fast track.
    pub completion: Option<Sender<Result<OpResult, CacheError>>>,
}

impl Op {
    pub(crate) fn new(kind: OpKind, line: LineId) -> Self {
        Self {
            kind,
            line,
            data: None,
            nodes: Vec::new(),
            count: 0,
            node_hint: NO_NODE,
            listener: None,
            txn: None,
            msg_id: None,
            completion: None,
        }
    }

    /// Resolve the op's future. Errors are also recorded on the owning
    /// transaction so commit can re-raise the first of them.
    pub(crate) fn complete(&mut self, result: Result<OpResult, CacheError>) {
        if let (Some(txn), Err(err)) = (&self.txn, &result) {
            txn.push_error(err.clone());
        }
        if let Some(completion) = self.completion.take() {
            // The waiter may have timed out and gone; that is fine.
            if completion.send(result).is_err() {
                trace!("op {:?} on line {} completed after its waiter left", self.kind, self.line);
            }
        }
    }
}
