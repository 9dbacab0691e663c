use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CacheError;
use crate::types::{LineId, Version};

/// Groups lock-taking operations so they commit or roll back together.
///
/// Obtained from [`Cache::begin_transaction`](crate::Cache::begin_transaction)
/// and consumed by [`Cache::end_transaction`](crate::Cache::end_transaction).
pub struct Transaction {
    pub(crate) shared: Arc<TxnShared>,
}

impl Transaction {
    pub(crate) fn new(rollback_supported: bool) -> Self {
        Self {
            shared: Arc::new(TxnShared {
                rollback_supported,
                lines: Mutex::new(Vec::new()),
                journal: Mutex::new(HashMap::new()),
                errors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Ids of the lines this transaction holds locked, in lock order.
    pub fn locked_lines(&self) -> Vec<LineId> {
        self.shared.lines.lock().clone()
    }
}

pub(crate) struct TxnShared {
    pub rollback_supported: bool,
    lines: Mutex<Vec<LineId>>,
    journal: Mutex<HashMap<LineId, RollbackRecord>>,
    errors: Mutex<Vec<CacheError>>,
}

/// Snapshot taken at the first write to a line within a transaction.
pub(crate) struct RollbackRecord {
    pub version: Version,
    pub modified: bool,
    pub data: Option<Box<[u8]>>,
}

impl TxnShared {
    pub(crate) fn record_lock(&self, id: LineId) {
        let mut lines = self.lines.lock();
        lines.push(id);
    }

    pub(crate) fn take_lines(&self) -> Vec<LineId> {
        std::mem::take(&mut self.lines.lock())
    }

    /// Journal a snapshot unless one exists; only the state before the
    /// transaction's first write matters for rollback.
    pub(crate) fn record_rollback(&self, id: LineId, snapshot: impl FnOnce() -> RollbackRecord) {
        if !self.rollback_supported {
            return;
        }
        let mut journal = self.journal.lock();
        journal.entry(id).or_insert_with(snapshot);
    }

    pub(crate) fn take_journal(&self) -> HashMap<LineId, RollbackRecord> {
        std::mem::take(&mut self.journal.lock())
    }

    pub(crate) fn push_error(&self, err: CacheError) {
        self.errors.lock().push(err);
    }

    pub(crate) fn first_error(&self) -> Option<CacheError> {
        self.errors.lock().first().cloned()
    }
}
