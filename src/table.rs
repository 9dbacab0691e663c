//! The two line tables: `owned` (states O/E, unbounded) and `shared`
//! (states I/S, weight-bounded with LRU eviction).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

use crate::line::Line;
use crate::types::{is_reserved, LineId};

pub(crate) struct LineTable {
    owned: DashMap<LineId, Arc<Line>>,
    shared: DashMap<LineId, Arc<Line>>,
    /// Recency order and per-line weight of evictable shared lines.
    /// Reserved ids are pinned: present in `shared`, absent here.
    lru: Mutex<LruCache<LineId, u64>>,
    shared_weight: AtomicU64,
    capacity: u64,
}

impl LineTable {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            owned: DashMap::new(),
            shared: DashMap::new(),
            lru: Mutex::new(LruCache::unbounded()),
            shared_weight: AtomicU64::new(0),
            capacity,
        }
    }

    pub(crate) fn get(&self, id: LineId) -> Option<Arc<Line>> {
        if let Some(line) = self.owned.get(&id) {
            return Some(line.clone());
        }
        let line = self.shared.get(&id).map(|l| l.clone())?;
        self.touch(id);
        Some(line)
    }

    /// Fetch `id`, or admit a fresh record into `shared` at unit weight.
    /// Returns the line and whether this call created it.
    pub(crate) fn get_or_insert_shared(
        &self,
        id: LineId,
        make: impl FnOnce() -> Arc<Line>,
    ) -> (Arc<Line>, bool) {
        if let Some(line) = self.get(id) {
            return (line, false);
        }
        match self.shared.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let line = make();
                entry.insert(line.clone());
                if !is_reserved(id) {
                    self.lru.lock().put(id, 1);
                    self.shared_weight.fetch_add(1, Ordering::Relaxed);
                }
                (line, true)
            }
        }
    }

    pub(crate) fn insert_owned(&self, id: LineId, line: Arc<Line>) {
        self.owned.insert(id, line);
    }

    pub(crate) fn insert_shared(&self, id: LineId, line: Arc<Line>, weight: u64) {
        self.shared.insert(id, line);
        if !is_reserved(id) {
            let mut lru = self.lru.lock();
            if let Some(old) = lru.put(id, weight) {
                self.shared_weight.fetch_sub(old, Ordering::Relaxed);
            }
            self.shared_weight.fetch_add(weight, Ordering::Relaxed);
        }
    }

    /// Move a line from `shared` to `owned` (sub-O -> O/E transition).
    pub(crate) fn promote(&self, id: LineId) {
        if let Some((_, line)) = self.shared.remove(&id) {
            self.forget_weight(id);
            self.owned.insert(id, line);
        }
    }

    /// Move a line from `owned` to `shared` (O/E -> sub-O transition).
    pub(crate) fn demote(&self, id: LineId, weight: u64) {
        if let Some((_, line)) = self.owned.remove(&id) {
            self.insert_shared(id, line, weight);
        }
    }

    /// Re-weigh a shared line after its data changed.
    pub(crate) fn update_weight(&self, id: LineId, weight: u64) {
        if is_reserved(id) || !self.shared.contains_key(&id) {
            return;
        }
        let mut lru = self.lru.lock();
        if let Some(entry) = lru.get_mut(&id) {
            let old = std::mem::replace(entry, weight);
            self.shared_weight.fetch_sub(old, Ordering::Relaxed);
            self.shared_weight.fetch_add(weight, Ordering::Relaxed);
        }
    }

    pub(crate) fn remove(&self, id: LineId) -> Option<Arc<Line>> {
        if let Some((_, line)) = self.owned.remove(&id) {
            return Some(line);
        }
        let (_, line) = self.shared.remove(&id)?;
        self.forget_weight(id);
        Some(line)
    }

    fn touch(&self, id: LineId) {
        self.lru.lock().promote(&id);
    }

    fn forget_weight(&self, id: LineId) {
        if let Some(weight) = self.lru.lock().pop(&id) {
            self.shared_weight.fetch_sub(weight, Ordering::Relaxed);
        }
    }

    pub(crate) fn over_capacity(&self) -> bool {
        self.shared_weight.load(Ordering::Relaxed) > self.capacity
    }

    /// Pop the least-recently-used shared line while over capacity.
    /// Returns the removed line; the caller performs the eviction
    /// protocol (INVACK, listeners, storage release).
    pub(crate) fn pop_victim(&self) -> Option<(LineId, Arc<Line>, u64)> {
        loop {
            if !self.over_capacity() {
                return None;
            }
            let (id, weight) = self.lru.lock().pop_lru()?;
            self.shared_weight.fetch_sub(weight, Ordering::Relaxed);
            match self.shared.remove(&id) {
                Some((_, line)) => return Some((id, line, weight)),
                // Raced with a promote; weight was already forgotten.
                None => continue,
            }
        }
    }

    /// Snapshot of every live line, for node-event sweeps.
    pub(crate) fn all_lines(&self) -> Vec<Arc<Line>> {
        let mut lines: Vec<Arc<Line>> =
            self.owned.iter().map(|e| e.value().clone()).collect();
        lines.extend(self.shared.iter().map(|e| e.value().clone()));
        lines
    }

    #[cfg(test)]
    pub(crate) fn shared_weight(&self) -> u64 {
        self.shared_weight.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_follows_migrations() {
        let table = LineTable::new(100);
        let id = 0x1_0000_0000;
        table.insert_shared(id, Line::new(id), 10);
        assert_eq!(table.shared_weight(), 10);
        table.promote(id);
        assert_eq!(table.shared_weight(), 0);
        table.demote(id, 25);
        assert_eq!(table.shared_weight(), 25);
        table.remove(id);
        assert_eq!(table.shared_weight(), 0);
    }

    #[test]
    fn reserved_ids_are_pinned() {
        let table = LineTable::new(2);
        table.insert_shared(7, Line::new(7), 1000);
        assert!(!table.over_capacity());
        assert!(table.pop_victim().is_none());
        assert!(table.get(7).is_some());
    }

    #[test]
    fn lru_order_picks_the_coldest_line() {
        let table = LineTable::new(25);
        let a = 0x1_0000_0000;
        let b = 0x1_0000_0001;
        table.insert_shared(a, Line::new(a), 10);
        table.insert_shared(b, Line::new(b), 10);
        // Touch `a` so `b` is the coldest.
        table.get(a);
        table.insert_shared(0x1_0000_0002, Line::new(0x1_0000_0002), 10);
        let (victim, _, _) = table.pop_victim().expect("over capacity");
        assert_eq!(victim, b);
        assert!(!table.over_capacity());
    }
}
