use crate::types::{LineId, Version};

/// Callback sink for line events.
///
/// Installable per line through [`Cache::listen`](crate::Cache::listen) and
/// process-wide through [`Cache::add_listener`](crate::Cache::add_listener).
/// Panics from listeners are caught and logged; they never disturb the
/// coherence protocol.
pub trait CacheListener: Send + Sync {
    /// The local replica of `id` was invalidated by its owner.
    fn invalidated(&self, id: LineId) {
        let _ = id;
    }

    /// Fresh data for `id` arrived from its owner.
    fn received(&self, id: LineId, version: Version, data: Option<&[u8]>) {
        let _ = (id, version, data);
    }

    /// The local replica of `id` was evicted to bound the shared cache.
    fn evicted(&self, id: LineId) {
        let _ = id;
    }

    /// An application message addressed to `id` was delivered to this
    /// node as the line's owner.
    fn message_received(&self, id: LineId, data: &[u8]) {
        let _ = (id, data);
    }
}
