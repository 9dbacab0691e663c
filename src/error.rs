use thiserror::Error;

use crate::types::{LineId, NodeId};

/// Errors returned to callers of cache operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The operation did not complete within the configured timeout
    #[error("operation on line {id} timed out after {timeout_ms} ms")]
    Timeout { id: LineId, timeout_ms: u64 },

    /// The target id is deleted or was never allocated at the directory
    #[error("line {id} was deleted or never existed at the directory")]
    RefNotFound { id: LineId },

    /// The local node is in slave role; only listen() is permitted
    #[error("node is in slave role; only listen() is permitted until it becomes master")]
    NotMaster,

    /// The payload exceeds the configured maximum item size
    #[error("payload of {size} bytes exceeds max_item_size of {max} bytes")]
    SizeExceeded { size: usize, max: usize },
}

/// Errors raised when constructing a [`Cache`](crate::Cache) from a
/// [`CacheConfig`](crate::CacheConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Synchronous (non-dirty-read) mode is declared but not implemented
    #[error("synchronous mode is not implemented; unset CacheConfig::synchronous")]
    SynchronousUnsupported,

    /// max_item_size must hold at least one byte
    #[error("max_item_size must be greater than zero")]
    ZeroItemSize,

    /// max_capacity must admit at least one maximum-size item
    #[error("max_capacity of {capacity} cannot hold a single item of max_item_size {max_item_size}")]
    CapacityTooSmall { capacity: u64, max_item_size: usize },
}

/// Raised synchronously by the transport when a target node has departed
/// the cluster. The core responds by synthesizing a local auto-response;
/// this error never reaches operation callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("node {node} is not reachable (departed the cluster)")]
pub struct NodeNotFound {
    pub node: NodeId,
}
