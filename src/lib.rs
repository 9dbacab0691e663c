//! # Meshcache
//! The per-node coherence engine of a clustered object cache.
//!
//! Each node caches variable-size opaque items ("lines") keyed by 64-bit
//! id; the cluster as a whole keeps them coherent under a directory-based
//! single-writer/multiple-reader protocol. A master/slave pair may back
//! each node so items owned by a failed node can be recovered by its
//! slave.
//!
//! The engine is wired to its surroundings through traits: [`Comm`] moves
//! messages, [`Cluster`] reports membership and roles, [`Backup`] drives
//! the slave channel, [`CacheStorage`] owns payload buffers, and
//! [`IdAllocator`] hands out fresh ids.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod allocator;
mod backup;
mod cache;
mod cluster;
mod comm;
mod config;
mod dirty;
mod error;
mod line;
mod listener;
mod message;
mod monitor;
mod ops;
mod pending;
mod storage;
mod table;
mod transaction;
mod types;

pub use allocator::{Allocation, IdAllocator, SequentialIdAllocator};
pub use backup::{Backup, NoBackup};
pub use cache::{Cache, ItemData};
pub use cluster::Cluster;
pub use comm::Comm;
pub use config::CacheConfig;
pub use error::{CacheError, ConfigError, NodeNotFound};
pub use line::LineState;
pub use listener::CacheListener;
pub use message::{Destination, Message, MessageBody, MessageKind};
pub use monitor::{CacheMonitor, CountingMonitor, DrainReason, NoopMonitor};
pub use ops::{OpKind, OpResult};
pub use storage::{CacheStorage, HeapStorage};
pub use transaction::Transaction;
pub use types::{
    is_reserved, LineId, MsgId, NodeId, Version, MAX_RESERVED_ID, NO_NODE, SERVER,
};
