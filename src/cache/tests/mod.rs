//! In-process cluster rig: real engines wired through a queued transport
//! the tests pump explicitly, so message interleavings stay under test
//! control.

mod boundaries;
mod listeners;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::allocator::SequentialIdAllocator;
use crate::backup::Backup;
use crate::cluster::Cluster;
use crate::comm::Comm;
use crate::config::CacheConfig;
use crate::error::NodeNotFound;
use crate::line::LineState;
use crate::message::{Destination, Message, MessageBody};
use crate::monitor::CountingMonitor;
use crate::storage::HeapStorage;
use crate::types::{LineId, MsgId, NodeId, Version, SERVER};

use super::Cache;

pub(crate) fn wire(from: NodeId, to: NodeId, id: MsgId, body: MessageBody) -> Message {
    Message {
        from,
        to: Destination::Node(to),
        id,
        in_reply_to: None,
        body,
    }
}

// ----------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------

pub(crate) struct TestNet {
    queue: Mutex<VecDeque<Message>>,
    dead: Mutex<HashSet<NodeId>>,
    server_inbox: Mutex<Vec<Message>>,
    msg_ids: AtomicU64,
    pub route_via_server: AtomicBool,
}

impl TestNet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            dead: Mutex::new(HashSet::new()),
            server_inbox: Mutex::new(Vec::new()),
            msg_ids: AtomicU64::new(1_000),
            route_via_server: AtomicBool::new(false),
        })
    }

    pub(crate) fn kill(&self, node: NodeId) {
        self.dead.lock().insert(node);
    }

    pub(crate) fn sent_to_server(&self) -> Vec<Message> {
        self.server_inbox.lock().clone()
    }

    pub(crate) fn queued(&self) -> Vec<Message> {
        self.queue.lock().iter().cloned().collect()
    }

    fn push(&self, msg: Message) {
        self.queue.lock().push_back(msg);
    }
}

struct NodeComm {
    net: Arc<TestNet>,
}

impl Comm for NodeComm {
    fn send(&self, msg: Message) -> Result<(), NodeNotFound> {
        if let Destination::Node(node) = msg.to {
            if self.net.dead.lock().contains(&node) {
                return Err(NodeNotFound { node });
            }
        }
        self.net.push(msg);
        Ok(())
    }

    fn is_send_to_server_instead_of_multicast(&self) -> bool {
        self.net.route_via_server.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------
// Cluster view
// ----------------------------------------------------------------------

pub(crate) struct TestCluster {
    me: NodeId,
    master: AtomicBool,
    server: bool,
}

impl Cluster for TestCluster {
    fn my_node_id(&self) -> NodeId {
        self.me
    }

    fn is_master(&self) -> bool {
        self.master.load(Ordering::Relaxed)
    }

    fn get_master(&self, _node: NodeId) -> Option<NodeId> {
        None
    }

    fn is_member(&self, node: NodeId) -> bool {
        node >= 0
    }

    fn has_server(&self) -> bool {
        self.server
    }
}

// ----------------------------------------------------------------------
// Backup channel
// ----------------------------------------------------------------------

pub(crate) struct TestBackup {
    net: Arc<TestNet>,
    master: NodeId,
    slave_node: NodeId,
    attached: bool,
    pub backups: Mutex<Vec<(LineId, Version)>>,
    pub invs: Mutex<Vec<(LineId, NodeId)>>,
    pub flushes: AtomicU64,
    pub inv_ok: AtomicBool,
}

impl Backup for TestBackup {
    fn has_slave(&self) -> bool {
        self.attached
    }

    fn backup(&self, id: LineId, version: Version) {
        self.backups.lock().push((id, version));
        if self.attached {
            // The slave acknowledges through the ordinary receive path.
            let msg_id = self.net.msg_ids.fetch_add(1, Ordering::Relaxed);
            self.net.push(wire(
                self.slave_node,
                self.master,
                msg_id,
                MessageBody::BackupAck { line: id, version },
            ));
        }
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn inv(&self, id: LineId, sharer: NodeId) -> bool {
        self.invs.lock().push((id, sharer));
        self.inv_ok.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------
// The rig
// ----------------------------------------------------------------------

pub(crate) struct Rig {
    pub net: Arc<TestNet>,
    pub nodes: BTreeMap<NodeId, Arc<Cache>>,
    pub backups: BTreeMap<NodeId, Arc<TestBackup>>,
    pub clusters: BTreeMap<NodeId, Arc<TestCluster>>,
    pub monitors: BTreeMap<NodeId, Arc<CountingMonitor>>,
}

pub(crate) fn test_config() -> CacheConfig {
    CacheConfig {
        timeout: Duration::from_secs(2),
        ..CacheConfig::default()
    }
}

impl Rig {
    pub(crate) fn new(ids: &[NodeId], server: bool) -> Self {
        Self::build(ids, server, test_config(), false)
    }

    pub(crate) fn with_config(ids: &[NodeId], server: bool, config: CacheConfig) -> Self {
        Self::build(ids, server, config, false)
    }

    pub(crate) fn with_slaves(ids: &[NodeId], server: bool) -> Self {
        Self::build(ids, server, test_config(), true)
    }

    fn build(ids: &[NodeId], server: bool, config: CacheConfig, slaves: bool) -> Self {
        let net = TestNet::new();
        let mut nodes = BTreeMap::new();
        let mut backups = BTreeMap::new();
        let mut clusters = BTreeMap::new();
        let mut monitors = BTreeMap::new();
        for &id in ids {
            let cluster = Arc::new(TestCluster {
                me: id,
                master: AtomicBool::new(true),
                server,
            });
            let backup = Arc::new(TestBackup {
                net: net.clone(),
                master: id,
                slave_node: id + 100,
                attached: slaves,
                backups: Mutex::new(Vec::new()),
                invs: Mutex::new(Vec::new()),
                flushes: AtomicU64::new(0),
                inv_ok: AtomicBool::new(true),
            });
            let monitor = Arc::new(CountingMonitor::new());
            let cache = Cache::with_monitor(
                config.clone(),
                cluster.clone(),
                Arc::new(NodeComm { net: net.clone() }),
                backup.clone(),
                Arc::new(HeapStorage::new()),
                Arc::new(SequentialIdAllocator::new()),
                monitor.clone(),
            )
            .expect("valid test config");
            nodes.insert(id, cache);
            backups.insert(id, backup);
            clusters.insert(id, cluster);
            monitors.insert(id, monitor);
        }
        Self {
            net,
            nodes,
            backups,
            clusters,
            monitors,
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> Arc<Cache> {
        self.nodes[&id].clone()
    }

    /// Deliver everything currently queued. Returns how many messages
    /// moved.
    pub(crate) fn pump(&self) -> usize {
        let mut moved = 0;
        loop {
            let Some(msg) = self.net.queue.lock().pop_front() else {
                return moved;
            };
            moved += 1;
            match msg.to {
                Destination::Node(SERVER) if !self.nodes.contains_key(&SERVER) => {
                    self.net.server_inbox.lock().push(msg);
                }
                Destination::Node(target) => {
                    if let Some(cache) = self.nodes.get(&target) {
                        cache.receive(msg);
                    }
                }
                Destination::Broadcast => {
                    for (&id, cache) in &self.nodes {
                        if id != msg.from {
                            cache.receive(msg.clone());
                        }
                    }
                }
            }
        }
    }

    /// Run a blocking operation on its own thread while this thread pumps
    /// the network.
    pub(crate) fn run<R: Send + 'static>(
        &self,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> R {
        self.join(std::thread::spawn(f))
    }

    pub(crate) fn join<R>(&self, handle: JoinHandle<R>) -> R {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() {
            if self.pump() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(
                Instant::now() < deadline,
                "blocked operation did not complete"
            );
        }
        handle.join().expect("operation thread panicked")
    }
}

/// Wait for a condition reached by another thread, without pumping.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ----------------------------------------------------------------------
// Line inspection
// ----------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Probe {
    pub state: LineState,
    pub next_state: Option<LineState>,
    pub owner: NodeId,
    pub sharers: Vec<NodeId>,
    pub version: Version,
    pub owner_clock: i64,
    pub data: Option<Vec<u8>>,
    pub locked: bool,
    pub modified: bool,
    pub slave: bool,
    pub deleted: bool,
}

impl Cache {
    pub(crate) fn probe(&self, id: LineId) -> Option<Probe> {
        let line = self.lookup_line(id)?;
        let inner = line.lock();
        if inner.destroyed {
            return None;
        }
        let mut sharers: Vec<NodeId> = inner
            .sharers
            .as_ref()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sharers.sort_unstable();
        Some(Probe {
            state: inner.state,
            next_state: inner.next_state,
            owner: inner.owner,
            sharers,
            version: inner.version,
            owner_clock: inner.owner_clock,
            data: inner.data.as_ref().map(|d| d.to_vec()),
            locked: inner.is_locked(),
            modified: inner.modified,
            slave: inner.slave,
            deleted: inner.deleted,
        })
    }

    pub(crate) fn has_pending_ops(&self, id: LineId) -> bool {
        self.pending.has_ops(id)
    }
}
