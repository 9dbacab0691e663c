//! Size bounds, reserved ids, write idempotence, allocation runs, and
//! weighted eviction of the shared table.

use std::sync::atomic::Ordering;

use crate::error::CacheError;
use crate::line::LineState;
use crate::message::MessageBody;

use super::{test_config, wire, Rig};

#[test]
fn writes_at_the_size_bound_pass_and_beyond_it_fail() {
    let rig = Rig::new(&[1], false);
    let a = rig.node(1);

    let exact = vec![0u8; 1024];
    let (id, _) = a.put(&exact, None).expect("max_item_size bytes fit");

    let over = vec![0u8; 1025];
    assert_eq!(
        a.put(&over, None).expect_err("one byte too many"),
        CacheError::SizeExceeded {
            size: 1025,
            max: 1024
        }
    );
    assert_eq!(
        a.set(id, &over, None).expect_err("set is bounded too"),
        CacheError::SizeExceeded {
            size: 1025,
            max: 1024
        }
    );
}

#[test]
fn deleting_a_reserved_id_reestablishes_exclusive() {
    let rig = Rig::new(&[1], false);
    let a = rig.node(1);
    let id = 7; // reserved range

    // Reserved lines arrive well-known; here ownership lands by transfer.
    a.receive(wire(
        9,
        1,
        1,
        MessageBody::PutX {
            line: id,
            sharers: vec![],
            version: 4,
            data: Some(b"root".to_vec().into_boxed_slice()),
        },
    ));
    assert_eq!(a.probe(id).expect("line").state, LineState::Exclusive);

    a.del(id, None).expect("reserved delete");
    let probe = a.probe(id).expect("line survives");
    assert_eq!(probe.state, LineState::Exclusive);
    assert!(!probe.deleted);
    assert_eq!(probe.data, None);

    // And it is immediately writable again.
    let version = a.set(id, b"fresh", None).expect("set after del");
    assert!(version > 4);
    assert_eq!(
        a.get(id).expect("get").data.as_deref(),
        Some(&b"fresh"[..])
    );
}

#[test]
fn identical_writes_do_not_advance_the_version() {
    let rig = Rig::new(&[1], false);
    let a = rig.node(1);
    let (id, v1) = a.put(b"same", None).expect("put");
    assert_eq!(v1, 1);

    assert_eq!(a.set(id, b"next", None).expect("real write"), 2);
    assert_eq!(a.set(id, b"next", None).expect("identical write"), 2);
    assert_eq!(a.set(id, b"other", None).expect("different write"), 3);
}

#[test]
fn alloc_returns_a_run_of_owned_exclusive_lines() {
    let rig = Rig::new(&[1], false);
    let a = rig.node(1);
    let first = a.alloc(4, None).expect("alloc");

    for id in first..first + 4 {
        let probe = a.probe(id).expect("allocated line");
        assert_eq!(probe.state, LineState::Exclusive);
        assert_eq!(probe.owner, 1);
        assert_eq!(probe.version, 0);
        assert_eq!(probe.data, None);
    }
    assert!(a.probe(first + 4).is_none());
}

#[test]
fn shared_table_evicts_by_weight_and_acknowledges_the_owner() {
    let mut config = test_config();
    config.max_item_size = 16;
    config.max_capacity = 40;
    let rig = Rig::with_config(&[2], false, config);
    let b = rig.node(2);

    let base = 0x1_0000_0050u64;
    for n in 0..3u64 {
        b.receive(wire(
            9,
            2,
            10 + n,
            MessageBody::Put {
                line: base + n,
                version: 1,
                data: Some(vec![n as u8; 16].into_boxed_slice()),
            },
        ));
    }

    // Three 17-weight lines exceed the 40-unit budget: the coldest goes.
    assert!(b.probe(base).is_none(), "first line evicted");
    assert!(b.probe(base + 1).is_some());
    assert!(b.probe(base + 2).is_some());
    assert_eq!(rig.monitors[&2].evictions.load(Ordering::Relaxed), 1);

    let acked = rig.net.queued().into_iter().any(|m| {
        matches!(m.to, crate::message::Destination::Node(9))
            && matches!(m.body, MessageBody::InvAck { line } if line == base)
    });
    assert!(acked, "eviction of a shared line INVACKs its owner");
}

#[test]
fn owned_lines_are_never_evicted() {
    let mut config = test_config();
    config.max_item_size = 16;
    config.max_capacity = 40;
    let rig = Rig::with_config(&[1], false, config);
    let a = rig.node(1);

    // Owned lines do not count against the shared budget.
    let mut ids = Vec::new();
    for n in 0..8 {
        ids.push(a.put(&vec![n as u8; 16], None).expect("put").0);
    }
    for id in ids {
        assert!(a.probe(id).is_some(), "owned line survived");
    }
}

#[test]
fn unanswered_fetch_times_out() {
    let mut config = test_config();
    config.timeout = std::time::Duration::from_millis(50);
    let rig = Rig::with_config(&[1], false, config);
    let a = rig.node(1);

    let a2 = a.clone();
    let err = rig
        .run(move || a2.get(0x1_0000_0060))
        .expect_err("nobody answers");
    assert!(matches!(err, CacheError::Timeout { .. }));
    assert_eq!(rig.monitors[&1].timeouts.load(Ordering::Relaxed), 1);
}

struct GatedAllocator {
    open: std::sync::atomic::AtomicBool,
    next: std::sync::atomic::AtomicU64,
}

impl crate::allocator::IdAllocator for GatedAllocator {
    fn allocate_ids(&self, count: usize) -> crate::allocator::Allocation {
        if self.open.load(Ordering::Relaxed) {
            crate::allocator::Allocation::Ready(
                self.next.fetch_add(count as u64, Ordering::Relaxed),
            )
        } else {
            crate::allocator::Allocation::Pending
        }
    }
}

#[test]
fn put_waits_until_the_id_allocator_recovers() {
    let allocator = std::sync::Arc::new(GatedAllocator {
        open: std::sync::atomic::AtomicBool::new(false),
        next: std::sync::atomic::AtomicU64::new(0x2_0000_0000),
    });
    let net = super::TestNet::new();
    let cache = crate::cache::Cache::new(
        test_config(),
        std::sync::Arc::new(super::TestCluster {
            me: 1,
            master: std::sync::atomic::AtomicBool::new(true),
            server: false,
        }),
        std::sync::Arc::new(super::NodeComm { net }),
        std::sync::Arc::new(crate::backup::NoBackup),
        std::sync::Arc::new(crate::storage::HeapStorage::new()),
        allocator.clone(),
    )
    .expect("valid config");

    let c2 = cache.clone();
    let handle = std::thread::spawn(move || c2.put(b"later", None));
    super::wait_until(|| !cache.alloc_waiters.lock().is_empty());

    allocator.open.store(true, Ordering::Relaxed);
    cache.id_allocator_ready();

    let (id, version) = handle.join().expect("op thread").expect("put succeeded");
    assert_eq!(version, 1);
    let item = cache.get(id).expect("stored after recovery");
    assert_eq!(item.data.as_deref(), Some(&b"later"[..]));
}
