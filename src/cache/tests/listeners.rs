//! Listener delivery: per-line and process-wide sinks, messenger
//! traffic, and panic isolation.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::line::LineState;
use crate::listener::CacheListener;
use crate::message::MessageBody;
use crate::types::LineId;

use super::{wire, Rig};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl CacheListener for Recorder {
    fn invalidated(&self, id: LineId) {
        self.events.lock().push(format!("inv:{id}"));
    }

    fn received(&self, id: LineId, version: u64, _data: Option<&[u8]>) {
        self.events.lock().push(format!("recv:{id}:v{version}"));
    }

    fn evicted(&self, id: LineId) {
        self.events.lock().push(format!("evict:{id}"));
    }

    fn message_received(&self, id: LineId, data: &[u8]) {
        self.events
            .lock()
            .push(format!("msg:{id}:{}", String::from_utf8_lossy(data)));
    }
}

#[test]
fn line_listener_sees_receives_and_invalidations() {
    let rig = Rig::new(&[2], false);
    let b = rig.node(2);
    let id = 0x1_0000_0040;
    let recorder = Arc::new(Recorder::default());
    b.listen(id, recorder.clone()).expect("listen");

    b.receive(wire(
        9,
        2,
        5,
        MessageBody::Put {
            line: id,
            version: 1,
            data: Some(b"hello".to_vec().into_boxed_slice()),
        },
    ));
    b.receive(wire(
        9,
        2,
        6,
        MessageBody::Inv {
            line: id,
            previous_owner: 9,
        },
    ));

    let events = recorder.events.lock().clone();
    assert_eq!(events, vec![format!("recv:{id}:v1"), format!("inv:{id}")]);
}

#[test]
fn send_reaches_the_owner_listener_and_completes_on_ack() {
    let rig = Rig::new(&[1, 2], false);
    let a = rig.node(1);
    let b = rig.node(2);
    let (id, _) = a.put(b"target", None).expect("put");
    let recorder = Arc::new(Recorder::default());
    a.listen(id, recorder.clone()).expect("listen");

    // B learns who the owner is, then messages it.
    let b2 = b.clone();
    rig.run(move || b2.get(id)).expect("share");
    let b2 = b.clone();
    rig.run(move || b2.send(id, b"ping")).expect("send acked");

    let events = recorder.events.lock().clone();
    assert!(events.contains(&format!("msg:{id}:ping")));
}

#[test]
fn send_by_the_owner_short_circuits_locally() {
    let rig = Rig::new(&[1], false);
    let a = rig.node(1);
    let (id, _) = a.put(b"self", None).expect("put");
    let recorder = Arc::new(Recorder::default());
    a.listen(id, recorder.clone()).expect("listen");

    a.send(id, b"loop").expect("local send");
    assert_eq!(
        recorder.events.lock().clone(),
        vec![format!("msg:{id}:loop")]
    );
}

#[test]
fn process_wide_listener_observes_every_line() {
    let rig = Rig::new(&[2], false);
    let b = rig.node(2);
    let recorder = Arc::new(Recorder::default());
    b.add_listener(recorder.clone());

    b.receive(wire(
        9,
        2,
        5,
        MessageBody::Put {
            line: 0x1_0000_0041,
            version: 1,
            data: None,
        },
    ));
    assert_eq!(
        recorder.events.lock().clone(),
        vec!["recv:4294967361:v1".to_string()]
    );
}

struct Panicker;

impl CacheListener for Panicker {
    fn received(&self, _id: LineId, _version: u64, _data: Option<&[u8]>) {
        panic!("listener bug");
    }
}

#[test]
fn listener_panics_do_not_disturb_the_protocol() {
    let rig = Rig::new(&[2], false);
    let b = rig.node(2);
    let id = 0x1_0000_0042;
    b.listen(id, Arc::new(Panicker)).expect("listen");

    b.receive(wire(
        9,
        2,
        5,
        MessageBody::Put {
            line: id,
            version: 1,
            data: Some(b"boom".to_vec().into_boxed_slice()),
        },
    ));

    let probe = b.probe(id).expect("line survived the listener panic");
    assert_eq!(probe.state, LineState::Shared);
    assert_eq!(probe.version, 1);
}
