//! Cluster membership changes: when a node dies or fails over to its
//! slave, every line that referenced it is demoted, retargeted, or
//! completed, and work queued against it is cancelled.

use log::{debug, info};

use crate::line::{LineInner, LineState};
use crate::monitor::DrainReason;
use crate::types::{NodeId, NO_NODE, SERVER};

use super::{Cache, Effects};

#[derive(Clone, Copy, Debug)]
pub(crate) struct NodeEvent {
    pub node: NodeId,
    pub switched: bool,
}

impl Cache {
    pub fn node_added(&self, node: NodeId) {
        debug!("node {node} joined");
    }

    /// A node left the cluster. Sweep every line it owned or shared.
    pub fn node_removed(&self, node: NodeId) {
        info!("node {node} removed; sweeping lines");
        self.process_node_event(NodeEvent {
            node,
            switched: false,
        });
    }

    /// A master failed over to its slave. As node_removed, but dirty
    /// reads from the node are forbidden for the duration of the sweep
    /// and stamps from before it stay dead afterwards.
    pub fn node_switched(&self, node: NodeId) {
        info!("node {node} switched to its slave; sweeping lines");
        self.process_node_event(NodeEvent {
            node,
            switched: true,
        });
    }

    fn process_node_event(&self, event: NodeEvent) {
        if event.switched {
            self.dirty.suspend(event.node);
        }
        self.node_events.insert(event.node, event);
        self.threads.set_in_event(true);
        self.with_dispatch(|| {
            self.pending.drop_messages_from(event.node);
            for line in self.table.all_lines() {
                self.with_line_mut(&line, |cache, inner, eff| {
                    cache.apply_node_event(inner, event, eff);
                });
            }
        });
        self.threads.set_in_event(false);
        self.node_events.remove(&event.node);
        if event.switched {
            self.dirty.resume(event.node);
        }
    }

    /// Catch a line up with sweeps still in progress before dispatching
    /// against it. The in-event flag keeps the sweep itself out.
    pub(super) fn apply_registered_events(&self, inner: &mut LineInner, eff: &mut Effects) {
        if self.node_events.is_empty() || self.threads.in_event() {
            return;
        }
        let events: Vec<NodeEvent> = self.node_events.iter().map(|e| *e.value()).collect();
        for event in events {
            self.apply_node_event(inner, event, eff);
        }
    }

    // Idempotent: applying the same event twice leaves the line alone.
    fn apply_node_event(&self, inner: &mut LineInner, event: NodeEvent, eff: &mut Effects) {
        if inner.destroyed {
            return;
        }
        let node = event.node;
        if inner.state < LineState::Owned && inner.owner == node {
            inner.next_state = None;
            self.set_line_state(inner, eff, LineState::Invalid);
            inner.owner = if self.has_server { SERVER } else { NO_NODE };
            inner.owner_clock = 0;
            self.line_changed(inner, eff, DrainReason::StateChanged);
        } else if inner.state.is_owned() && inner.has_sharer(node) {
            if let Some(sharers) = inner.sharers.as_mut() {
                sharers.remove(&node);
            }
            if inner.sharer_count() == 0
                && (inner.state == LineState::Owned || inner.deleted)
            {
                self.complete_ownership(inner, eff);
            }
            self.line_changed(inner, eff, DrainReason::StateChanged);
        }
    }
}
