use crate::types::NodeId;

/// View of cluster membership and of the local node's role.
///
/// Membership change notifications arrive through
/// [`Cache::node_added`](crate::Cache::node_added),
/// [`Cache::node_removed`](crate::Cache::node_removed) and
/// [`Cache::node_switched`](crate::Cache::node_switched), driven by the
/// host's membership service.
pub trait Cluster: Send + Sync {
    fn my_node_id(&self) -> NodeId;

    /// Whether the local node currently holds the master role of its
    /// master/slave pair. Slaves reject every operation except listen().
    fn is_master(&self) -> bool;

    /// The master node of the pair `node` belongs to, if known.
    fn get_master(&self, node: NodeId) -> Option<NodeId>;

    fn is_member(&self, node: NodeId) -> bool;

    /// Whether the cluster runs a directory (server) node.
    fn has_server(&self) -> bool;
}
