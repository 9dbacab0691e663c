use crate::error::NodeNotFound;
use crate::message::Message;

/// The wire transport.
///
/// Implementations deliver inbound messages by calling
/// [`Cache::receive`](crate::Cache::receive), preserving per-sender send
/// order, and report a departed target synchronously through
/// [`NodeNotFound`] — the engine then synthesizes the documented local
/// auto-response and carries on.
pub trait Comm: Send + Sync {
    fn send(&self, msg: Message) -> Result<(), NodeNotFound>;

    /// When true, broadcasts are routed to the server node instead of
    /// multicast, and the server's INVACK closes an invalidation round.
    fn is_send_to_server_instead_of_multicast(&self) -> bool {
        false
    }
}
