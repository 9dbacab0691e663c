//! Wire-level coherence messages.
//!
//! The transport moves [`Message`] envelopes between nodes and guarantees
//! per-sender FIFO delivery; everything inside the envelope is owned by the
//! coherence engine.

use crate::types::{LineId, MsgId, NodeId, Version};

/// Where an outbound message is headed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Node(NodeId),
    Broadcast,
}

/// A coherence message envelope. `id` is monotonic per sender; replies
/// carry the request's id in `in_reply_to`.
#[derive(Clone, Debug)]
pub struct Message {
    pub from: NodeId,
    pub to: Destination,
    pub id: MsgId,
    pub in_reply_to: Option<MsgId>,
    pub body: MessageBody,
}

#[derive(Clone, Debug)]
pub enum MessageBody {
    /// Request a readable copy of a line from its owner.
    Get { line: LineId },
    /// Request ownership of a line from its owner.
    GetX { line: LineId },
    /// A readable copy, sent by the owner to a new sharer.
    Put {
        line: LineId,
        version: Version,
        data: Option<Box<[u8]>>,
    },
    /// Ownership transfer, carrying the sharer set the new owner must
    /// invalidate.
    PutX {
        line: LineId,
        sharers: Vec<NodeId>,
        version: Version,
        data: Option<Box<[u8]>>,
    },
    /// Invalidate a replica. `previous_owner` routes follow-up traffic
    /// when the sender is not itself the new owner.
    Inv {
        line: LineId,
        previous_owner: NodeId,
    },
    /// Acknowledge an invalidation.
    InvAck { line: LineId },
    /// The line does not exist (deleted, or unknown to the directory).
    NotFound { line: LineId },
    /// Redirect: the line is owned elsewhere.
    ChangedOwner {
        line: LineId,
        new_owner: NodeId,
        certain: bool,
    },
    /// An application-level message routed to the line's owner.
    Msg { line: LineId, data: Box<[u8]> },
    /// Acknowledges delivery of a [`MessageBody::Msg`].
    MsgAck { line: LineId },
    /// Master-to-slave replication of an owned line.
    Backup {
        line: LineId,
        version: Version,
        data: Option<Box<[u8]>>,
    },
    /// Slave acknowledgement of a backup at `version`.
    BackupAck { line: LineId, version: Version },
    /// Transport-generated: fail everything pending on the line.
    Timeout { line: LineId },
    /// Node-level acknowledgement; carries no line.
    Ack,
}

/// Discriminant of a [`MessageBody`], used for routing, holding rules and
/// monitoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Get,
    GetX,
    Put,
    PutX,
    Inv,
    InvAck,
    NotFound,
    ChangedOwner,
    Msg,
    MsgAck,
    Backup,
    BackupAck,
    Timeout,
    Ack,
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Get { .. } => MessageKind::Get,
            MessageBody::GetX { .. } => MessageKind::GetX,
            MessageBody::Put { .. } => MessageKind::Put,
            MessageBody::PutX { .. } => MessageKind::PutX,
            MessageBody::Inv { .. } => MessageKind::Inv,
            MessageBody::InvAck { .. } => MessageKind::InvAck,
            MessageBody::NotFound { .. } => MessageKind::NotFound,
            MessageBody::ChangedOwner { .. } => MessageKind::ChangedOwner,
            MessageBody::Msg { .. } => MessageKind::Msg,
            MessageBody::MsgAck { .. } => MessageKind::MsgAck,
            MessageBody::Backup { .. } => MessageKind::Backup,
            MessageBody::BackupAck { .. } => MessageKind::BackupAck,
            MessageBody::Timeout { .. } => MessageKind::Timeout,
            MessageBody::Ack => MessageKind::Ack,
        }
    }

    /// The line this message concerns, or `None` for node-level messages.
    pub fn line(&self) -> Option<LineId> {
        match self {
            MessageBody::Get { line }
            | MessageBody::GetX { line }
            | MessageBody::Put { line, .. }
            | MessageBody::PutX { line, .. }
            | MessageBody::Inv { line, .. }
            | MessageBody::InvAck { line }
            | MessageBody::NotFound { line }
            | MessageBody::ChangedOwner { line, .. }
            | MessageBody::Msg { line, .. }
            | MessageBody::MsgAck { line }
            | MessageBody::Backup { line, .. }
            | MessageBody::BackupAck { line, .. }
            | MessageBody::Timeout { line } => Some(*line),
            MessageBody::Ack => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_lines_round_trip() {
        let body = MessageBody::Put {
            line: 7,
            version: 3,
            data: None,
        };
        assert_eq!(body.kind(), MessageKind::Put);
        assert_eq!(body.line(), Some(7));
        assert_eq!(MessageBody::Ack.line(), None);
    }
}
