//! Protocol message types for registry communication.
//!
//! Every message is one JSON object on its own line, tagged by `"type"`.
//! Requests that expect an answer carry a client-chosen `seq`; the daemon
//! echoes it in the reply. `publish` and `command_reply` are fire-and-forget.

use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use slc_core::{Command, CommandResult, Fault, FaultKind, NodeName, StatusRecord};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; must be the first message on a connection
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Register this connection as the owner of node `name`
    Register {
        seq: u64,
        name: NodeName,
        #[serde(with = "crate::record_hex")]
        record: StatusRecord,
    },

    /// Replace the snapshot of the node registered on this connection
    Publish {
        #[serde(with = "crate::record_hex")]
        record: StatusRecord,
    },

    /// Remove the node registered on this connection
    Unregister { seq: u64 },

    /// Fetch the latest snapshot of one node
    Lookup { seq: u64, name: NodeName },

    /// Fetch all snapshots
    List { seq: u64 },

    /// Route a command to the node that owns its target
    SendCommand { seq: u64, command: Command },

    /// Answer to a [`DaemonMessage::Command`] pushed to this node
    CommandReply { id: u64, result: CommandResult },

    /// Receive status broadcasts on this connection
    Subscribe {
        /// Optional filter by node name
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<NodeName>,
    },

    /// Stop receiving status broadcasts
    Unsubscribe,

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Wraps a payload with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn register(seq: u64, name: NodeName, record: StatusRecord) -> Self {
        Self::new(MessageType::Register { seq, name, record })
    }

    pub fn publish(record: StatusRecord) -> Self {
        Self::new(MessageType::Publish { record })
    }

    pub fn unregister(seq: u64) -> Self {
        Self::new(MessageType::Unregister { seq })
    }

    pub fn lookup(seq: u64, name: NodeName) -> Self {
        Self::new(MessageType::Lookup { seq, name })
    }

    pub fn list(seq: u64) -> Self {
        Self::new(MessageType::List { seq })
    }

    pub fn send_command(seq: u64, command: Command) -> Self {
        Self::new(MessageType::SendCommand { seq, command })
    }

    pub fn command_reply(id: u64, result: CommandResult) -> Self {
        Self::new(MessageType::CommandReply { id, result })
    }

    pub fn subscribe(name: Option<NodeName>) -> Self {
        Self::new(MessageType::Subscribe { name })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// A node name paired with its latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: NodeName,
    #[serde(with = "crate::record_hex")]
    pub record: StatusRecord,
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        /// Daemon's protocol version
        protocol_version: ProtocolVersion,
    },

    /// Registration accepted
    Registered { seq: u64, name: NodeName },

    /// Unregistration done (also sent when nothing was registered)
    Unregistered { seq: u64 },

    /// Reply to `lookup`
    Snapshot {
        seq: u64,
        name: NodeName,
        #[serde(with = "crate::record_hex")]
        record: StatusRecord,
    },

    /// Reply to `list`
    NodeList { seq: u64, nodes: Vec<NodeSnapshot> },

    /// Reply to `send_command`
    CommandResult { seq: u64, result: CommandResult },

    /// Command pushed to the node that owns this connection
    Command { id: u64, command: Command },

    /// A node published a new snapshot (subscribers only)
    StatusUpdated {
        name: NodeName,
        #[serde(with = "crate::record_hex")]
        record: StatusRecord,
    },

    /// A node was unregistered (subscribers only)
    NodeRemoved { name: NodeName },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response; `seq` is absent for errors not tied to a request
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        kind: FaultKind,
        message: String,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn error(seq: Option<u64>, kind: FaultKind, message: impl Into<String>) -> Self {
        Self::Error {
            seq,
            kind,
            message: message.into(),
        }
    }

    /// Returns the request sequence number this message answers, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Registered { seq, .. }
            | Self::Unregistered { seq }
            | Self::Snapshot { seq, .. }
            | Self::NodeList { seq, .. }
            | Self::CommandResult { seq, .. }
            | Self::Pong { seq } => Some(*seq),
            Self::Error { seq, .. } => *seq,
            Self::Connected { .. }
            | Self::Rejected { .. }
            | Self::Command { .. }
            | Self::StatusUpdated { .. }
            | Self::NodeRemoved { .. } => None,
        }
    }

    /// Converts an `error` message into a [`Fault`].
    pub fn as_fault(&self) -> Option<Fault> {
        match self {
            Self::Error { kind, message, .. } => Some(Fault::new(*kind, message.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slc_core::{CommandAck, PublishableStatus, RecordKind};

    fn name() -> NodeName {
        NodeName::new("HV_ARICH").unwrap()
    }

    #[test]
    fn test_client_message_serialization() {
        let msg = ClientMessage::ping(42);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));
        assert!(json.contains("\"protocol_version\""));
    }

    #[test]
    fn test_record_travels_as_hex() {
        let mut record = StatusRecord::allocate(RecordKind::Hv, 2).unwrap();
        record.set_config_id(17);
        let msg = ClientMessage::publish(record.clone());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"record\":\"00010001"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed.message {
            MessageType::Publish { record: back } => assert_eq!(back, record),
            other => panic!("Expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_hex_record_rejected() {
        let json = r#"{"protocol_version":{"major":1,"minor":0},"type":"publish","record":"zz"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_command_reply_roundtrip() {
        let msg = ClientMessage::command_reply(7, Ok(CommandAck::with_message("done")));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed.message {
            MessageType::CommandReply { id, result } => {
                assert_eq!(id, 7);
                assert_eq!(result.unwrap().message.as_deref(), Some("done"));
            }
            other => panic!("Expected CommandReply, got {other:?}"),
        }
    }

    #[test]
    fn test_daemon_error_carries_kind() {
        let msg = DaemonMessage::error(Some(3), FaultKind::DuplicateNode, "HV_ARICH taken");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"duplicate_node\""));
        let parsed: DaemonMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.seq(), Some(3));
        assert_eq!(parsed.as_fault().unwrap().kind, FaultKind::DuplicateNode);
    }

    #[test]
    fn test_push_messages_have_no_seq() {
        let cmd = Command::new(name(), "turnon", vec![]);
        assert_eq!(DaemonMessage::Command { id: 1, command: cmd }.seq(), None);
        assert_eq!(DaemonMessage::NodeRemoved { name: name() }.seq(), None);
    }
}
