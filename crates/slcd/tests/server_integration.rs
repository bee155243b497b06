//! Integration tests for the Unix socket registry server.
//!
//! These tests drive the server through real socket connections: handshake,
//! registration, publication, command routing, subscriptions and cleanup of
//! dropped connections.

use std::path::PathBuf;
use std::time::Duration;

use slc_core::{
    Command, CommandAck, CommandError, FaultKind, NodeName, NodeState, PublishableStatus,
    RecordKind, StatusRecord,
};
use slc_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};
use slcd::registry::{spawn_registry, RegistryHandle};
use slcd::server::RegistryServer;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    registry: RegistryHandle,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("slc.sock");

        let registry = spawn_registry();
        let cancel_token = CancellationToken::new();
        let server = RegistryServer::new(socket_path.clone(), registry.clone(), cancel_token.clone());

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            cancel_token,
            registry,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        let mut client = TestClient::new(stream);
        client.send(ClientMessage::connect(None)).await;
        assert!(matches!(client.recv().await, DaemonMessage::Connected { .. }));
        client
    }

    fn shutdown(self) {
        self.cancel_token.cancel();
    }
}

struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("server reply within timeout")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn register(&mut self, n: &str, record: StatusRecord) -> DaemonMessage {
        self.send(ClientMessage::register(1, name(n), record)).await;
        self.recv().await
    }
}

fn name(s: &str) -> NodeName {
    NodeName::new(s).unwrap()
}

fn hv_record() -> StatusRecord {
    StatusRecord::allocate(RecordKind::Hv, 4).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_rejects_incompatible_version() {
    let server = TestServer::spawn().await;
    let stream = UnixStream::connect(&server.socket_path).await.unwrap();
    let mut client = TestClient::new(stream);

    let mut msg = ClientMessage::connect(None);
    msg.protocol_version = ProtocolVersion::new(9, 0);
    client.send(msg).await;

    assert!(matches!(client.recv().await, DaemonMessage::Rejected { .. }));
    server.shutdown();
}

#[tokio::test]
async fn test_register_publish_lookup() {
    let server = TestServer::spawn().await;
    let mut node = server.connect().await;

    let reply = node.register("HV_ARICH", hv_record()).await;
    assert!(matches!(reply, DaemonMessage::Registered { seq: 1, .. }));

    let mut record = hv_record();
    record.set_state(NodeState::Ready);
    record.set_config_id(17);
    node.send(ClientMessage::publish(record.clone())).await;

    // Publish is unacknowledged; a ping round-trip orders it before lookup
    node.send(ClientMessage::ping(2)).await;
    assert!(matches!(node.recv().await, DaemonMessage::Pong { seq: 2 }));

    let mut client = server.connect().await;
    client.send(ClientMessage::lookup(3, name("HV_ARICH"))).await;
    match client.recv().await {
        DaemonMessage::Snapshot { seq, record: got, .. } => {
            assert_eq!(seq, 3);
            assert_eq!(got, record);
        }
        other => panic!("Expected Snapshot, got {other:?}"),
    }

    client.send(ClientMessage::list(4)).await;
    match client.recv().await {
        DaemonMessage::NodeList { nodes, .. } => assert_eq!(nodes.len(), 1),
        other => panic!("Expected NodeList, got {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn test_duplicate_register_over_socket() {
    let server = TestServer::spawn().await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;

    first.register("HV_ARICH", hv_record()).await;
    let reply = second.register("HV_ARICH", hv_record()).await;
    let fault = reply.as_fault().expect("error reply");
    assert_eq!(fault.kind, FaultKind::DuplicateNode);
    server.shutdown();
}

#[tokio::test]
async fn test_lookup_unknown_is_not_found() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::lookup(9, name("NOBODY"))).await;
    let reply = client.recv().await;
    assert_eq!(reply.seq(), Some(9));
    assert_eq!(reply.as_fault().unwrap().kind, FaultKind::NotFound);
    server.shutdown();
}

#[tokio::test]
async fn test_command_routed_to_node_connection() {
    let server = TestServer::spawn().await;
    let mut node = server.connect().await;
    node.register("HV_ARICH", hv_record()).await;

    let mut operator = server.connect().await;
    operator
        .send(ClientMessage::send_command(
            5,
            Command::new(name("HV_ARICH"), "configure", vec!["cfg17".into()]),
        ))
        .await;

    let (id, command) = match node.recv().await {
        DaemonMessage::Command { id, command } => (id, command),
        other => panic!("Expected Command, got {other:?}"),
    };
    assert_eq!(command.verb, "configure");
    node.send(ClientMessage::command_reply(id, Ok(CommandAck::with_message("cfg17"))))
        .await;

    match operator.recv().await {
        DaemonMessage::CommandResult { seq, result } => {
            assert_eq!(seq, 5);
            assert_eq!(result.unwrap().message.as_deref(), Some("cfg17"));
        }
        other => panic!("Expected CommandResult, got {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn test_command_to_vanished_node_is_unreachable() {
    let server = TestServer::spawn().await;
    let mut node = server.connect().await;
    node.register("HV_ARICH", hv_record()).await;

    let mut operator = server.connect().await;
    operator
        .send(ClientMessage::send_command(
            6,
            Command::new(name("HV_ARICH"), "turnon", vec![]),
        ))
        .await;

    // Node receives the command and dies without answering
    assert!(matches!(node.recv().await, DaemonMessage::Command { .. }));
    drop(node);

    match operator.recv().await {
        DaemonMessage::CommandResult { result, .. } => {
            assert!(matches!(result, Err(CommandError::Unreachable { .. })));
        }
        other => panic!("Expected CommandResult, got {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn test_subscriber_sees_updates_and_disconnect_cleanup() {
    let server = TestServer::spawn().await;
    let mut watcher = server.connect().await;
    watcher.send(ClientMessage::subscribe(None)).await;
    watcher.send(ClientMessage::ping(1)).await;
    assert!(matches!(watcher.recv().await, DaemonMessage::Pong { seq: 1 }));

    let mut node = server.connect().await;
    node.register("CPR5001", hv_record()).await;

    let mut record = hv_record();
    record.set_config_id(2);
    node.send(ClientMessage::publish(record.clone())).await;

    match watcher.recv().await {
        DaemonMessage::StatusUpdated { name: n, record: got } => {
            assert_eq!(n.as_str(), "CPR5001");
            assert_eq!(got.config_id(), 2);
        }
        other => panic!("Expected StatusUpdated, got {other:?}"),
    }

    drop(node);
    match watcher.recv().await {
        DaemonMessage::NodeRemoved { name: n } => assert_eq!(n.as_str(), "CPR5001"),
        other => panic!("Expected NodeRemoved, got {other:?}"),
    }
    assert!(server.registry.lookup(&name("CPR5001")).await.is_err());
    server.shutdown();
}

#[tokio::test]
async fn test_malformed_line_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.writer.write_all(b"{not json}\n").await.unwrap();
    let reply = client.recv().await;
    assert_eq!(reply.as_fault().unwrap().kind, FaultKind::Decode);

    client.send(ClientMessage::ping(11)).await;
    assert!(matches!(client.recv().await, DaemonMessage::Pong { seq: 11 }));
    server.shutdown();
}
