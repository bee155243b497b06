//! Connection handler for individual client connections.
//!
//! Each connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages and routes them to the registry
//! - Owns at most one node registration and forwards that node's commands
//! - Unregisters its node when the connection drops
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use slc_core::{CommandResult, FaultKind, NodeName, StatusRecord};
use slc_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use crate::registry::{
    CommandInbox, PendingCommand, Registration, RegistryError, RegistryHandle, RemovalReason,
};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Information about a subscribed client
pub struct Subscriber {
    pub writer: SubscriberWriter,

    /// Optional filter for node-specific subscriptions
    pub filter: Option<NodeName>,
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of concurrent subscribers
pub const MAX_SUBSCRIBERS: usize = 32;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections that own no node and no subscription
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    lines: Lines<BufReader<OwnedReadHalf>>,

    /// Shared so subscriber broadcasts and spawned replies can write too
    writer: SubscriberWriter,

    registry: RegistryHandle,

    subscribers: SubscribersMap,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    subscribed: bool,

    /// The node registered through this connection, if any
    registration: Option<Registration>,

    /// Command inbox of the registered node
    inbox: Option<CommandInbox>,

    /// Commands forwarded to the node, awaiting `command_reply`
    pending: HashMap<u64, oneshot::Sender<CommandResult>>,

    next_command_id: u64,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        registry: RegistryHandle,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            registry,
            subscribers,
            client_id: None,
            subscribed: false,
            registration: None,
            inbox: None,
            pending: HashMap::new(),
            next_command_id: 1,
            connection_number,
        }
    }

    /// Runs the connection handler until the connection closes.
    ///
    /// Returns the client id so the server can drop its subscription.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                debug!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        if let Some(registration) = self.registration.take() {
            match self
                .registry
                .unregister_with_reason(&registration, RemovalReason::Disconnected)
                .await
            {
                Ok(true) => info!(node = %registration.name(), "Node connection dropped"),
                Ok(false) => {}
                Err(e) => warn!(node = %registration.name(), error = %e, "Cleanup unregister failed"),
            }
        }

        debug!(client_id = ?self.client_id, "Client disconnected");
        self.client_id
    }

    /// Expects a `connect` message, validates the protocol version and
    /// responds with `connected` or `rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if let Err(e) = ProtocolVersion::check_peer(&client_version) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::rejected(
                    "Expected connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads client messages and forwards node commands until the
    /// connection closes or an unrecoverable error occurs.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let idle_limit = if self.registration.is_some() || self.subscribed {
                None
            } else {
                Some(READ_TIMEOUT)
            };

            tokio::select! {
                biased;

                pending = next_command(&mut self.inbox) => {
                    match pending {
                        Some(pending) => self.forward_command(pending).await?,
                        None => self.inbox = None,
                    }
                }

                msg = read_with_limit(&mut self.lines, idle_limit) => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(ConnectionError::Eof) => {
                            debug!(client_id = ?self.client_id, "Client sent EOF");
                            return Ok(());
                        }
                        Err(e @ ConnectionError::ParseError(_)) => {
                            debug!(client_id = ?self.client_id, error = %e, "Malformed message");
                            self.send_message(DaemonMessage::error(None, FaultKind::Decode, e.to_string()))
                                .await?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    if let Err(e) = self.handle_message(msg).await {
                        if matches!(e, ConnectionError::Eof) {
                            return Ok(());
                        }
                        error!(client_id = ?self.client_id, error = %e, "Error handling message");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Handles a single client message.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error(
                    None,
                    FaultKind::Connection,
                    "Already connected",
                ))
                .await?;
            }

            MessageType::Register { seq, name, record } => {
                self.handle_register(seq, name, record).await?;
            }

            MessageType::Publish { record } => {
                self.handle_publish(record).await?;
            }

            MessageType::Unregister { seq } => {
                if let Some(registration) = self.registration.take() {
                    self.inbox = None;
                    self.pending.clear();
                    self.registry
                        .unregister(&registration)
                        .await
                        .map_err(|e| ConnectionError::Registry(e.to_string()))?;
                }
                self.send_message(DaemonMessage::Unregistered { seq }).await?;
            }

            MessageType::Lookup { seq, name } => {
                let reply = match self.registry.lookup(&name).await {
                    Ok(record) => DaemonMessage::Snapshot { seq, name, record },
                    Err(e) => registry_error(Some(seq), &e),
                };
                self.send_message(reply).await?;
            }

            MessageType::List { seq } => {
                let nodes = self.registry.list().await;
                self.send_message(DaemonMessage::NodeList { seq, nodes })
                    .await?;
            }

            MessageType::SendCommand { seq, command } => {
                // Routed on its own task: the target may be this very
                // connection's node, whose reply arrives through this loop.
                let registry = self.registry.clone();
                let writer = Arc::clone(&self.writer);
                tokio::spawn(async move {
                    let result = registry.send_command(command).await;
                    let reply = DaemonMessage::CommandResult { seq, result };
                    if let Err(e) = write_message(&writer, &reply).await {
                        debug!(error = %e, "Failed to deliver command result");
                    }
                });
            }

            MessageType::CommandReply { id, result } => match self.pending.remove(&id) {
                Some(respond_to) => {
                    let _ = respond_to.send(result);
                }
                None => {
                    debug!(client_id = ?self.client_id, id, "Reply for unknown command id");
                }
            },

            MessageType::Subscribe { name } => {
                self.handle_subscribe(name).await?;
            }

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                self.subscribed = false;
                debug!(client_id = ?self.client_id, "Client unsubscribed from updates");
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::Pong { seq }).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    async fn handle_register(
        &mut self,
        seq: u64,
        name: NodeName,
        record: StatusRecord,
    ) -> Result<(), ConnectionError> {
        if let Some(ref existing) = self.registration {
            let msg = format!("connection already owns node {}", existing.name());
            return self
                .send_message(DaemonMessage::error(Some(seq), FaultKind::DuplicateNode, msg))
                .await;
        }

        match self.registry.register(name.clone(), record).await {
            Ok((registration, inbox)) => {
                self.registration = Some(registration);
                self.inbox = Some(inbox);
                info!(client_id = ?self.client_id, node = %name, "Node attached");
                self.send_message(DaemonMessage::Registered { seq, name })
                    .await
            }
            Err(e) => {
                debug!(node = %name, error = %e, "Registration refused");
                self.send_message(registry_error(Some(seq), &e)).await
            }
        }
    }

    async fn handle_publish(&mut self, record: StatusRecord) -> Result<(), ConnectionError> {
        let Some(ref registration) = self.registration else {
            return self
                .send_message(DaemonMessage::error(
                    None,
                    FaultKind::NotFound,
                    "publish before register",
                ))
                .await;
        };

        if let Err(e) = self.registry.publish(registration, record).await {
            warn!(node = %registration.name(), error = %e, "Publish rejected");
            let reply = registry_error(None, &e);
            self.send_message(reply).await?;
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, filter: Option<NodeName>) -> Result<(), ConnectionError> {
        let Some(client_id) = self.client_id.clone() else {
            return Err(ConnectionError::UnexpectedMessage(
                "subscribe before connect".to_string(),
            ));
        };

        {
            let mut subs = self.subscribers.write().await;
            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                drop(subs);
                return self
                    .send_message(DaemonMessage::error(
                        None,
                        FaultKind::Connection,
                        format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                    ))
                    .await;
            }
            subs.insert(
                client_id.clone(),
                Subscriber {
                    writer: Arc::clone(&self.writer),
                    filter: filter.clone(),
                },
            );
        }
        self.subscribed = true;
        debug!(client_id = %client_id, filter = ?filter, "Client subscribed to updates");

        // Current snapshots as initial state
        for snapshot in self.registry.list().await {
            if filter.as_ref().is_some_and(|f| *f != snapshot.name) {
                continue;
            }
            self.send_message(DaemonMessage::StatusUpdated {
                name: snapshot.name,
                record: snapshot.record,
            })
            .await?;
        }
        Ok(())
    }

    /// Pushes a command to the node on the other end of this connection.
    async fn forward_command(&mut self, pending: PendingCommand) -> Result<(), ConnectionError> {
        let id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);

        debug!(client_id = ?self.client_id, id, command = %pending.command, "Forwarding command");
        self.pending.insert(id, pending.respond_to);
        self.send_message(DaemonMessage::Command {
            id,
            command: pending.command,
        })
        .await
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        read_with_limit(&mut self.lines, Some(READ_TIMEOUT)).await
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Waits for the next command in `inbox`; pends forever when there is none.
async fn next_command(inbox: &mut Option<CommandInbox>) -> Option<PendingCommand> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Reads one JSON line, optionally bounded by an idle timeout.
async fn read_with_limit(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    limit: Option<Duration>,
) -> Result<ClientMessage, ConnectionError> {
    let line = match limit {
        Some(limit) => timeout(limit, lines.next_line())
            .await
            .map_err(|_| ConnectionError::Timeout)?,
        None => lines.next_line().await,
    }
    .map_err(|e| ConnectionError::Io(e.to_string()))?
    .ok_or(ConnectionError::Eof)?;

    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ConnectionError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))
}

/// Writes one message as a JSON line and flushes.
pub async fn write_message(
    writer: &SubscriberWriter,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;
    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

fn registry_error(seq: Option<u64>, err: &RegistryError) -> DaemonMessage {
    DaemonMessage::error(seq, err.kind(), err.remote_message())
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Registry error: {0}")]
    Registry(String),
}
