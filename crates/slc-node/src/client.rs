//! Socket client for the `slcd` registry daemon.
//!
//! [`RemoteRegistry`] is a cheap-to-clone handle. One background task owns
//! the socket:
//!
//! ```text
//! RemoteRegistry ──Request──▶ ┌──────────────┐ ──JSON line──▶ slcd
//!   (any task)   ◀─oneshot──  │  ClientTask  │ ◀─JSON line──
//!                             └──────┬───────┘
//!                 command push       │        status_updated / node_removed
//!                 ▼                  │                    ▼
//!            CommandInbox ──reply────┘          broadcast::Sender<StatusEvent>
//! ```
//!
//! Commands the daemon pushes for the registered node land in the node's
//! `CommandInbox`, exactly like with the in-process registry; the answer
//! travels back as `command_reply`. Dropping every handle closes the socket,
//! which makes the daemon unregister the node.
//!
//! # Reconnection
//!
//! When the daemon goes away the task ends the session: waiting requests
//! fail with `RegistryError::Connection`, the node's inbox closes and
//! subscriptions end. It then reconnects with exponential backoff. Requests
//! made while the socket is down fail at once; a node registers again on the
//! new session.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A lost socket fails every waiting request with `RegistryError::Connection`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use slc_core::{
    Command, CommandError, CommandResult, NodeIdentity, NodeName, StatusRecord,
};
use slc_protocol::{ClientMessage, DaemonMessage, NodeSnapshot};
use slcd::registry::{
    CommandInbox, PendingCommand, Registration, RegistryError, RemovalReason, StatusEvent,
    INBOX_BUFFER,
};

use crate::registry::StatusRegistry;
use crate::transport::CONNECT_TIMEOUT;

const REQUEST_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 100;
const REPLY_BUFFER: usize = 16;

/// First delay before reconnecting to a lost daemon.
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Upper bound of the reconnect backoff.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Requests
// ============================================================================

enum Query {
    Lookup(NodeName),
    List,
    SendCommand(Command),
    Ping,
}

enum Request {
    Register {
        name: NodeName,
        record: StatusRecord,
        respond_to: oneshot::Sender<Result<(Registration, CommandInbox), RegistryError>>,
    },
    Publish {
        registration: Registration,
        record: StatusRecord,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },
    Unregister {
        registration: Registration,
        respond_to: oneshot::Sender<Result<bool, RegistryError>>,
    },
    Query {
        query: Query,
        respond_to: oneshot::Sender<Result<DaemonMessage, RegistryError>>,
    },
    Subscribe {
        filter: Option<NodeName>,
        respond_to: oneshot::Sender<Result<broadcast::Receiver<StatusEvent>, RegistryError>>,
    },
}

impl Request {
    /// Answers a request made while the socket is down.
    fn fail(self) {
        match self {
            Self::Register { respond_to, .. } => {
                let _ = respond_to.send(Err(lost()));
            }
            Self::Publish { respond_to, .. } => {
                let _ = respond_to.send(Err(lost()));
            }
            // The daemon dropped whatever the lost session held
            Self::Unregister { respond_to, .. } => {
                let _ = respond_to.send(Ok(false));
            }
            Self::Query { respond_to, .. } => {
                let _ = respond_to.send(Err(lost()));
            }
            Self::Subscribe { respond_to, .. } => {
                let _ = respond_to.send(Err(lost()));
            }
        }
    }
}

/// A request waiting for the daemon's answer, keyed by `seq`.
enum Waiter {
    Register {
        name: NodeName,
        respond_to: oneshot::Sender<Result<(Registration, CommandInbox), RegistryError>>,
    },
    Unregister(oneshot::Sender<Result<bool, RegistryError>>),
    Reply(oneshot::Sender<Result<DaemonMessage, RegistryError>>),
}

impl Waiter {
    fn fail(self, err: RegistryError) {
        match self {
            Self::Register { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            Self::Unregister(respond_to) => {
                let _ = respond_to.send(Err(err));
            }
            Self::Reply(respond_to) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }
}

// ============================================================================
// Remote Registry
// ============================================================================

/// Registry handle backed by the `slcd` daemon socket.
#[derive(Clone)]
pub struct RemoteRegistry {
    requests: mpsc::Sender<Request>,
    socket_path: PathBuf,
    connected: Arc<AtomicBool>,
}

impl RemoteRegistry {
    /// Connects and performs the protocol handshake.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Connection` if the socket cannot be reached within
    ///   the connect timeout or the daemon rejects the handshake
    /// - `RegistryError::Protocol` if the daemon answers nonsense
    pub async fn connect(
        socket_path: impl Into<PathBuf>,
        client_id: Option<String>,
    ) -> Result<Self, RegistryError> {
        let socket_path = socket_path.into();
        let wire = open(&socket_path, client_id.clone()).await?;
        let connected = Arc::new(AtomicBool::new(true));

        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);

        let task = ClientTask {
            wire,
            socket_path: socket_path.clone(),
            client_id,
            connected: Arc::clone(&connected),
            session: 0,
            requests: request_rx,
            events: event_tx,
            replies_tx: reply_tx,
            replies_rx: reply_rx,
            pending: HashMap::new(),
            next_seq: 1,
            current: None,
            inbox: None,
        };
        tokio::spawn(task.run());

        Ok(Self {
            requests: request_tx,
            socket_path,
            connected,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns `true` while the daemon socket is up.
    pub fn is_connected(&self) -> bool {
        !self.requests.is_closed() && self.connected.load(Ordering::SeqCst)
    }

    /// Subscribes to status broadcasts, optionally for one node only.
    ///
    /// The daemon first replays the current snapshots as `Updated` events.
    /// The stream ends (`RecvError::Closed`) when the connection is lost.
    pub async fn subscribe(
        &self,
        filter: Option<NodeName>,
    ) -> Result<broadcast::Receiver<StatusEvent>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Subscribe {
            filter,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| lost())?
    }

    /// Round-trips a ping.
    pub async fn ping(&self) -> Result<(), RegistryError> {
        match self.query(Query::Ping).await? {
            DaemonMessage::Pong { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn submit(&self, request: Request) -> Result<(), RegistryError> {
        self.requests.send(request).await.map_err(|_| lost())
    }

    async fn query(&self, query: Query) -> Result<DaemonMessage, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Query {
            query,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| lost())?
    }
}

#[async_trait]
impl StatusRegistry for RemoteRegistry {
    async fn register(
        &self,
        identity: &NodeIdentity,
        initial: StatusRecord,
    ) -> Result<(Registration, CommandInbox), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Register {
            name: identity.name().clone(),
            record: initial,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| lost())?
    }

    async fn publish(
        &self,
        registration: &Registration,
        record: StatusRecord,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Publish {
            registration: registration.clone(),
            record,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| lost())?
    }

    async fn lookup(&self, name: &NodeName) -> Result<StatusRecord, RegistryError> {
        match self.query(Query::Lookup(name.clone())).await? {
            DaemonMessage::Snapshot { record, .. } => Ok(record),
            other => Err(unexpected(&other)),
        }
    }

    async fn unregister(&self, registration: &Registration) -> Result<bool, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Unregister {
            registration: registration.clone(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| lost())?
    }

    async fn list(&self) -> Result<Vec<NodeSnapshot>, RegistryError> {
        match self.query(Query::List).await? {
            DaemonMessage::NodeList { nodes, .. } => Ok(nodes),
            other => Err(unexpected(&other)),
        }
    }

    async fn send_command(&self, command: Command) -> CommandResult {
        match self.query(Query::SendCommand(command)).await? {
            DaemonMessage::CommandResult { result, .. } => result,
            other => Err(CommandError::from(unexpected(&other))),
        }
    }
}

/// Connects and performs the protocol handshake.
async fn open(socket_path: &Path, client_id: Option<String>) -> Result<Wire, RegistryError> {
    let failed =
        |reason: String| RegistryError::Connection(format!("{}: {reason}", socket_path.display()));

    let stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .map_err(|_| failed(format!("timed out after {CONNECT_TIMEOUT:?}")))?
        .map_err(|e| failed(e.to_string()))?;

    let (reader, writer) = stream.into_split();
    let mut wire = Wire {
        lines: BufReader::new(reader).lines(),
        writer: BufWriter::new(writer),
    };

    write_line(&mut wire.writer, &ClientMessage::connect(client_id)).await?;
    let reply = timeout(CONNECT_TIMEOUT, read_line(&mut wire.lines))
        .await
        .map_err(|_| failed("no handshake reply".to_string()))??;

    match reply {
        DaemonMessage::Connected {
            client_id,
            protocol_version,
        } => {
            info!(
                socket = %socket_path.display(),
                client_id = %client_id,
                daemon_version = %protocol_version,
                "Connected to registry daemon"
            );
            Ok(wire)
        }
        DaemonMessage::Rejected { reason, .. } => Err(failed(format!("rejected: {reason}"))),
        other => Err(RegistryError::Protocol(format!(
            "expected connected, got {other:?}"
        ))),
    }
}

fn lost() -> RegistryError {
    RegistryError::Connection("registry connection lost".to_string())
}

fn unexpected(msg: &DaemonMessage) -> RegistryError {
    RegistryError::Protocol(format!("unexpected reply: {msg:?}"))
}

// ============================================================================
// Socket Task
// ============================================================================

/// Both halves of an open daemon socket.
struct Wire {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: BufWriter<OwnedWriteHalf>,
}

struct ClientTask {
    wire: Wire,
    socket_path: PathBuf,
    client_id: Option<String>,
    connected: Arc<AtomicBool>,

    /// Bumped for every lost connection
    session: u64,

    requests: mpsc::Receiver<Request>,
    events: broadcast::Sender<StatusEvent>,

    /// Answers of the local node to pushed commands, `(session, id, result)`
    replies_tx: mpsc::Sender<(u64, u64, CommandResult)>,
    replies_rx: mpsc::Receiver<(u64, u64, CommandResult)>,

    pending: HashMap<u64, Waiter>,
    next_seq: u64,

    /// Registration currently owned by this connection
    current: Option<Registration>,
    inbox: Option<mpsc::Sender<PendingCommand>>,
}

impl ClientTask {
    async fn run(mut self) {
        loop {
            let outcome = self.process().await;
            self.end_session();
            match outcome {
                Ok(()) => {
                    debug!("Registry client closed");
                    return;
                }
                Err(e) => {
                    warn!(socket = %self.socket_path.display(), error = %e, "Registry connection lost");
                }
            }

            match self.reconnect().await {
                Some(wire) => self.wire = wire,
                None => {
                    debug!("Registry client closed while reconnecting");
                    return;
                }
            }
        }
    }

    /// Releases everything tied to the current connection.
    fn end_session(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.session = self.session.wrapping_add(1);
        for (_, waiter) in self.pending.drain() {
            waiter.fail(lost());
        }
        // Dropping the inbox sender ends the node's command stream
        self.current = None;
        self.inbox = None;
        // Dropping the sender ends every subscription
        self.events = broadcast::channel(EVENT_BUFFER).0;
    }

    /// Reopens the socket with exponential backoff.
    ///
    /// Returns `None` once every handle is gone.
    async fn reconnect(&mut self) -> Option<Wire> {
        let mut delay = RETRY_INITIAL_DELAY;
        let mut attempt = 0u32;

        loop {
            let retry_at = Instant::now() + delay;
            loop {
                tokio::select! {
                    request = self.requests.recv() => match request {
                        Some(request) => request.fail(),
                        None => return None,
                    },
                    _ = sleep_until(retry_at) => break,
                }
            }

            attempt = attempt.saturating_add(1);
            match open(&self.socket_path, self.client_id.clone()).await {
                Ok(wire) => {
                    info!(socket = %self.socket_path.display(), attempt, "Registry connection restored");
                    self.connected.store(true, Ordering::SeqCst);
                    return Some(wire);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Registry reconnect failed");
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                }
            }
        }
    }

    async fn process(&mut self) -> Result<(), RegistryError> {
        loop {
            tokio::select! {
                biased;

                Some((session, id, result)) = self.replies_rx.recv() => {
                    if session == self.session {
                        self.write(&ClientMessage::command_reply(id, result)).await?;
                    } else {
                        debug!(id, "Dropping reply for a lost session");
                    }
                }

                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await?,
                    None => {
                        let _ = self.write(&ClientMessage::disconnect()).await;
                        return Ok(());
                    }
                },

                msg = read_line(&mut self.wire.lines) => {
                    match msg {
                        Ok(msg) => self.handle_message(msg).await?,
                        Err(RegistryError::Protocol(reason)) => {
                            warn!(reason = %reason, "Ignoring malformed daemon message");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    async fn write(&mut self, msg: &ClientMessage) -> Result<(), RegistryError> {
        write_line(&mut self.wire.writer, msg).await
    }

    /// Writes a request whose answer goes to `waiter`.
    async fn write_waiting(
        &mut self,
        seq: u64,
        msg: ClientMessage,
        waiter: Waiter,
    ) -> Result<(), RegistryError> {
        self.pending.insert(seq, waiter);
        self.write(&msg).await
    }

    async fn handle_request(&mut self, request: Request) -> Result<(), RegistryError> {
        match request {
            Request::Register {
                name,
                record,
                respond_to,
            } => {
                let seq = self.seq();
                let msg = ClientMessage::register(seq, name.clone(), record);
                self.write_waiting(seq, msg, Waiter::Register { name, respond_to })
                    .await
            }

            Request::Publish {
                registration,
                record,
                respond_to,
            } => {
                if self.current.as_ref() != Some(&registration) {
                    let _ = respond_to.send(Err(RegistryError::NotFound(
                        registration.name().to_string(),
                    )));
                    return Ok(());
                }
                let written = self.write(&ClientMessage::publish(record)).await;
                let _ = respond_to.send(written.clone());
                written
            }

            Request::Unregister {
                registration,
                respond_to,
            } => {
                if self.current.as_ref() != Some(&registration) {
                    let _ = respond_to.send(Ok(false));
                    return Ok(());
                }
                self.current = None;
                self.inbox = None;
                let seq = self.seq();
                self.write_waiting(seq, ClientMessage::unregister(seq), Waiter::Unregister(respond_to))
                    .await
            }

            Request::Query { query, respond_to } => {
                let seq = self.seq();
                let msg = match query {
                    Query::Lookup(name) => ClientMessage::lookup(seq, name),
                    Query::List => ClientMessage::list(seq),
                    Query::SendCommand(command) => ClientMessage::send_command(seq, command),
                    Query::Ping => ClientMessage::ping(seq),
                };
                self.write_waiting(seq, msg, Waiter::Reply(respond_to)).await
            }

            Request::Subscribe { filter, respond_to } => {
                let events = self.events.subscribe();
                let written = self.write(&ClientMessage::subscribe(filter)).await;
                let _ = respond_to.send(written.clone().map(|()| events));
                written
            }
        }
    }

    async fn handle_message(&mut self, msg: DaemonMessage) -> Result<(), RegistryError> {
        match msg {
            DaemonMessage::Command { id, command } => self.deliver_command(id, command).await,

            DaemonMessage::StatusUpdated { name, record } => {
                let _ = self.events.send(StatusEvent::Updated {
                    name,
                    record: Box::new(record),
                });
                Ok(())
            }

            // The wire message does not say why the node left
            DaemonMessage::NodeRemoved { name } => {
                let _ = self.events.send(StatusEvent::Removed {
                    name,
                    reason: RemovalReason::Explicit,
                });
                Ok(())
            }

            msg => {
                match msg.seq().and_then(|seq| self.pending.remove(&seq)) {
                    Some(waiter) => self.complete(waiter, msg),
                    None => match msg.as_fault() {
                        Some(fault) => warn!(fault = %fault, "Registry daemon reported an error"),
                        None => debug!(message = ?msg, "Unsolicited daemon message"),
                    },
                }
                Ok(())
            }
        }
    }

    fn complete(&mut self, waiter: Waiter, msg: DaemonMessage) {
        if let DaemonMessage::Error { kind, message, .. } = msg {
            waiter.fail(RegistryError::from_remote(kind, message));
            return;
        }

        match waiter {
            Waiter::Register { name, respond_to } => match msg {
                DaemonMessage::Registered { seq, .. } => {
                    let (tx, rx) = mpsc::channel(INBOX_BUFFER);
                    let registration = Registration::new(name, seq);
                    self.current = Some(registration.clone());
                    self.inbox = Some(tx);
                    let _ = respond_to.send(Ok((registration, rx)));
                }
                other => {
                    let _ = respond_to.send(Err(unexpected(&other)));
                }
            },
            Waiter::Unregister(respond_to) => {
                let result = match msg {
                    DaemonMessage::Unregistered { .. } => Ok(true),
                    other => Err(unexpected(&other)),
                };
                let _ = respond_to.send(result);
            }
            Waiter::Reply(respond_to) => {
                let _ = respond_to.send(Ok(msg));
            }
        }
    }

    /// Hands a pushed command to the local node; its answer comes back
    /// through `replies_rx`.
    async fn deliver_command(&mut self, id: u64, command: Command) -> Result<(), RegistryError> {
        let Some(inbox) = self.inbox.as_ref() else {
            let reply = Err(CommandError::unreachable("node is not registered"));
            return self.write(&ClientMessage::command_reply(id, reply)).await;
        };

        let (tx, rx) = oneshot::channel();
        let refused = match inbox.try_send(PendingCommand {
            command,
            respond_to: tx,
        }) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => Some("command inbox full"),
            Err(TrySendError::Closed(_)) => Some("node is gone"),
        };
        if let Some(reason) = refused {
            let reply = Err(CommandError::unreachable(reason));
            return self.write(&ClientMessage::command_reply(id, reply)).await;
        }

        let replies = self.replies_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let result = rx
                .await
                .unwrap_or_else(|_| Err(CommandError::unreachable("node dropped the command")));
            let _ = replies.send((session, id, result)).await;
        });
        Ok(())
    }
}

async fn write_line(
    writer: &mut BufWriter<OwnedWriteHalf>,
    msg: &ClientMessage,
) -> Result<(), RegistryError> {
    let json = serde_json::to_string(msg).map_err(|e| RegistryError::Protocol(e.to_string()))?;
    let io = |e: std::io::Error| RegistryError::Connection(e.to_string());
    writer.write_all(json.as_bytes()).await.map_err(io)?;
    writer.write_all(b"\n").await.map_err(io)?;
    writer.flush().await.map_err(io)
}

/// Reads one daemon message; EOF is a lost connection.
async fn read_line(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> Result<DaemonMessage, RegistryError> {
    let line = lines
        .next_line()
        .await
        .map_err(|e| RegistryError::Connection(e.to_string()))?
        .ok_or_else(lost)?;
    serde_json::from_str(&line).map_err(|e| RegistryError::Protocol(e.to_string()))
}
