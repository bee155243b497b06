//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to status events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use slc_core::{Command, CommandError, CommandResult, NodeName, StatusRecord};
use slc_protocol::NodeSnapshot;

use super::commands::{
    CommandInbox, PendingCommand, Registration, RegistryCommand, RegistryError, RemovalReason,
    StatusEvent,
};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
///
/// # Usage
///
/// ```ignore
/// let (registration, mut inbox) = handle.register(name, record).await?;
/// handle.publish(&registration, updated).await?;
///
/// while let Some(pending) = inbox.recv().await {
///     pending.reply(Ok(CommandAck::ok()));
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<StatusEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<StatusEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Register a node with its initial snapshot.
    ///
    /// Returns the registration and the node's command inbox.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateNode` if the name is taken
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(
        &self,
        name: NodeName,
        record: StatusRecord,
    ) -> Result<(Registration, CommandInbox), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Register {
                name,
                record: Box::new(record),
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Replace the node's snapshot.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if the registration is no longer live
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn publish(
        &self,
        registration: &Registration,
        record: StatusRecord,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Publish {
                registration: registration.clone(),
                record: Box::new(record),
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Fetch the latest snapshot of `name`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if no node is registered under `name`
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn lookup(&self, name: &NodeName) -> Result<StatusRecord, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Lookup {
                name: name.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await
            .map_err(|_| RegistryError::ChannelClosed)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Fetch all snapshots, ordered by node name.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn list(&self) -> Vec<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::List { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Remove a registration.
    ///
    /// Idempotent: returns `Ok(false)` if the registration was already gone
    /// or has been superseded by a newer registration of the same name.
    pub async fn unregister(&self, registration: &Registration) -> Result<bool, RegistryError> {
        self.unregister_with_reason(registration, RemovalReason::Explicit)
            .await
    }

    /// Remove a registration, recording why.
    pub async fn unregister_with_reason(
        &self,
        registration: &Registration,
        reason: RemovalReason,
    ) -> Result<bool, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Unregister {
                registration: registration.clone(),
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Route a command to its target node and wait for the result.
    ///
    /// The actor only resolves the target's inbox; waiting for the node's
    /// reply happens here, so a slow node never stalls the registry.
    pub async fn send_command(&self, command: Command) -> CommandResult {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::ResolveInbox {
                name: command.target.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        let inbox = rx.await.map_err(|_| RegistryError::ChannelClosed)??;

        let (reply_tx, reply_rx) = oneshot::channel();
        let target = command.target.clone();
        match inbox.try_send(PendingCommand {
            command,
            respond_to: reply_tx,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(node = %target, "Command inbox full");
                return Err(CommandError::unreachable(format!(
                    "{target}: command inbox full"
                )));
            }
            Err(TrySendError::Closed(_)) => {
                return Err(CommandError::unreachable(format!("{target}: node is gone")));
            }
        }

        reply_rx
            .await
            .map_err(|_| CommandError::unreachable(format!("{target}: no reply")))?
    }

    /// Subscribe to status events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` while the actor's command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slc_core::{CommandAck, RecordKind};

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        (RegistryHandle::new(cmd_tx, event_tx), cmd_rx)
    }

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    fn record() -> StatusRecord {
        StatusRecord::allocate(RecordKind::Hv, 2).unwrap()
    }

    #[tokio::test]
    async fn test_register_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Register {
                name, respond_to, ..
            }) = rx.recv().await
            {
                assert_eq!(name.as_str(), "HV_ARICH");
                let (_tx, inbox) = mpsc::channel(1);
                let _ = respond_to.send(Ok((Registration::new(name, 7), inbox)));
                return true;
            }
            false
        });

        let (reg, _inbox) = handle.register(name("HV_ARICH"), record()).await.unwrap();
        assert_eq!(reg.token(), 7);
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_register_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle.register(name("HV_ARICH"), record()).await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_lookup_missing_is_not_found() {
        let (handle, mut rx) = create_test_handle();
        tokio::spawn(async move {
            if let Some(RegistryCommand::Lookup { respond_to, .. }) = rx.recv().await {
                let _ = respond_to.send(None);
            }
        });

        let err = handle.lookup(&name("NOBODY")).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(n) if n == "NOBODY"));
    }

    #[tokio::test]
    async fn test_list_returns_empty_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);
        assert!(handle.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_command_routes_to_inbox() {
        let (handle, mut rx) = create_test_handle();
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<PendingCommand>(1);

        tokio::spawn(async move {
            if let Some(RegistryCommand::ResolveInbox { respond_to, .. }) = rx.recv().await {
                let _ = respond_to.send(Ok(inbox_tx));
            }
        });
        tokio::spawn(async move {
            if let Some(pending) = inbox_rx.recv().await {
                let verb = pending.command.verb.clone();
                pending.reply(Ok(CommandAck::with_message(verb)));
            }
        });

        let ack = handle
            .send_command(Command::new(name("HV_ARICH"), "turnon", vec![]))
            .await
            .unwrap();
        assert_eq!(ack.message.as_deref(), Some("turnon"));
    }

    #[tokio::test]
    async fn test_send_command_unknown_target() {
        let (handle, mut rx) = create_test_handle();
        tokio::spawn(async move {
            if let Some(RegistryCommand::ResolveInbox { name, respond_to }) = rx.recv().await {
                let _ = respond_to.send(Err(RegistryError::NotFound(name.to_string())));
            }
        });

        let err = handle
            .send_command(Command::new(name("NOBODY"), "turnon", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_send_command_dropped_reply_is_unreachable() {
        let (handle, mut rx) = create_test_handle();
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<PendingCommand>(1);
        tokio::spawn(async move {
            if let Some(RegistryCommand::ResolveInbox { respond_to, .. }) = rx.recv().await {
                let _ = respond_to.send(Ok(inbox_tx));
            }
        });
        tokio::spawn(async move {
            // Drop the pending command without replying
            let _ = inbox_rx.recv().await;
        });

        let err = handle
            .send_command(Command::new(name("HV_ARICH"), "turnon", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_is_connected() {
        let (handle, rx) = create_test_handle();
        assert!(handle.is_connected());
        drop(rx);
        assert!(!handle.is_connected());
    }
}
