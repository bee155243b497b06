//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `StatusEvent`: Events published by the registry for subscribers
//! - `Registration` / `PendingCommand`: what a registered node holds and receives

use std::fmt;

use slc_core::{Command, CommandError, CommandResult, Fault, FaultKind, NodeName, StatusRecord};
use slc_protocol::NodeSnapshot;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Registration
// ============================================================================

/// Proof of a live registration.
///
/// The token distinguishes successive registrations of the same name, so an
/// old handle can never publish to or remove a newer registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    name: NodeName,
    token: u64,
}

impl Registration {
    pub fn new(name: NodeName, token: u64) -> Self {
        Self { name, token }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// A command delivered to a node's inbox, with the channel for its result.
#[derive(Debug)]
pub struct PendingCommand {
    pub command: Command,
    pub respond_to: oneshot::Sender<CommandResult>,
}

impl PendingCommand {
    /// Sends the result back to whoever issued the command.
    ///
    /// A dropped requester is not an error; the result is discarded.
    pub fn reply(self, result: CommandResult) {
        let _ = self.respond_to.send(result);
    }
}

/// Mailbox of commands addressed to one registered node.
pub type CommandInbox = mpsc::Receiver<PendingCommand>;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command carries a oneshot channel for the response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a node with its initial snapshot.
    ///
    /// # Errors
    /// - `RegistryError::DuplicateNode` if the name is taken
    /// - `RegistryError::RegistryFull` if at maximum capacity
    Register {
        name: NodeName,
        record: Box<StatusRecord>,
        respond_to: oneshot::Sender<Result<(Registration, CommandInbox), RegistryError>>,
    },

    /// Replace a node's snapshot.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the registration is no longer live
    Publish {
        registration: Registration,
        record: Box<StatusRecord>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Fetch one snapshot.
    Lookup {
        name: NodeName,
        respond_to: oneshot::Sender<Option<StatusRecord>>,
    },

    /// Fetch all snapshots, ordered by name.
    List {
        respond_to: oneshot::Sender<Vec<NodeSnapshot>>,
    },

    /// Remove a registration. Responds `true` if something was removed.
    Unregister {
        registration: Registration,
        reason: RemovalReason,
        respond_to: oneshot::Sender<bool>,
    },

    /// Resolve the inbox of a command's target.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if no node owns that name
    ResolveInbox {
        name: NodeName,
        respond_to: oneshot::Sender<Result<mpsc::Sender<PendingCommand>, RegistryError>>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A node with this name is already registered.
    #[error("node already registered: {0}")]
    DuplicateNode(NodeName),

    /// No live node (or registration) under this name.
    #[error("node not found: {0}")]
    NotFound(String),

    /// The registry has reached its maximum node capacity.
    #[error("registry is full (max: {max} nodes)")]
    RegistryFull { max: usize },

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,

    /// The registry daemon could not be reached.
    #[error("registry unreachable: {0}")]
    Connection(String),

    /// The registry daemon sent something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The registry daemon answered with an error.
    #[error("{kind}: {message}")]
    Remote { kind: FaultKind, message: String },
}

impl RegistryError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::DuplicateNode(_) => FaultKind::DuplicateNode,
            Self::NotFound(_) => FaultKind::NotFound,
            Self::RegistryFull { .. } => FaultKind::Io,
            Self::ChannelClosed | Self::Connection(_) => FaultKind::Connection,
            Self::Protocol(_) => FaultKind::Decode,
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Rebuilds the error a remote registry reported.
    ///
    /// Kinds with a local counterpart map back onto it so callers can match
    /// on `DuplicateNode` / `NotFound` regardless of where the registry runs.
    pub fn from_remote(kind: FaultKind, message: String) -> Self {
        match kind {
            FaultKind::NotFound => Self::NotFound(message),
            FaultKind::DuplicateNode => match NodeName::new(message.clone()) {
                Ok(name) => Self::DuplicateNode(name),
                Err(_) => Self::Remote { kind, message },
            },
            _ => Self::Remote { kind, message },
        }
    }

    /// Message sent over the wire so `from_remote` can rebuild the error.
    pub fn remote_message(&self) -> String {
        match self {
            Self::DuplicateNode(name) => name.to_string(),
            Self::NotFound(what) => what.clone(),
            other => other.to_string(),
        }
    }
}

impl From<RegistryError> for Fault {
    fn from(err: RegistryError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

impl From<RegistryError> for CommandError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(target) => CommandError::NotFound { target },
            other => CommandError::unreachable(other.to_string()),
        }
    }
}

// ============================================================================
// Status Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// A node registered.
    Registered { name: NodeName },

    /// A node published a snapshot that differs from the stored one.
    Updated {
        name: NodeName,
        record: Box<StatusRecord>,
    },

    /// A node left the registry.
    Removed { name: NodeName, reason: RemovalReason },
}

impl StatusEvent {
    pub fn name(&self) -> &NodeName {
        match self {
            Self::Registered { name } | Self::Updated { name, .. } | Self::Removed { name, .. } => {
                name
            }
        }
    }
}

/// Reason why a node left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The node unregistered itself.
    Explicit,

    /// The node's registry connection dropped.
    Disconnected,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "unregistered"),
            Self::Disconnected => write!(f, "connection dropped"),
        }
    }
}
