//! Node status registry using the Actor pattern.
//!
//! The registry holds the latest published snapshot of every registered
//! node. It receives commands via a tokio mpsc channel, answers over oneshot
//! channels and broadcasts changes to subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  Node / Client  │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                        │
//!         │   RegistryCommand     │   StatusEvent          │
//!         │   (mpsc channel)      │   (broadcast)          │
//!         ▼                       ▼                        ▼
//!  Register/Publish       HashMap<NodeName,          Subscribers
//!  Lookup/Unregister        NodeEntry>             (slcctl watch)
//! ```
//!
//! Commands addressed to a node travel through that node's `CommandInbox`,
//! handed out at registration.
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, INBOX_BUFFER, MAX_NODES};
pub use commands::{
    CommandInbox, PendingCommand, Registration, RegistryCommand, RegistryError, RemovalReason,
    StatusEvent,
};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// Must be called from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use slcd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry();
///     let nodes = handle.list().await;
/// }
/// ```
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
