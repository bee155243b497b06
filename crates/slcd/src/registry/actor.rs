//! Registry actor - owns all node snapshots and processes commands.
//!
//! The RegistryActor is the single owner of registry state. It receives
//! commands via an mpsc channel and publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use slc_core::{NodeName, PublishableStatus, StatusRecord};
use slc_protocol::NodeSnapshot;

use super::commands::{
    CommandInbox, PendingCommand, Registration, RegistryCommand, RegistryError, RemovalReason,
    StatusEvent,
};

// ============================================================================
// Resource Limits
// ============================================================================

/// Maximum number of nodes the registry can hold.
pub const MAX_NODES: usize = 256;

/// Capacity of each node's command inbox.
pub const INBOX_BUFFER: usize = 16;

// ============================================================================
// Registry Actor
// ============================================================================

struct NodeEntry {
    token: u64,
    record: StatusRecord,
    inbox: mpsc::Sender<PendingCommand>,
    registered_at: DateTime<Utc>,
    publications: u64,
}

/// The registry actor - owns all node state.
///
/// Commands are processed sequentially in one task, so every publication
/// for a node is applied in the order it was sent.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    nodes: HashMap<NodeName, NodeEntry>,

    /// Source of registration tokens; never reused within a process
    next_token: u64,

    event_publisher: broadcast::Sender<StatusEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<StatusEvent>,
    ) -> Self {
        Self {
            receiver,
            nodes: HashMap::new(),
            next_token: 1,
            event_publisher,
        }
    }

    /// Runs the actor event loop until all senders are dropped.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(nodes = self.nodes.len(), "Registry actor stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                name,
                record,
                respond_to,
            } => {
                let result = self.handle_register(name, *record);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Publish {
                registration,
                record,
                respond_to,
            } => {
                let result = self.handle_publish(&registration, *record);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Lookup { name, respond_to } => {
                let _ = respond_to.send(self.nodes.get(&name).map(|e| e.record.clone()));
            }
            RegistryCommand::List { respond_to } => {
                let _ = respond_to.send(self.handle_list());
            }
            RegistryCommand::Unregister {
                registration,
                reason,
                respond_to,
            } => {
                let removed = self.handle_unregister(&registration, reason);
                let _ = respond_to.send(removed);
            }
            RegistryCommand::ResolveInbox { name, respond_to } => {
                let result = self
                    .nodes
                    .get(&name)
                    .map(|e| e.inbox.clone())
                    .ok_or_else(|| RegistryError::NotFound(name.to_string()));
                let _ = respond_to.send(result);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(
        &mut self,
        name: NodeName,
        record: StatusRecord,
    ) -> Result<(Registration, CommandInbox), RegistryError> {
        if self.nodes.contains_key(&name) {
            debug!(node = %name, "Node already registered, rejecting registration");
            return Err(RegistryError::DuplicateNode(name));
        }

        if self.nodes.len() >= MAX_NODES {
            warn!(
                node = %name,
                current = self.nodes.len(),
                max = MAX_NODES,
                "Registry is full, rejecting registration"
            );
            return Err(RegistryError::RegistryFull { max: MAX_NODES });
        }

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_BUFFER);
        info!(
            node = %name,
            kind = %record.kind(),
            state = %record.state(),
            config_id = record.config_id(),
            total_nodes = self.nodes.len() + 1,
            "Node registered"
        );
        self.nodes.insert(
            name.clone(),
            NodeEntry {
                token,
                record,
                inbox: inbox_tx,
                registered_at: Utc::now(),
                publications: 0,
            },
        );

        // Publish event (ignore if no subscribers)
        let _ = self
            .event_publisher
            .send(StatusEvent::Registered { name: name.clone() });

        Ok((Registration::new(name, token), inbox_rx))
    }

    fn handle_publish(
        &mut self,
        registration: &Registration,
        record: StatusRecord,
    ) -> Result<(), RegistryError> {
        let entry = match self.nodes.get_mut(registration.name()) {
            Some(entry) if entry.token == registration.token() => entry,
            _ => {
                debug!(node = %registration.name(), "Publish with stale registration");
                return Err(RegistryError::NotFound(registration.name().to_string()));
            }
        };

        if entry.record == record {
            return Ok(());
        }

        entry.record = record.clone();
        entry.publications = entry.publications.saturating_add(1);
        debug!(
            node = %registration.name(),
            state = %record.state(),
            config_id = record.config_id(),
            publications = entry.publications,
            "Snapshot updated"
        );

        let _ = self.event_publisher.send(StatusEvent::Updated {
            name: registration.name().clone(),
            record: Box::new(record),
        });
        Ok(())
    }

    fn handle_list(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<NodeSnapshot> = self
            .nodes
            .iter()
            .map(|(name, e)| NodeSnapshot {
                name: name.clone(),
                record: e.record.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    fn handle_unregister(&mut self, registration: &Registration, reason: RemovalReason) -> bool {
        let live = self
            .nodes
            .get(registration.name())
            .is_some_and(|e| e.token == registration.token());
        if !live {
            debug!(node = %registration.name(), "Unregister of stale registration ignored");
            return false;
        }

        if let Some(entry) = self.nodes.remove(registration.name()) {
            let uptime = Utc::now().signed_duration_since(entry.registered_at);
            info!(
                node = %registration.name(),
                reason = %reason,
                uptime_secs = uptime.num_seconds(),
                remaining_nodes = self.nodes.len(),
                "Node removed"
            );
        }

        let _ = self.event_publisher.send(StatusEvent::Removed {
            name: registration.name().clone(),
            reason,
        });
        true
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slc_core::{NodeState, RecordKind};
    use tokio::sync::oneshot;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    fn record(config_id: u32) -> StatusRecord {
        let mut r = StatusRecord::allocate(RecordKind::Hv, 4).unwrap();
        r.set_config_id(config_id);
        r
    }

    fn create_actor() -> (RegistryActor, broadcast::Receiver<StatusEvent>) {
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        (RegistryActor::new(cmd_rx, event_tx), event_rx)
    }

    fn register(actor: &mut RegistryActor, n: &str) -> Result<(Registration, CommandInbox), RegistryError> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Register {
            name: name(n),
            record: Box::new(record(0)),
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn publish(actor: &mut RegistryActor, reg: &Registration, r: StatusRecord) -> Result<(), RegistryError> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Publish {
            registration: reg.clone(),
            record: Box::new(r),
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn unregister(actor: &mut RegistryActor, reg: &Registration) -> bool {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Unregister {
            registration: reg.clone(),
            reason: RemovalReason::Explicit,
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn lookup(actor: &mut RegistryActor, n: &str) -> Option<StatusRecord> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Lookup {
            name: name(n),
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_register_publishes_event() {
        let (mut actor, mut events) = create_actor();
        register(&mut actor, "HV_ARICH").unwrap();

        assert_eq!(actor.node_count(), 1);
        let event = events.try_recv().unwrap();
        assert!(matches!(event, StatusEvent::Registered { .. }));
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let (mut actor, _events) = create_actor();
        register(&mut actor, "HV_ARICH").unwrap();
        let err = register(&mut actor, "HV_ARICH").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateNode(_)));
        assert_eq!(actor.node_count(), 1);
    }

    #[tokio::test]
    async fn test_reregister_after_unregister() {
        let (mut actor, _events) = create_actor();
        let (reg, _inbox) = register(&mut actor, "HV_ARICH").unwrap();
        assert!(unregister(&mut actor, &reg));
        assert!(!unregister(&mut actor, &reg));

        let (reg2, _inbox2) = register(&mut actor, "HV_ARICH").unwrap();
        assert_ne!(reg.token(), reg2.token());
    }

    #[tokio::test]
    async fn test_stale_registration_cannot_touch_newer() {
        let (mut actor, _events) = create_actor();
        let (old, _inbox) = register(&mut actor, "HV_ARICH").unwrap();
        unregister(&mut actor, &old);
        let (_new, _inbox2) = register(&mut actor, "HV_ARICH").unwrap();

        assert!(!unregister(&mut actor, &old));
        assert!(matches!(
            publish(&mut actor, &old, record(5)),
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(actor.node_count(), 1);
        assert_eq!(lookup(&mut actor, "HV_ARICH").unwrap().config_id(), 0);
    }

    #[tokio::test]
    async fn test_identical_publish_emits_no_event() {
        let (mut actor, mut events) = create_actor();
        let (reg, _inbox) = register(&mut actor, "HV_ARICH").unwrap();
        let _ = events.try_recv();

        let mut r = record(17);
        r.set_state(NodeState::Ready);
        publish(&mut actor, &reg, r.clone()).unwrap();
        assert!(matches!(events.try_recv(), Ok(StatusEvent::Updated { .. })));

        publish(&mut actor, &reg, r.clone()).unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(lookup(&mut actor, "HV_ARICH"), Some(r));
    }

    #[tokio::test]
    async fn test_max_nodes_limit() {
        let (mut actor, _events) = create_actor();
        let mut inboxes = Vec::new();
        for i in 0..MAX_NODES {
            inboxes.push(register(&mut actor, &format!("N{i}")).unwrap());
        }
        let err = register(&mut actor, "ONE_MORE").unwrap_err();
        assert!(matches!(err, RegistryError::RegistryFull { max: MAX_NODES }));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (mut actor, _events) = create_actor();
        let _b = register(&mut actor, "B").unwrap();
        let _a = register(&mut actor, "A").unwrap();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::List { respond_to: tx });
        let names: Vec<String> = rx
            .try_recv()
            .unwrap()
            .into_iter()
            .map(|s| s.name.to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_resolve_inbox() {
        let (mut actor, _events) = create_actor();
        let (_reg, mut inbox) = register(&mut actor, "HV_ARICH").unwrap();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::ResolveInbox {
            name: name("HV_ARICH"),
            respond_to: tx,
        });
        let sender = rx.try_recv().unwrap().unwrap();

        let (reply_tx, _reply_rx) = oneshot::channel();
        sender
            .try_send(PendingCommand {
                command: slc_core::Command::new(name("HV_ARICH"), "turnon", vec![]),
                respond_to: reply_tx,
            })
            .unwrap();
        assert_eq!(inbox.recv().await.unwrap().command.verb, "turnon");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::ResolveInbox {
            name: name("NOBODY"),
            respond_to: tx,
        });
        assert!(matches!(rx.try_recv().unwrap(), Err(RegistryError::NotFound(_))));
    }
}
