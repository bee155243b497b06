//! The registry seam of a node.
//!
//! A node only needs register, publish, lookup and unregister. Both the
//! in-process [`RegistryHandle`] and the socket-backed
//! [`RemoteRegistry`](crate::client::RemoteRegistry) implement
//! [`StatusRegistry`], so the runner is the same either way.

use async_trait::async_trait;

use slc_core::{Command, CommandResult, NodeIdentity, NodeName, StatusRecord};
use slc_protocol::NodeSnapshot;
use slcd::registry::{CommandInbox, Registration, RegistryError, RegistryHandle};

#[async_trait]
pub trait StatusRegistry: Send + Sync {
    /// Registers `identity` with its initial record.
    ///
    /// Returns the registration and the inbox commands for this node arrive on.
    async fn register(
        &self,
        identity: &NodeIdentity,
        initial: StatusRecord,
    ) -> Result<(Registration, CommandInbox), RegistryError>;

    /// Replaces the published snapshot. No observer acknowledgement.
    async fn publish(
        &self,
        registration: &Registration,
        record: StatusRecord,
    ) -> Result<(), RegistryError>;

    async fn lookup(&self, name: &NodeName) -> Result<StatusRecord, RegistryError>;

    /// Idempotent; `Ok(false)` when nothing was removed.
    async fn unregister(&self, registration: &Registration) -> Result<bool, RegistryError>;

    async fn list(&self) -> Result<Vec<NodeSnapshot>, RegistryError>;

    async fn send_command(&self, command: Command) -> CommandResult;
}

#[async_trait]
impl StatusRegistry for RegistryHandle {
    async fn register(
        &self,
        identity: &NodeIdentity,
        initial: StatusRecord,
    ) -> Result<(Registration, CommandInbox), RegistryError> {
        RegistryHandle::register(self, identity.name().clone(), initial).await
    }

    async fn publish(
        &self,
        registration: &Registration,
        record: StatusRecord,
    ) -> Result<(), RegistryError> {
        RegistryHandle::publish(self, registration, record).await
    }

    async fn lookup(&self, name: &NodeName) -> Result<StatusRecord, RegistryError> {
        RegistryHandle::lookup(self, name).await
    }

    async fn unregister(&self, registration: &Registration) -> Result<bool, RegistryError> {
        RegistryHandle::unregister(self, registration).await
    }

    async fn list(&self) -> Result<Vec<NodeSnapshot>, RegistryError> {
        Ok(RegistryHandle::list(self).await)
    }

    async fn send_command(&self, command: Command) -> CommandResult {
        RegistryHandle::send_command(self, command).await
    }
}
