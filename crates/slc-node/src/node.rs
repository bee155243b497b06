//! The stock run hook: one node, one loop.
//!
//! [`NodeRunner`] starts a node in this order and fails the startup on the
//! first fault:
//!
//! 1. connect the registry (in-process or the `slcd` socket)
//! 2. `on_initialize`, bounded by the command timeout, then restore the
//!    persisted `config_id`; a shutdown request here stops the node cleanly
//! 3. start the helper process, if configured
//! 4. register and go `Running`
//!
//! Then one task multiplexes everything with a biased `select!`:
//! cancellation, then the command inbox, then the tick timer, then the
//! helper supervisor. Tick and command handling therefore never overlap,
//! and every publication of this node is ordered.
//!
//! Losing the registry does not stop the node. It keeps ticking detached
//! and registers again on a later tick, once the registry answers.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` outside tests
//! - Callback faults never unwind the loop; they are logged or returned as
//!   `CommandResult`

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use slc_core::store::record_path;
use slc_core::{
    load_record, save_record, Command, CommandError, CommandResult, Fault, NodeIdentity,
    PublishableStatus, StatusRecord,
};
use slcd::registry::{spawn_registry, CommandInbox, PendingCommand, Registration, RegistryError};

use crate::callback::{self, ControlCallback};
use crate::client::RemoteRegistry;
use crate::daemon::{DaemonContext, DaemonState, RunHook};
use crate::error::{CallbackError, NodeError};
use crate::registry::StatusRegistry;
use crate::settings::{NodeSettings, RegistrySetting};
use crate::supervisor::{spawn_helper, ChildExit, ProcessSupervisor};

/// Runs a node described by [`NodeSettings`].
pub struct NodeRunner {
    settings: NodeSettings,
    callback: Box<dyn ControlCallback>,
    registry: Option<Arc<dyn StatusRegistry>>,
}

impl NodeRunner {
    /// Builds the runner with the callback selected by `settings.kind`.
    pub fn new(settings: NodeSettings) -> Self {
        let callback = callback::build(&settings);
        Self {
            settings,
            callback,
            registry: None,
        }
    }

    /// Replaces the configured callback.
    pub fn with_callback(mut self, callback: Box<dyn ControlCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Publishes to `registry` instead of the one named in the settings.
    pub fn with_registry(mut self, registry: Arc<dyn StatusRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Carries the last persisted `config_id` over a restart.
    fn restore(&self, record: &mut StatusRecord) {
        let Some(dir) = &self.settings.state_dir else {
            return;
        };
        let path = record_path(dir, &self.settings.name);
        let Some(saved) = load_record(&path) else {
            return;
        };
        if saved.config_id() > record.config_id() {
            info!(
                node = %self.settings.name,
                config_id = saved.config_id(),
                "Restored configuration id"
            );
            record.set_config_id(saved.config_id());
        }
    }

    fn persist(&self, record: &StatusRecord) {
        let Some(dir) = &self.settings.state_dir else {
            return;
        };
        let path = record_path(dir, &self.settings.name);
        match save_record(&path, record) {
            Ok(()) => debug!(path = %path.display(), "Record saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to save record"),
        }
    }

    /// Runs one tick against a working copy. Failures keep the last record.
    ///
    /// Returns `true` when the record changed and should be published.
    async fn tick(&mut self, record: &mut StatusRecord) -> bool {
        let mut working = record.clone();
        let limit = self.settings.tick_timeout;

        match timeout(limit, self.callback.on_tick(&mut working)).await {
            Ok(Ok(())) if record.same_layout(&working) => {
                *record = working;
                true
            }
            Ok(Ok(())) => {
                warn!(node = %self.settings.name, "Tick changed the record layout, skipped");
                false
            }
            Ok(Err(e)) => {
                warn!(node = %self.settings.name, fault = %Fault::from(e), "Tick failed, skipped");
                false
            }
            Err(_) => {
                warn!(node = %self.settings.name, timeout = ?limit, "Tick timed out, skipped");
                false
            }
        }
    }

    /// Applies one command against a working copy, committed only on success.
    async fn command(&mut self, command: &Command, record: &mut StatusRecord) -> CommandResult {
        let mut working = record.clone();
        let limit = self.settings.command_timeout;
        let result = match timeout(limit, self.callback.on_command(command, &mut working)).await {
            Ok(result) => result.and_then(|ack| {
                check_command_result(command, record, &working)?;
                Ok(ack)
            }),
            Err(_) => Err(CommandError::TimedOut {
                verb: command.verb.clone(),
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match &result {
            Ok(_) => {
                info!(
                    node = %self.settings.name,
                    verb = %command.verb,
                    state = %working.state(),
                    config_id = working.config_id(),
                    "Command applied"
                );
                *record = working;
            }
            Err(e) => {
                warn!(node = %self.settings.name, verb = %command.verb, error = %e, "Command failed");
            }
        }
        result
    }
}

/// A live registration and the inbox that comes with it.
struct Attachment {
    registration: Registration,
    inbox: CommandInbox,
}

async fn attach(
    registry: &Arc<dyn StatusRegistry>,
    identity: &NodeIdentity,
    record: &StatusRecord,
    ctx: &mut DaemonContext,
) -> Result<Attachment, RegistryError> {
    let (registration, inbox) = registry.register(identity, record.clone()).await?;
    ctx.set_registration(Arc::clone(registry), registration.clone());
    Ok(Attachment {
        registration,
        inbox,
    })
}

/// Registers a detached node again; `None` while the registry is away.
async fn reattach(
    registry: &Arc<dyn StatusRegistry>,
    identity: &NodeIdentity,
    record: &StatusRecord,
    ctx: &mut DaemonContext,
) -> Option<Attachment> {
    match attach(registry, identity, record, ctx).await {
        Ok(attached) => {
            info!(node = %identity, config_id = record.config_id(), "Registered again");
            Some(attached)
        }
        Err(e) => {
            debug!(node = %identity, error = %e, "Registry still unavailable");
            None
        }
    }
}

fn detach(attachment: &mut Option<Attachment>, ctx: &mut DaemonContext, reason: &RegistryError) {
    if let Some(attached) = attachment.take() {
        warn!(
            node = %attached.registration.name(),
            error = %reason,
            "Registry link lost, node keeps running detached"
        );
    }
    ctx.clear_registration();
}

/// Publishes `record` when attached. A failed publish detaches the node.
async fn publish(
    registry: &dyn StatusRegistry,
    attachment: &mut Option<Attachment>,
    ctx: &mut DaemonContext,
    record: &StatusRecord,
) {
    let Some(attached) = attachment.as_ref() else {
        return;
    };
    if let Err(e) = registry.publish(&attached.registration, record.clone()).await {
        detach(attachment, ctx, &e);
    }
}

async fn next_command(attachment: &mut Option<Attachment>) -> Option<PendingCommand> {
    match attachment {
        Some(attached) => attached.inbox.recv().await,
        None => std::future::pending().await,
    }
}

/// Rejects results that roll the configuration back or change the layout.
fn check_command_result(
    command: &Command,
    before: &StatusRecord,
    after: &StatusRecord,
) -> Result<(), CommandError> {
    if !before.same_layout(after) {
        return Err(CommandError::failed(format!(
            "{} changed the record layout",
            command.verb
        )));
    }
    if after.config_id() < before.config_id() && command.verb != "reset" {
        return Err(CommandError::rejected(
            command,
            format!(
                "configuration id would go back from {} to {}",
                before.config_id(),
                after.config_id()
            ),
        ));
    }
    Ok(())
}

async fn connect_registry(
    settings: &NodeSettings,
    injected: Option<Arc<dyn StatusRegistry>>,
) -> Result<Arc<dyn StatusRegistry>, NodeError> {
    if let Some(registry) = injected {
        return Ok(registry);
    }
    match &settings.registry {
        RegistrySetting::Local => {
            debug!("Using in-process registry");
            Ok(Arc::new(spawn_registry()))
        }
        RegistrySetting::Socket(path) => {
            let client_id = Some(settings.name.to_string());
            Ok(Arc::new(RemoteRegistry::connect(path, client_id).await?))
        }
    }
}

async fn helper_exit(supervisor: &mut Option<ProcessSupervisor>) -> Option<ChildExit> {
    match supervisor {
        Some(supervisor) => supervisor.exited().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl RunHook for NodeRunner {
    async fn run(&mut self, ctx: &mut DaemonContext) -> Result<(), NodeError> {
        let identity = NodeIdentity::new(self.settings.name.clone());
        let registry = connect_registry(&self.settings, self.registry.clone()).await?;
        let cancel = ctx.cancel_token().clone();

        let init_limit = self.settings.command_timeout;
        let initialized = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(node = %identity, "Shutdown requested during initialization");
                return Ok(());
            }

            result = timeout(init_limit, self.callback.on_initialize(&identity)) => result,
        };
        let mut record = initialized
            .map_err(|_| {
                NodeError::Initialize(CallbackError::TimedOut {
                    hook: "on_initialize",
                    after: init_limit,
                })
            })?
            .map_err(NodeError::Initialize)?;
        self.restore(&mut record);

        let helper_cancel = cancel.child_token();
        let mut supervisor = match &self.settings.helper {
            Some(spec) => {
                let child = spawn_helper(spec)?;
                Some(ProcessSupervisor::spawn(child, spec.label(), helper_cancel.clone()))
            }
            None => None,
        };
        let helper_required = self.settings.helper.as_ref().is_some_and(|h| h.required);

        let mut attachment = Some(attach(&registry, &identity, &record, ctx).await?);
        ctx.transition(DaemonState::Running)?;

        info!(
            node = %identity,
            kind = %self.callback.kind(),
            state = %record.state(),
            config_id = record.config_id(),
            tick = ?self.settings.tick,
            "Node running"
        );

        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; initialization just read the hardware
        ticker.tick().await;

        let outcome: Result<(), NodeError> = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(node = %identity, "Shutdown requested");
                    break Ok(());
                }

                pending = next_command(&mut attachment) => {
                    let Some(pending) = pending else {
                        let closed = RegistryError::Connection("command inbox closed".to_string());
                        detach(&mut attachment, ctx, &closed);
                        continue;
                    };
                    let result = self.command(&pending.command, &mut record).await;
                    if result.is_ok() {
                        publish(&*registry, &mut attachment, ctx, &record).await;
                    }
                    pending.reply(result);
                }

                _ = ticker.tick() => {
                    if self.tick(&mut record).await {
                        publish(&*registry, &mut attachment, ctx, &record).await;
                    }
                    if attachment.is_none() {
                        attachment = reattach(&registry, &identity, &record, ctx).await;
                    }
                }

                Some(exit) = helper_exit(&mut supervisor) => {
                    if helper_required {
                        break Err(NodeError::HelperDied {
                            label: exit.label,
                            cause: exit.cause.to_string(),
                        });
                    }
                    warn!(node = %identity, helper = %exit.label, cause = %exit.cause, "Optional helper gone");
                }
            }
        };

        if outcome.is_ok() {
            ctx.transition(DaemonState::Stopping)?;
        }

        self.callback.on_terminate(&mut record).await;
        self.persist(&record);

        helper_cancel.cancel();
        if let Some(supervisor) = supervisor {
            supervisor.join().await;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slc_core::{NodeName, RecordKind};

    fn cmd(verb: &str) -> Command {
        Command::new(NodeName::new("HV_ARICH").unwrap(), verb, Vec::new())
    }

    #[test]
    fn test_command_result_rollback_rejected_unless_reset() {
        let mut before = StatusRecord::allocate(RecordKind::Hv, 2).unwrap();
        before.set_config_id(5);
        let mut after = before.clone();
        after.set_config_id(0);

        let err = check_command_result(&cmd("turnoff"), &before, &after).unwrap_err();
        assert!(matches!(err, CommandError::Rejected { .. }));
        assert!(check_command_result(&cmd("reset"), &before, &after).is_ok());
    }

    #[test]
    fn test_command_result_layout_change_rejected() {
        let before = StatusRecord::allocate(RecordKind::Hv, 2).unwrap();
        let after = StatusRecord::allocate(RecordKind::Hv, 3).unwrap();
        let err = check_command_result(&cmd("turnon"), &before, &after).unwrap_err();
        assert!(matches!(err, CommandError::Failed { .. }));
    }

    #[test]
    fn test_new_runner_uses_configured_kind() {
        let settings = NodeSettings::new(NodeName::new("ropc01").unwrap(), RecordKind::Readout, 2);
        let runner = NodeRunner::new(settings);
        assert_eq!(runner.callback.kind(), RecordKind::Readout);
        assert_eq!(runner.settings().channels, 2);
    }
}
