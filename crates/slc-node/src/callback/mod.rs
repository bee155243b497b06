//! Control callbacks: the device-specific part of a node.
//!
//! The runner owns exactly one callback and drives it from a single task, so
//! hooks never run concurrently with each other:
//!
//! ```text
//!   on_initialize ──▶ initial record (failure: node does not start)
//!        │
//!        ▼
//!   ┌─────────┐  tick timer   ┌──────────┐
//!   │  loop   │──────────────▶│ on_tick  │  failure: warn, skip, keep record
//!   │         │  inbox        ┌──────────┐
//!   │         │──────────────▶│on_command│  failure: CommandResult::Err
//!   └─────────┘               └──────────┘
//!        │ shutdown
//!        ▼
//!   on_terminate
//! ```
//!
//! Hooks receive a working copy of the record. The runner commits it only
//! when the hook succeeds.

mod hv;
mod readout;

pub use hv::HvCallback;
pub use readout::ReadoutCallback;

use async_trait::async_trait;

use slc_core::command::parse_config_id;
use slc_core::{
    Command, CommandAck, CommandError, CommandResult, NodeIdentity, NodeState, PublishableStatus,
    RecordKind, StatusRecord,
};

use crate::error::CallbackError;
use crate::hardware::{LinkMonitor, MonitorSource, SimulatedMonitor};
use crate::settings::{LinkSetting, NodeSettings};

/// Device logic plugged into the node run loop.
#[async_trait]
pub trait ControlCallback: Send {
    /// Record variant this callback produces.
    fn kind(&self) -> RecordKind;

    /// Produces the initial record. Failure is fatal to the node.
    async fn on_initialize(&mut self, identity: &NodeIdentity)
        -> Result<StatusRecord, CallbackError>;

    /// Refreshes the record from hardware.
    async fn on_tick(&mut self, record: &mut StatusRecord) -> Result<(), CallbackError>;

    /// Applies a command. Unknown verbs fail with `CommandError::Unsupported`.
    async fn on_command(&mut self, command: &Command, record: &mut StatusRecord) -> CommandResult;

    /// Called once on shutdown with the last committed record.
    async fn on_terminate(&mut self, _record: &mut StatusRecord) {}
}

/// Builds the callback selected by `node.kind`.
pub fn build(settings: &NodeSettings) -> Box<dyn ControlCallback> {
    let monitor: Box<dyn MonitorSource> = match &settings.link {
        LinkSetting::Simulated { setpoint } => Box::new(SimulatedMonitor::new(*setpoint)),
        LinkSetting::Endpoint(endpoint) => Box::new(LinkMonitor::new(endpoint.clone())),
    };

    match settings.kind {
        RecordKind::Hv => Box::new(HvCallback::new(monitor, settings.channels)),
        RecordKind::Readout => Box::new(ReadoutCallback::new(monitor, settings.channels)),
    }
}

/// Handles the verbs every node understands.
///
/// Returns `None` when `command` is not one of them.
///
/// - `configure <cfgN>`: `config_id = N`, state `READY`; N must not decrease
/// - `recover`: `ERROR` to `READY`
/// - `reset`: state `OFFLINE`, `config_id = 0`
pub fn apply_common_verb(command: &Command, record: &mut StatusRecord) -> Option<CommandResult> {
    let result = match command.verb.as_str() {
        "configure" => configure(command, record),
        "recover" => {
            if record.state() != NodeState::Error {
                Err(CommandError::rejected(
                    command,
                    format!("node is {}, not ERROR", record.state()),
                ))
            } else {
                record.set_state(NodeState::Ready);
                Ok(CommandAck::ok())
            }
        }
        "reset" => {
            record.set_state(NodeState::Offline);
            record.set_config_id(0);
            Ok(CommandAck::ok())
        }
        _ => return None,
    };
    Some(result)
}

fn configure(command: &Command, record: &mut StatusRecord) -> CommandResult {
    let raw = command.require_arg(0, "configuration")?;
    let id = parse_config_id(raw).ok_or_else(|| CommandError::BadArguments {
        verb: command.verb.clone(),
        reason: format!("'{raw}' is not a configuration name"),
    })?;

    if record.state() == NodeState::Running {
        return Err(CommandError::rejected(command, "node is RUNNING"));
    }
    if id < record.config_id() {
        return Err(CommandError::rejected(
            command,
            format!("configuration {id} is older than active {}", record.config_id()),
        ));
    }

    record.set_config_id(id);
    record.set_state(NodeState::Ready);
    Ok(CommandAck::with_message(format!("cfg{id}")))
}

/// Rejects `command` unless the node is in one of `allowed`.
pub(crate) fn require_state(
    command: &Command,
    record: &StatusRecord,
    allowed: &[NodeState],
) -> Result<(), CommandError> {
    if allowed.contains(&record.state()) {
        return Ok(());
    }
    Err(CommandError::rejected(
        command,
        format!("not allowed in state {}", record.state()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slc_core::NodeName;

    fn cmd(verb: &str, args: &[&str]) -> Command {
        Command::new(
            NodeName::new("HV_ARICH").unwrap(),
            verb,
            args.iter().map(|a| a.to_string()).collect(),
        )
    }

    fn record() -> StatusRecord {
        StatusRecord::allocate(RecordKind::Hv, 2).unwrap()
    }

    #[test]
    fn test_configure_sets_id_and_ready() {
        let mut rec = record();
        let ack = apply_common_verb(&cmd("configure", &["cfg17"]), &mut rec)
            .unwrap()
            .unwrap();
        assert_eq!(ack.message.as_deref(), Some("cfg17"));
        assert_eq!(rec.config_id(), 17);
        assert_eq!(rec.state(), NodeState::Ready);
    }

    #[test]
    fn test_configure_never_rolls_back() {
        let mut rec = record();
        rec.set_config_id(20);
        let err = apply_common_verb(&cmd("configure", &["cfg17"]), &mut rec)
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CommandError::Rejected { .. }));
        assert_eq!(rec.config_id(), 20);
    }

    #[test]
    fn test_configure_bad_arguments() {
        let mut rec = record();
        let err = apply_common_verb(&cmd("configure", &[]), &mut rec)
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CommandError::BadArguments { .. }));

        let err = apply_common_verb(&cmd("configure", &["latest"]), &mut rec)
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CommandError::BadArguments { .. }));
    }

    #[test]
    fn test_recover_only_from_error() {
        let mut rec = record();
        assert!(apply_common_verb(&cmd("recover", &[]), &mut rec)
            .unwrap()
            .is_err());

        rec.set_state(NodeState::Error);
        assert!(apply_common_verb(&cmd("recover", &[]), &mut rec)
            .unwrap()
            .is_ok());
        assert_eq!(rec.state(), NodeState::Ready);
    }

    #[test]
    fn test_reset_clears_config() {
        let mut rec = record();
        rec.set_config_id(9);
        rec.set_state(NodeState::Ready);
        apply_common_verb(&cmd("reset", &[]), &mut rec).unwrap().unwrap();
        assert_eq!(rec.config_id(), 0);
        assert_eq!(rec.state(), NodeState::Offline);
    }

    #[test]
    fn test_unknown_verb_is_not_common() {
        let mut rec = record();
        assert!(apply_common_verb(&cmd("turnon", &[]), &mut rec).is_none());
    }

    #[test]
    fn test_build_selects_by_kind() {
        let name = NodeName::new("ropc01").unwrap();
        let settings = NodeSettings::new(name, RecordKind::Readout, 4);
        assert_eq!(build(&settings).kind(), RecordKind::Readout);
    }
}
