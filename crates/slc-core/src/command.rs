//! Commands addressed to running nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Fault, FaultKind};
use crate::node::NodeName;

/// Prefix of configuration snapshot names accepted by `configure`.
pub const CONFIG_PREFIX: &str = "cfg";

/// A request addressed to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub target: NodeName,
    pub verb: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Command {
    pub fn new(target: NodeName, verb: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            target,
            verb: verb.into(),
            args,
        }
    }

    /// Builds a command from a whitespace-separated `"verb arg..."` line.
    ///
    /// Returns `None` for a blank line.
    pub fn parse_line(target: NodeName, line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next()?;
        Some(Self::new(target, verb, parts.map(str::to_string).collect()))
    }

    /// Returns the argument at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Returns the argument at `index` or a `BadArguments` error naming it.
    pub fn require_arg(&self, index: usize, what: &str) -> Result<&str, CommandError> {
        self.arg(index).ok_or_else(|| CommandError::BadArguments {
            verb: self.verb.clone(),
            reason: format!("missing {what}"),
        })
    }

    /// Parses the argument at `index` as a number.
    pub fn numeric_arg<T: std::str::FromStr>(
        &self,
        index: usize,
        what: &str,
    ) -> Result<T, CommandError> {
        let raw = self.require_arg(index, what)?;
        raw.parse().map_err(|_| CommandError::BadArguments {
            verb: self.verb.clone(),
            reason: format!("{what} '{raw}' is not a number"),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Parses a configuration snapshot name such as `cfg17` into its id.
///
/// A bare number is accepted as well.
pub fn parse_config_id(name: &str) -> Option<u32> {
    name.strip_prefix(CONFIG_PREFIX).unwrap_or(name).parse().ok()
}

/// Successful command outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandAck {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// Failed command outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum CommandError {
    /// The node does not understand the verb.
    #[error("unsupported command '{verb}'")]
    Unsupported { verb: String },

    /// Arguments are missing or malformed.
    #[error("bad arguments for '{verb}': {reason}")]
    BadArguments { verb: String, reason: String },

    /// The command is not valid in the node's current state.
    #[error("'{verb}' rejected: {reason}")]
    Rejected { verb: String, reason: String },

    /// The command was attempted but failed.
    #[error("command failed: {reason}")]
    Failed { reason: String },

    /// The command did not complete within the command timeout.
    #[error("'{verb}' timed out after {timeout_ms} ms")]
    TimedOut { verb: String, timeout_ms: u64 },

    /// No node is registered under the target name.
    #[error("node '{target}' not found")]
    NotFound { target: String },

    /// The command could not be delivered.
    #[error("command not delivered: {reason}")]
    Unreachable { reason: String },
}

impl CommandError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Unsupported { .. } => FaultKind::UnsupportedCommand,
            Self::NotFound { .. } => FaultKind::NotFound,
            Self::Unreachable { .. } => FaultKind::Connection,
            Self::BadArguments { .. }
            | Self::Rejected { .. }
            | Self::Failed { .. }
            | Self::TimedOut { .. } => FaultKind::CommandFailure,
        }
    }

    pub fn unsupported(cmd: &Command) -> Self {
        Self::Unsupported {
            verb: cmd.verb.clone(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }

    pub fn rejected(cmd: &Command, reason: impl Into<String>) -> Self {
        Self::Rejected {
            verb: cmd.verb.clone(),
            reason: reason.into(),
        }
    }
}

impl From<CommandError> for Fault {
    fn from(err: CommandError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

/// Outcome of handling a [`Command`].
pub type CommandResult = Result<CommandAck, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> NodeName {
        NodeName::new("HV_ARICH").unwrap()
    }

    #[test]
    fn test_parse_line() {
        let cmd = Command::parse_line(target(), "  start 12  345 ").unwrap();
        assert_eq!(cmd.verb, "start");
        assert_eq!(cmd.args, vec!["12", "345"]);
        assert!(Command::parse_line(target(), "   ").is_none());
    }

    #[test]
    fn test_display() {
        let cmd = Command::new(target(), "configure", vec!["cfg17".into()]);
        assert_eq!(cmd.to_string(), "HV_ARICH: configure cfg17");
    }

    #[test]
    fn test_parse_config_id() {
        assert_eq!(parse_config_id("cfg17"), Some(17));
        assert_eq!(parse_config_id("42"), Some(42));
        assert_eq!(parse_config_id("cfg"), None);
        assert_eq!(parse_config_id("cfgX"), None);
    }

    #[test]
    fn test_numeric_arg() {
        let cmd = Command::new(target(), "start", vec!["12".into(), "abc".into()]);
        assert_eq!(cmd.numeric_arg::<u32>(0, "exp").unwrap(), 12);
        assert!(matches!(
            cmd.numeric_arg::<u32>(1, "run"),
            Err(CommandError::BadArguments { .. })
        ));
        assert!(matches!(
            cmd.numeric_arg::<u32>(2, "extra"),
            Err(CommandError::BadArguments { .. })
        ));
    }

    #[test]
    fn test_error_kinds() {
        let cmd = Command::new(target(), "frobnicate", vec![]);
        assert_eq!(
            CommandError::unsupported(&cmd).kind(),
            FaultKind::UnsupportedCommand
        );
        assert_eq!(
            CommandError::failed("x").kind(),
            FaultKind::CommandFailure
        );
        let fault: Fault = CommandError::NotFound {
            target: "X".into(),
        }
        .into();
        assert_eq!(fault.kind, FaultKind::NotFound);
    }

    #[test]
    fn test_result_serde() {
        let result: CommandResult = Err(CommandError::Unsupported {
            verb: "frobnicate".into(),
        });
        let json = serde_json::to_string(&result).unwrap();
        let back: CommandResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
