//! Fault values shared by every layer.
//!
//! Each layer keeps its own `thiserror` enum (`TransportError`,
//! `RegistryError`, `CommandError`, `ConfigError`, ...). All of them expose a
//! coarse [`FaultKind`] and convert into a [`Fault`], the value-like
//! diagnostic the daemon lifecycle logs and maps to exit codes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a fault.
///
/// Callers decide retry policy by kind, never by the concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Endpoint could not be opened within the connect timeout.
    Connection,
    /// Peer closed the stream before the requested byte count arrived.
    ShortRead,
    /// Transport or filesystem fault.
    Io,
    /// A node with the same name is already registered.
    DuplicateNode,
    /// No node (or record) under the requested name.
    NotFound,
    /// The addressed node does not understand the command verb.
    UnsupportedCommand,
    /// The command was understood but could not be carried out.
    CommandFailure,
    /// A `(section, key)` pair is absent from the loaded configuration.
    ConfigKeyNotFound,
    /// Configuration could not be read or a value is malformed.
    Config,
    /// A binary status record could not be decoded.
    Decode,
    /// A control callback failed.
    Callback,
    /// Anything originating from the surrounding OS layer.
    Os,
}

impl FaultKind {
    /// Returns the diagnostic label of this kind.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connection => "ConnectionError",
            Self::ShortRead => "ShortReadError",
            Self::Io => "IOError",
            Self::DuplicateNode => "DuplicateNodeError",
            Self::NotFound => "NotFoundError",
            Self::UnsupportedCommand => "UnsupportedCommandError",
            Self::CommandFailure => "CommandFailure",
            Self::ConfigKeyNotFound => "ConfigKeyNotFoundError",
            Self::Config => "ConfigError",
            Self::Decode => "DecodeError",
            Self::Callback => "CallbackError",
            Self::Os => "IOException",
        }
    }

    /// Returns true for kinds that belong to the configuration layer.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigKeyNotFound | Self::Config)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A formatted diagnostic carrying only a kind and a message.
///
/// Displays as the single line `"<kind>: <message>"`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    /// Creates a fault of the given kind.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wraps an OS-level I/O error.
    pub fn os(context: &str, err: &std::io::Error) -> Self {
        Self::new(FaultKind::Os, format!("{context}: {err}"))
    }
}
