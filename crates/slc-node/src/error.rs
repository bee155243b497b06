//! Error types of the node framework.
//!
//! Every error exposes a coarse [`FaultKind`] and converts into a [`Fault`],
//! which is what the daemon lifecycle prints as its single diagnostic line.

use std::time::Duration;

use slc_core::{ChannelCountError, ConfigError, Fault, FaultKind, NodeNameError, StoreError};
use slcd::registry::RegistryError;
use thiserror::Error;

use crate::daemon::TransitionError;
use crate::transport::TransportError;

/// Failure raised by a control callback hook.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The hardware link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The hardware answered with something that cannot be used.
    #[error("bad monitor data: {0}")]
    BadData(String),

    /// The record could not be allocated.
    #[error(transparent)]
    Layout(#[from] ChannelCountError),

    /// The hook did not finish in time.
    #[error("{hook} did not finish within {after:?}")]
    TimedOut { hook: &'static str, after: Duration },

    /// Anything else the device logic wants to report.
    #[error("{0}")]
    Device(String),
}

impl CallbackError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::BadData(_) => FaultKind::Decode,
            Self::TimedOut { .. } => FaultKind::Io,
            Self::Layout(_) | Self::Device(_) => FaultKind::Callback,
        }
    }
}

impl From<CallbackError> for Fault {
    fn from(err: CallbackError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

/// Errors that end a node's run loop.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid node name: {0}")]
    Name(#[from] NodeNameError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("initialization failed: {0}")]
    Initialize(#[source] CallbackError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] TransitionError),

    #[error("helper {label} died: {cause}")]
    HelperDied { label: String, cause: String },

    #[error("OS error: {context}: {source}")]
    Os {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl NodeError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Config(e) => e.kind(),
            Self::Name(_) => FaultKind::Config,
            Self::Registry(e) => e.kind(),
            Self::Transport(e) => e.kind(),
            Self::Initialize(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Lifecycle(_) | Self::HelperDied { .. } | Self::Os { .. } => FaultKind::Os,
        }
    }

    pub fn os(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Os {
            context: context.into(),
            source,
        }
    }
}

impl From<NodeError> for Fault {
    fn from(err: NodeError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}
