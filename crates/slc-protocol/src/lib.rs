//! SLC Protocol - Wire protocol for registry communication
//!
//! This crate provides the newline-delimited JSON messages exchanged
//! between control nodes (and operator clients) and the `slcd`
//! registry daemon over its Unix socket.

pub mod message;
pub mod record_hex;
pub mod version;

use std::path::PathBuf;

pub use message::{ClientMessage, DaemonMessage, MessageType, NodeSnapshot};
pub use version::{ProtocolVersion, VersionError};

/// Default registry socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/slc.sock";

/// Environment variable overriding the registry socket path.
pub const SOCKET_ENV: &str = "SLC_SOCKET";

/// Resolves the registry socket path: `SLC_SOCKET` if set, else the default.
pub fn socket_path() -> PathBuf {
    std::env::var_os(SOCKET_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}
