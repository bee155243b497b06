//! SLC Core - Shared types for slow-control nodes
//!
//! This crate provides the domain types shared between the registry
//! daemon (slcd), the node framework (slc-node) and operator tools.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod command;
pub mod config;
pub mod error;
pub mod node;
pub mod record;
pub mod store;
pub mod wire;

// Re-exports for convenience
pub use command::{Command, CommandAck, CommandError, CommandResult};
pub use config::{ConfigEntry, ConfigError, ConfigLookup};
pub use error::{Fault, FaultKind};
pub use node::{NodeIdentity, NodeName, NodeNameError};
pub use record::{
    ChannelCountError, ChannelState, ChannelStatus, HvStatus, NodeState, PublishableStatus,
    ReadoutStatus, RecordKind, StatusRecord, HV_MAX_CHANNELS, READOUT_MAX_CHANNELS,
};
pub use store::{load_record, save_record, StoreError};
pub use wire::{WireError, WIRE_REVISION};
