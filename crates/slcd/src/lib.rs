//! slcd - Status registry and broadcast server
//!
//! This crate provides the registry that slow-control nodes publish to:
//! - `registry` - Registry actor owning the latest snapshot of every node
//! - `server` - Unix socket server exposing the registry to other processes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       slcd daemon                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ RegistryServer  │────▶│     RegistryActor           │   │
//! │  │ (Unix Socket)   │     │  (snapshot owner)           │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ events            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │   broadcast::Sender         │   │
//! │  │  (per node)     │     │   (event distribution)      │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry can also run inside a node process (see `spawn_registry`),
//! which is how single-process test setups work.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod registry;
pub mod server;
