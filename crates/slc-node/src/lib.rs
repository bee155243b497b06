//! slc-node - Framework for slow-control node daemons
//!
//! A node is one process that owns one piece of hardware, publishes its
//! status record to the registry and executes commands addressed to it:
//! - `transport` - TCP and FIFO byte streams with exact-length reads
//! - `hardware` - Monitor sources (hardware link or simulated)
//! - `callback` - Device logic (`ControlCallback`) and the stock HV/readout callbacks
//! - `registry` / `client` - The `StatusRegistry` seam and its `slcd` socket client
//! - `supervisor` - Helper subprocess supervision
//! - `daemon` - Lifecycle state machine, signals, exit codes
//! - `node` - `NodeRunner`, the stock run loop
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────── slcnode ─────────────────────────────┐
//! │                                                                   │
//! │  Daemon ──▶ NodeRunner ──select!──┬── CancellationToken (signals) │
//! │                 │                 ├── CommandInbox ──▶ on_command │
//! │                 │                 ├── tick interval ──▶ on_tick   │
//! │                 │                 └── ProcessSupervisor (oneshot) │
//! │                 ▼                                                 │
//! │          StatusRegistry ── publish ──▶ RegistryHandle | slcd      │
//! │                                                                   │
//! │  ControlCallback ──▶ MonitorSource ──▶ Connection (TCP | FIFO)    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`

pub mod callback;
pub mod client;
pub mod daemon;
pub mod error;
pub mod hardware;
pub mod node;
pub mod registry;
pub mod settings;
pub mod supervisor;
pub mod transport;

pub use callback::{ControlCallback, HvCallback, ReadoutCallback};
pub use client::RemoteRegistry;
pub use daemon::{
    Daemon, DaemonContext, DaemonState, RunHook, EXIT_OK, EXIT_RUNTIME, EXIT_STARTUP,
};
pub use error::{CallbackError, NodeError};
pub use node::NodeRunner;
pub use registry::StatusRegistry;
pub use settings::NodeSettings;
pub use supervisor::{ChildExit, ExitCause, ProcessSupervisor};
pub use transport::{Connection, Endpoint, TransportError};
