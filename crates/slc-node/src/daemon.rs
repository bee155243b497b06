//! Daemon lifecycle: daemonizing, signals, state machine and exit codes.
//!
//! ```text
//!   Created ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!                  │            │           │
//!                  └────────────┴───────────┴──────▶ Error
//! ```
//!
//! [`Daemon::start`] never panics and never returns an error. A fault ends
//! up as one diagnostic line in the log and an exit code:
//!
//! | code | meaning                              |
//! |------|--------------------------------------|
//! | 0    | clean shutdown                       |
//! | 1    | startup failure (fault while Starting) |
//! | 2    | runtime fatal (fault while Running)  |
//!
//! All state a run hook needs travels in an explicit [`DaemonContext`].

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slc_core::Fault;
use slcd::registry::Registration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::registry::StatusRegistry;

pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP: i32 = 1;
pub const EXIT_RUNTIME: i32 = 2;

/// Upper bound for the unregistration on shutdown.
pub const UNREGISTER_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Lifecycle State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl DaemonState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn can_transition_to(self, next: DaemonState) -> bool {
        use DaemonState::*;
        match (self, next) {
            (Created, Starting)
            | (Starting, Running)
            | (Starting, Stopping)
            | (Running, Stopping)
            | (Stopping, Stopped) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Exit code for a fault raised in this state.
    pub fn fault_exit_code(self) -> i32 {
        match self {
            Self::Created | Self::Starting => EXIT_STARTUP,
            _ => EXIT_RUNTIME,
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal lifecycle transition {from} -> {to}")]
pub struct TransitionError {
    pub from: DaemonState,
    pub to: DaemonState,
}

// ============================================================================
// Daemon Context
// ============================================================================

/// Explicit per-daemon state handed to the run hook.
pub struct DaemonContext {
    cancel: CancellationToken,
    state: DaemonState,
    registration: Option<(Arc<dyn StatusRegistry>, Registration)>,
}

impl DaemonContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            state: DaemonState::Created,
            registration: None,
        }
    }

    /// Token cancelled on SIGTERM/SIGINT or when the daemon stops.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn transition(&mut self, next: DaemonState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        debug!(from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        Ok(())
    }

    /// Records the live registration so shutdown can remove it.
    pub fn set_registration(&mut self, registry: Arc<dyn StatusRegistry>, registration: Registration) {
        self.registration = Some((registry, registration));
    }

    /// Forgets a registration the registry no longer holds.
    pub fn clear_registration(&mut self) {
        self.registration = None;
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref().map(|(_, reg)| reg)
    }

    /// Unregisters the live registration, bounded by [`UNREGISTER_GRACE`].
    ///
    /// Returns `true` if a registration was removed.
    pub async fn release_registration(&mut self) -> bool {
        let Some((registry, registration)) = self.registration.take() else {
            return false;
        };

        match tokio::time::timeout(UNREGISTER_GRACE, registry.unregister(&registration)).await {
            Ok(Ok(removed)) => {
                debug!(node = %registration.name(), removed, "Unregistered");
                removed
            }
            Ok(Err(e)) => {
                warn!(node = %registration.name(), error = %e, "Unregister failed");
                false
            }
            Err(_) => {
                warn!(
                    node = %registration.name(),
                    grace = ?UNREGISTER_GRACE,
                    "Unregister timed out"
                );
                false
            }
        }
    }
}

// ============================================================================
// Run Hook
// ============================================================================

/// The main loop of a daemon.
///
/// Called in state `Starting`. The hook moves the context to `Running` once
/// it is up and returns when `ctx.cancel_token()` fires or on a fatal fault.
#[async_trait]
pub trait RunHook: Send {
    async fn run(&mut self, ctx: &mut DaemonContext) -> Result<(), NodeError>;
}

// ============================================================================
// Daemon
// ============================================================================

pub struct Daemon<H> {
    name: String,
    hook: H,
    log_file: Option<PathBuf>,
    cancel: CancellationToken,
}

impl<H: RunHook> Daemon<H> {
    pub fn new(name: impl Into<String>, hook: H) -> Self {
        Self {
            name: name.into(),
            hook,
            log_file: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Detach from the terminal on start, sending stdout/stderr to `log_file`.
    pub fn daemonize(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    /// Token that stops the daemon like a signal does.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the daemon to completion and returns the process exit code.
    ///
    /// Daemonizing happens before the tokio runtime is built.
    pub fn start(self) -> i32 {
        if let Some(log_file) = &self.log_file {
            if let Err(e) = daemonize(log_file) {
                error!(daemon = %self.name, fault = %Fault::from(e), "Failed to daemonize");
                return EXIT_STARTUP;
            }
        }

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(
                    daemon = %self.name,
                    fault = %Fault::os("failed to build runtime", &e),
                    "Daemon failed"
                );
                return EXIT_STARTUP;
            }
        };

        runtime.block_on(self.run())
    }

    /// Runs the lifecycle on the current runtime.
    pub async fn run(mut self) -> i32 {
        let mut ctx = DaemonContext::new(self.cancel.clone());

        let signal_token = self.cancel.clone();
        let signals = tokio::spawn(async move {
            tokio::select! {
                _ = signal_token.cancelled() => {}
                result = wait_for_shutdown_signal() => {
                    if let Err(e) = result {
                        error!(error = %e, "Error waiting for shutdown signal");
                    }
                    info!("Shutdown signal received");
                    signal_token.cancel();
                }
            }
        });

        // Created -> Starting never fails
        let _ = ctx.transition(DaemonState::Starting);
        info!(daemon = %self.name, pid = std::process::id(), "Daemon starting");

        let result = self.hook.run(&mut ctx).await;

        let code = match result {
            Ok(()) => {
                if ctx.state() != DaemonState::Stopping {
                    let _ = ctx.transition(DaemonState::Stopping);
                }
                EXIT_OK
            }
            Err(err) => {
                let code = ctx.state().fault_exit_code();
                let fault = Fault::from(err);
                error!(
                    daemon = %self.name,
                    state = %ctx.state(),
                    exit_code = code,
                    "{fault}"
                );
                let _ = ctx.transition(DaemonState::Error);
                code
            }
        };

        ctx.release_registration().await;
        self.cancel.cancel();
        let _ = signals.await;

        if code == EXIT_OK {
            let _ = ctx.transition(DaemonState::Stopped);
        }
        info!(daemon = %self.name, state = %ctx.state(), exit_code = code, "Daemon stopped");
        code
    }
}

fn daemonize(log_file: &Path) -> Result<(), NodeError> {
    use daemonize::Daemonize;

    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| NodeError::os(format!("create {}", parent.display()), e))?;
    }

    let open = |what: &str| {
        File::options()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| NodeError::os(format!("open {what} log {}", log_file.display()), e))
    };
    let stdout = open("stdout")?;
    let stderr = open("stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|e| {
            NodeError::os(
                "daemonize",
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    Ok(())
}
