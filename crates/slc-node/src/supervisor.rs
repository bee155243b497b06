//! Helper subprocess supervision.
//!
//! A node may run one helper process next to it (a vendor proxy, a
//! converter). The supervisor watches it on its own task and hands the exit
//! report to the run loop through a oneshot: one writer, one reader, no
//! shared state. Nothing is restarted.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::settings::HelperSpec;

/// How a helper process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Normal exit with this status code
    Exited(i32),
    /// Killed by this signal number
    Signaled(i32),
    /// Waiting on the child failed
    Unknown,
}

impl ExitCause {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self::Exited(code)
        } else if let Some(signal) = status.signal() {
            Self::Signaled(signal)
        } else {
            Self::Unknown
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Exited(0)
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => write!(f, "exit status unknown"),
        }
    }
}

/// Exit report of a supervised helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub label: String,
    pub cause: ExitCause,
}

/// Starts the helper described by `spec`. The child dies with its handle.
pub fn spawn_helper(spec: &HelperSpec) -> Result<Child, NodeError> {
    let child = Command::new(&spec.command)
        .args(&spec.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| NodeError::os(format!("failed to start helper {}", spec.label()), e))?;

    info!(
        helper = spec.label(),
        pid = child.id().unwrap_or(0),
        "Helper started"
    );
    Ok(child)
}

/// Waits for `child` and reports how it ended.
pub async fn watch(mut child: Child, label: String) -> ChildExit {
    watch_ref(&mut child, &label).await
}

fn report(label: &str, cause: ExitCause) {
    if cause.is_success() {
        info!(helper = %label, "Helper exited cleanly");
    } else {
        error!(helper = %label, cause = %cause, "Helper died");
    }
}

/// Watches one helper on a dedicated task.
pub struct ProcessSupervisor {
    label: String,
    exit: Option<oneshot::Receiver<ChildExit>>,
    task: JoinHandle<()>,
}

impl ProcessSupervisor {
    /// Starts watching `child`. Cancelling `cancel` kills the child; no
    /// report is sent in that case.
    pub fn spawn(child: Child, label: impl Into<String>, cancel: CancellationToken) -> Self {
        let label = label.into();
        let (tx, rx) = oneshot::channel();

        let task_label = label.clone();
        let task = tokio::spawn(async move {
            let mut child = child;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!(helper = %task_label, error = %e, "Helper already gone");
                    }
                    let _ = child.wait().await;
                    debug!(helper = %task_label, "Helper stopped on shutdown");
                }

                exit = watch_ref(&mut child, &task_label) => {
                    let _ = tx.send(exit);
                }
            }
        });

        Self {
            label,
            exit: Some(rx),
            task,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Resolves once with the exit report; pending forever afterwards.
    ///
    /// `None` means the supervisor stopped without a report (cancellation).
    pub async fn exited(&mut self) -> Option<ChildExit> {
        let Some(rx) = self.exit.as_mut() else {
            return std::future::pending().await;
        };
        let exit = rx.await.ok();
        self.exit = None;
        exit
    }

    /// Waits for the watcher task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// `watch` for a child the caller keeps ownership of.
async fn watch_ref(child: &mut Child, label: &str) -> ChildExit {
    let cause = match child.wait().await {
        Ok(status) => ExitCause::from_status(status),
        Err(e) => {
            warn!(helper = %label, error = %e, "Failed to wait for helper");
            ExitCause::Unknown
        }
    };
    report(label, cause);
    ChildExit {
        label: label.to_string(),
        cause,
    }
}
