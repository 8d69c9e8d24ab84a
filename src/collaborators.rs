//! Pluggable side-effect hosts used during kill. The workflow engine and
//! container runtime themselves are out of scope beyond the narrow
//! interface the core consumes; the reference/no-op implementations here
//! exist so the coordinator is runnable and testable without a real
//! workflow engine or container runtime wired up.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::branch::Branch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    Graceful,
    Force,
}

#[derive(Debug, Clone)]
pub struct CancelStatus {
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
    pub resources_freed: Vec<String>,
}

#[async_trait]
pub trait WorkflowCanceller: Send + Sync {
    async fn cancel(&self, workflow_id: &str, mode: CancelMode) -> CancelStatus;

    async fn cancel_batch(&self, workflow_ids: &[String], mode: CancelMode) -> Vec<CancelStatus> {
        let mut out = Vec::with_capacity(workflow_ids.len());
        for id in workflow_ids {
            out.push(self.cancel(id, mode).await);
        }
        out
    }

    async fn has_pending_cancellation(&self, workflow_id: &str) -> bool;
}

/// Degraded-operation fallback: always reports success without doing
/// anything. A coordinator wired up with only no-op collaborators still
/// satisfies every kill-switch invariant (branch ends up Killed), it just
/// can't actually free the external resources.
pub struct NoOpWorkflowCanceller;

#[async_trait]
impl WorkflowCanceller for NoOpWorkflowCanceller {
    async fn cancel(&self, _workflow_id: &str, _mode: CancelMode) -> CancelStatus {
        CancelStatus {
            success: true,
            duration: Duration::ZERO,
            error: None,
            resources_freed: Vec::new(),
        }
    }

    async fn has_pending_cancellation(&self, _workflow_id: &str) -> bool {
        false
    }
}

/// Reference implementation that cancels a workflow backed by a local OS
/// process: SIGINT on graceful cancellation, SIGKILL on force.
/// `workflow_id` is the process's PID as a string.
pub struct ProcessWorkflowCanceller;

#[async_trait]
impl WorkflowCanceller for ProcessWorkflowCanceller {
    async fn cancel(&self, workflow_id: &str, mode: CancelMode) -> CancelStatus {
        let start = Instant::now();
        let Ok(raw_pid) = workflow_id.parse::<i32>() else {
            return CancelStatus {
                success: false,
                duration: start.elapsed(),
                error: Some(format!("{workflow_id} is not a PID")),
                resources_freed: Vec::new(),
            };
        };
        let pid = Pid::from_raw(raw_pid);
        let sig = match mode {
            CancelMode::Graceful => Signal::SIGINT,
            CancelMode::Force => Signal::SIGKILL,
        };
        match kill(pid, sig) {
            Ok(()) => CancelStatus {
                success: true,
                duration: start.elapsed(),
                error: None,
                resources_freed: vec![format!("pid:{raw_pid}")],
            },
            // ESRCH (no such process) means it already exited: idempotent success.
            Err(nix::errno::Errno::ESRCH) => CancelStatus {
                success: true,
                duration: start.elapsed(),
                error: None,
                resources_freed: Vec::new(),
            },
            Err(e) => CancelStatus {
                success: false,
                duration: start.elapsed(),
                error: Some(e.to_string()),
                resources_freed: Vec::new(),
            },
        }
    }

    async fn has_pending_cancellation(&self, _workflow_id: &str) -> bool {
        false
    }
}

#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn stop_and_remove(&self, container_id: &str) -> anyhow::Result<()>;
    async fn is_running(&self, container_id: &str) -> bool;
    async fn logs(&self, container_id: &str, tail: usize) -> Vec<String>;
}

pub struct NoOpContainerManager;

#[async_trait]
impl ContainerManager for NoOpContainerManager {
    async fn stop_and_remove(&self, _container_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_running(&self, _container_id: &str) -> bool {
        false
    }

    async fn logs(&self, _container_id: &str, _tail: usize) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory reference container manager for tests: tracks a set of
/// "running" container ids so `stop_and_remove` and `is_running` have
/// observable, assertable behaviour without a real container runtime.
#[derive(Default)]
pub struct FakeContainerManager {
    running: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, id: impl Into<String>, logs: Vec<String>) {
        self.running.lock().insert(id.into(), logs);
    }
}

#[async_trait]
impl ContainerManager for FakeContainerManager {
    async fn stop_and_remove(&self, container_id: &str) -> anyhow::Result<()> {
        // Idempotent against absent containers.
        self.running.lock().remove(container_id);
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> bool {
        self.running.lock().contains_key(container_id)
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Vec<String> {
        self.running
            .lock()
            .get(container_id)
            .map(|lines| lines.iter().rev().take(tail).rev().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn remove(&self, worktree_id: &str) -> anyhow::Result<()>;
}

pub struct NoOpWorktreeManager;

#[async_trait]
impl WorktreeManager for NoOpWorktreeManager {
    async fn remove(&self, _worktree_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_branch_killed(&self, branch: &Branch, reason: &str) -> anyhow::Result<()>;
}

/// Logs-only notifier: notification delivery is explicitly out-of-band,
/// so a reasonable default is just a structured log line rather than
/// actually failing to deliver anywhere.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_branch_killed(&self, branch: &Branch, reason: &str) -> anyhow::Result<()> {
        warn!("branch {} killed: {reason}", branch.id);
        Ok(())
    }
}

/// Dispatches a notification as a detached task and never lets delivery
/// failure affect the caller -- kill correctness must not depend on it.
pub fn notify_non_blocking(notifier: std::sync::Arc<dyn Notifier>, branch: Branch, reason: String) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify_branch_killed(&branch, &reason).await {
            error!("notification failed for branch {}: {e} (kill is unaffected)", branch.id);
        }
    });
}
