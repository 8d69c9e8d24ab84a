//! The hierarchical kill switch: timeout-bounded, idempotent, cascading
//! branch termination with graceful degradation. The most complex
//! subsystem in this coordinator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;
use log::{info, warn};

use crate::branch::{Branch, BranchRegistry, Status};
use crate::collaborators::{notify_non_blocking, CancelMode, ContainerManager, Notifier, WorkflowCanceller, WorktreeManager};
use crate::errors::{CleanupError, KillSwitchError, TimeoutError};
use crate::retry::{retry_cleanup, RetryConfig};
use crate::stats::Stats;

#[derive(Debug, Clone)]
pub struct KillSwitchConfig {
    pub timeout: Duration,
    pub max_depth: usize,
    pub max_branches_per_cascade: usize,
    pub retry: RetryConfig,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_depth: 20,
            max_branches_per_cascade: 1000,
            retry: RetryConfig::default(),
        }
    }
}

impl KillSwitchConfig {
    pub fn cascade_timeout(&self) -> Duration {
        self.timeout * 10
    }
}

pub struct KillSwitch {
    registry: Arc<BranchRegistry>,
    workflow_canceller: Arc<dyn WorkflowCanceller>,
    container_manager: Arc<dyn ContainerManager>,
    worktree_manager: Arc<dyn WorktreeManager>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<Stats>,
    config: KillSwitchConfig,
}

impl KillSwitch {
    pub fn new(
        registry: Arc<BranchRegistry>,
        workflow_canceller: Arc<dyn WorkflowCanceller>,
        container_manager: Arc<dyn ContainerManager>,
        worktree_manager: Arc<dyn WorktreeManager>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<Stats>,
        config: KillSwitchConfig,
    ) -> Self {
        Self {
            registry,
            workflow_canceller,
            container_manager,
            worktree_manager,
            notifier,
            stats,
            config,
        }
    }

    /// Single-branch kill. Marks the branch Killed
    /// atomically (idempotent on repeat calls), then runs cleanup
    /// side-effects inside `KillSwitchTimeout`. A timed-out or failed
    /// cleanup never reverts the Killed status: that's the graceful
    /// degradation this whole subsystem exists to provide.
    pub async fn kill(&self, branch_id: &str, reason: &str) -> Result<(), KillSwitchError> {
        let transition = self.registry.mutate(branch_id, |b| {
            if b.status == Status::Killed {
                return KillTransition::AlreadyKilled;
            }
            b.status = Status::Killed;
            b.killed_at = Some(SystemTime::now());
            b.kill_reason = Some(reason.to_string());
            KillTransition::JustKilled(b.clone())
        });

        let branch = match transition {
            None => {
                return Err(KillSwitchError::Validation(crate::errors::ValidationError::BranchNotFound(
                    branch_id.to_string(),
                )))
            }
            Some(KillTransition::AlreadyKilled) => return Ok(()),
            Some(KillTransition::JustKilled(b)) => b,
        };
        self.stats.record_kill();
        info!("killed branch {branch_id}: {reason}");

        let deadline = Instant::now() + self.config.timeout;
        let mut completed = vec!["marked_as_killed".to_string()];
        let all_steps = ["cancel_workflow", "stop_container", "remove_worktree"];

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.timeout_error(branch_id, reason, completed, all_steps.iter().map(|s| s.to_string()).collect()));
        }

        let cleanup = self.run_cleanup(branch.clone(), reason);
        match tokio::time::timeout(remaining, cleanup).await {
            Ok(Ok(mut steps)) => {
                completed.append(&mut steps);
                notify_non_blocking(self.notifier.clone(), branch, reason.to_string());
                Ok(())
            }
            Ok(Err((err, mut steps, _pending))) => {
                completed.append(&mut steps);
                self.degrade_reason(branch_id);
                notify_non_blocking(self.notifier.clone(), branch, reason.to_string());
                // CleanupError is only surfaced to the caller once it's
                // fatal (not degradable); otherwise the branch is already
                // Killed and that's the source of truth.
                if err.can_degrade {
                    Ok(())
                } else {
                    Err(KillSwitchError::Cleanup(err))
                }
            }
            Err(_elapsed) => {
                self.degrade_reason(branch_id);
                notify_non_blocking(self.notifier.clone(), branch, reason.to_string());
                let pending: Vec<String> = all_steps
                    .iter()
                    .filter(|s| !completed.contains(&s.to_string()))
                    .map(|s| s.to_string())
                    .collect();
                Err(self.timeout_error(branch_id, reason, completed, pending))
            }
        }
    }

    fn timeout_error(&self, branch_id: &str, _reason: &str, completed: Vec<String>, pending: Vec<String>) -> KillSwitchError {
        self.degrade_reason(branch_id);
        KillSwitchError::Timeout(TimeoutError {
            step: "cleanup",
            configured: self.config.timeout,
            completed_steps: completed,
            pending_steps: pending,
        })
    }

    fn degrade_reason(&self, branch_id: &str) {
        self.registry.mutate(branch_id, |b| {
            if let Some(reason) = &mut b.kill_reason {
                if !reason.contains("(timeout during cleanup)") {
                    reason.push_str(" (timeout during cleanup)");
                }
            }
        });
    }

    /// Runs the cleanup side-effects, returning the list of steps that
    /// completed on success, or `(error, completed_so_far, pending)` on a
    /// non-retryable cleanup failure.
    #[allow(clippy::type_complexity)]
    async fn run_cleanup(&self, branch: Branch, reason: &str) -> Result<Vec<String>, (CleanupError, Vec<String>, Vec<String>)> {
        let mut completed = Vec::new();

        if let Some(workflow_id) = &branch.test_run_handle {
            let result = retry_cleanup(
                &self.config.retry,
                |_: &anyhow::Error| true,
                || async {
                    let status = self.workflow_canceller.cancel(workflow_id, CancelMode::Graceful).await;
                    if status.success {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!(status.error.unwrap_or_else(|| "cancel failed".to_string())))
                    }
                },
            )
            .await;
            match result {
                Ok(()) => completed.push("cancel_workflow".to_string()),
                Err(e) => {
                    warn!("workflow cancel failed for {}: {e}", branch.id);
                    return Err((
                        CleanupError {
                            resource_kind: "workflow",
                            resource_id: workflow_id.clone(),
                            operation: "cancel",
                            retryable: true,
                            can_degrade: true,
                            source: e,
                        },
                        completed,
                        vec!["stop_container".to_string(), "remove_worktree".to_string()],
                    ));
                }
            }
        } else {
            completed.push("cancel_workflow".to_string());
        }

        if let Some(container_id) = &branch.container_handle {
            match self.container_manager.stop_and_remove(container_id).await {
                Ok(()) => completed.push("stop_container".to_string()),
                Err(e) => {
                    warn!("container stop failed for {}: {e}", branch.id);
                    return Err((
                        CleanupError {
                            resource_kind: "container",
                            resource_id: container_id.clone(),
                            operation: "stop_and_remove",
                            retryable: true,
                            can_degrade: true,
                            source: e,
                        },
                        completed,
                        vec!["remove_worktree".to_string()],
                    ));
                }
            }
        } else {
            completed.push("stop_container".to_string());
        }

        if let Err(e) = self.worktree_manager.remove(&branch.id).await {
            warn!("worktree removal failed for {}: {e}", branch.id);
            return Err((
                CleanupError {
                    resource_kind: "worktree",
                    resource_id: branch.id.clone(),
                    operation: "remove",
                    retryable: true,
                    can_degrade: true,
                    source: e,
                },
                completed,
                Vec::new(),
            ));
        }
        completed.push("remove_worktree".to_string());
        let _ = reason;
        Ok(completed)
    }

    /// Cascade kill: snapshot children, release the lock, then recursively
    /// kill each subtree before killing the node itself.
    pub async fn kill_dependents(&self, branch_id: &str) -> Result<(), KillSwitchError> {
        let deadline = Instant::now() + self.config.cascade_timeout();
        let validator = Arc::new(CascadeKillValidator::new(self.config.max_depth, self.config.max_branches_per_cascade));
        self.kill_dependents_inner(branch_id.to_string(), 0, validator, deadline).await
    }

    fn kill_dependents_inner<'a>(
        &'a self,
        branch_id: String,
        depth: usize,
        validator: Arc<CascadeKillValidator>,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<(), KillSwitchError>> {
        Box::pin(async move {
            if depth > self.config.max_depth {
                return Err(KillSwitchError::CascadeTooDeep {
                    branch: branch_id,
                    max_depth: self.config.max_depth,
                });
            }
            if !validator.enter(&branch_id) {
                return Err(KillSwitchError::CascadeReentry(branch_id));
            }
            if validator.total() > self.config.max_branches_per_cascade {
                validator.leave(&branch_id);
                return Err(KillSwitchError::CascadeTooWide {
                    max_branches: self.config.max_branches_per_cascade,
                });
            }
            if Instant::now() >= deadline {
                let pending = self.registry.descendants(&branch_id);
                validator.leave(&branch_id);
                return Err(KillSwitchError::Timeout(TimeoutError {
                    step: "cascade",
                    configured: self.config.cascade_timeout(),
                    completed_steps: Vec::new(),
                    pending_steps: pending,
                }));
            }

            let children = self.registry.children_of(&branch_id);
            children.iter().for_each(|_| validator.count_one());

            // Children are killed concurrently: each one's subtree
            // cascades first, then the child itself is killed. Errors from
            // individual children are captured but don't stop the others --
            // the cascade must maximize cleanup.
            let results = futures::future::join_all(children.into_iter().map(|child| {
                let validator = validator.clone();
                let parent = branch_id.clone();
                async move {
                    let mut result = self.kill_dependents_inner(child.clone(), depth + 1, validator, deadline).await;
                    if let Err(e) = self.kill(&child, &format!("parent branch {parent} failed")).await {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                    result
                }
            }))
            .await;

            validator.leave(&branch_id);
            results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
        })
    }
}

enum KillTransition {
    AlreadyKilled,
    JustKilled(Branch),
}

/// Tracks cascade-kill safety bounds: total branches touched in this
/// cascade (`MaxBranchesPerCascade`) and currently-processing branch ids, a
/// defense against re-entry even though a well-formed linear hierarchy
/// cannot have cycles. Shared (via `Arc`) across the
/// concurrent per-child tasks a cascade spawns, hence the internal lock
/// rather than `&mut self` methods.
pub struct CascadeKillValidator {
    #[allow(dead_code)]
    max_depth: usize,
    max_branches: usize,
    state: parking_lot::Mutex<CascadeState>,
}

#[derive(Default)]
struct CascadeState {
    processing: HashSet<String>,
    touched: usize,
}

impl CascadeKillValidator {
    pub fn new(max_depth: usize, max_branches: usize) -> Self {
        Self {
            max_depth,
            max_branches,
            state: parking_lot::Mutex::new(CascadeState::default()),
        }
    }

    fn enter(&self, branch_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.processing.contains(branch_id) {
            return false;
        }
        state.processing.insert(branch_id.to_string());
        state.touched += 1;
        true
    }

    fn leave(&self, branch_id: &str) {
        self.state.lock().processing.remove(branch_id);
    }

    fn count_one(&self) {
        self.state.lock().touched += 1;
    }

    fn total(&self) -> usize {
        self.state.lock().touched
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[allow(dead_code)]
    fn max_branches(&self) -> usize {
        self.max_branches
    }
}
