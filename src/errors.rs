//! Tagged error hierarchy for the coordinator.
//!
//! `anyhow` is used throughout for context-chaining at call sites, but
//! the kill switch and validator need callers to `match` on error *kind*
//! -- a flat `anyhow::Error` can't give them that.
//! So these boundaries use `thiserror`-derived enums instead, and get
//! wrapped in `anyhow::Error` only once they cross into a context where
//! nobody needs to match on the variant any more.

use std::time::Duration;

use thiserror::Error;

use crate::branch::BranchId;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("coordinator is shutting down")]
    ShuttingDown,
    #[error("caller context was cancelled before admission completed")]
    CallerCancelled,
    #[error("couldn't acquire file locks for this change: {0}")]
    LocksUnavailable(#[from] LockError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("branch {0} not found")]
    BranchNotFound(BranchId),
    #[error("branch {0} is protected")]
    BranchProtected(BranchId),
    #[error("branch {0} has status {1:?}, which cannot be killed")]
    InvalidStatus(BranchId, crate::branch::Status),
    #[error("branch {0} has pending work (in-flight test or active container)")]
    PendingWork(BranchId),
    #[error("requester {requester} does not own branch {branch} (owner: {owner})")]
    OwnershipMismatch {
        branch: BranchId,
        requester: String,
        owner: String,
    },
}

/// A single cleanup side-effect (workflow cancel, container stop, worktree
/// removal, notification) that failed while killing a branch.
#[derive(Debug, Error)]
#[error("cleanup failed: {resource_kind} {resource_id} during {operation}{}", if *.retryable { " (retryable)" } else { "" })]
pub struct CleanupError {
    pub resource_kind: &'static str,
    pub resource_id: String,
    pub operation: &'static str,
    pub retryable: bool,
    /// Whether the coordinator can treat the branch as killed anyway
    /// (graceful degradation) despite this failure.
    pub can_degrade: bool,
    #[source]
    pub source: anyhow::Error,
}

/// Kill or cascade-kill exceeded its time budget with cleanup still
/// outstanding. The branch (or branches, for a cascade) is still marked
/// Killed; this error only reports incomplete side effects.
#[derive(Debug, Error)]
#[error("timed out after {configured:?} during step {step}, {} completed / {} pending", completed_steps.len(), pending_steps.len())]
pub struct TimeoutError {
    pub step: &'static str,
    pub configured: Duration,
    pub completed_steps: Vec<String>,
    pub pending_steps: Vec<String>,
}

impl TimeoutError {
    pub fn partial_progress(&self) -> bool {
        !self.completed_steps.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum KillSwitchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("cascade exceeded max depth {max_depth} at branch {branch}")]
    CascadeTooDeep { branch: BranchId, max_depth: usize },
    #[error("cascade exceeded max branches {max_branches}")]
    CascadeTooWide { max_branches: usize },
    #[error("branch {0} is already being processed by another cascade (re-entry)")]
    CascadeReentry(BranchId),
}

impl KillSwitchError {
    /// Operation, branch, retry count, recoverable bit, and whether the
    /// branch ended up marked-killed anyway despite the error -- callers
    /// need to distinguish all four.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            KillSwitchError::Cleanup(CleanupError { retryable: true, .. })
        )
    }

    pub fn branch_marked_killed_despite_error(&self) -> bool {
        matches!(self, KillSwitchError::Timeout(_))
            || matches!(self, KillSwitchError::Cleanup(CleanupError { can_degrade: true, .. }))
    }
}

/// Surfaced to an operator UI/API: title, prose message, suggested actions,
/// technical detail, and the branch the failure concerns.
#[derive(Debug, Clone, Error)]
#[error("{title}: {message}")]
pub struct UserFacingError {
    pub title: String,
    pub message: String,
    pub suggested_actions: Vec<String>,
    pub technical_details: String,
    pub branch: Option<BranchId>,
}

impl From<&ValidationError> for UserFacingError {
    fn from(e: &ValidationError) -> Self {
        match e {
            ValidationError::BranchNotFound(id) => UserFacingError {
                title: "Branch not found".into(),
                message: format!("No branch with id {id} is currently tracked."),
                suggested_actions: vec!["Check the branch id and retry.".into()],
                technical_details: e.to_string(),
                branch: Some(id.clone()),
            },
            ValidationError::BranchProtected(id) => UserFacingError {
                title: "Branch is protected".into(),
                message: format!("{id} matches a protected branch pattern and cannot be killed."),
                suggested_actions: vec!["Remove protection if this was intentional.".into()],
                technical_details: e.to_string(),
                branch: Some(id.clone()),
            },
            ValidationError::InvalidStatus(id, status) => UserFacingError {
                title: "Branch cannot be killed in its current state".into(),
                message: format!("{id} has status {status:?}."),
                suggested_actions: vec!["Wait for the branch to reach a terminal state.".into()],
                technical_details: e.to_string(),
                branch: Some(id.clone()),
            },
            ValidationError::PendingWork(id) => UserFacingError {
                title: "Branch has pending work".into(),
                message: format!("{id} has an in-flight test run or active container."),
                suggested_actions: vec!["Wait for the in-flight work to finish, or force-kill.".into()],
                technical_details: e.to_string(),
                branch: Some(id.clone()),
            },
            ValidationError::OwnershipMismatch { branch, .. } => UserFacingError {
                title: "Not authorized".into(),
                message: "You are not the owner of this branch's originating change.".into(),
                suggested_actions: vec!["Ask the change's producer or a system agent to kill it.".into()],
                technical_details: e.to_string(),
                branch: Some(branch.clone()),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock not found for path {0}")]
    NotFound(String),
    #[error("lock for path {0} is not held by {1}")]
    NotHeld(String, String),
    #[error("path {path} is held by {holder} (exclusive: {exclusive})")]
    Conflict {
        path: String,
        holder: String,
        exclusive: bool,
    },
}
