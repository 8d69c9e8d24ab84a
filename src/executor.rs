//! The speculative executor: launches test workflows for each prefix
//! branch and collects results. Keeps a
//! `HashMap<BranchId, CancellationToken>` of in-flight jobs and spawns a
//! task per job that races the job's future against cancellation.

use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::Command as TokioCommand;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::branch::{BranchId, BranchRegistry, Status};
use crate::change::{Change, ChangeId};
use crate::stats::Stats;

/// Default bounded-channel capacity for published results.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub change_ids: Vec<ChangeId>,
    pub outcome: TestOutcome,
    /// Opaque handle the kill switch can hand to the `WorkflowCanceller`
    /// collaborator if this run needs to be torn down before it finishes.
    pub run_handle: Option<String>,
}

/// The external test runner contract ('s "explicitly out of scope"
/// workflow engine). The executor calls this; it never interprets what
/// happens inside.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, changes: &[Change], cancel: CancellationToken) -> TestOutcome;
}

/// Reference runner that always passes immediately -- useful as a
/// degraded-operation default and in tests that don't care about test
/// content.
pub struct AlwaysPassRunner;

#[async_trait]
impl TestRunner for AlwaysPassRunner {
    async fn run(&self, _changes: &[Change], _cancel: CancellationToken) -> TestOutcome {
        TestOutcome::Passed
    }
}

/// A test command, shell string or raw argv -- kept untagged so existing
/// TOML test definitions deserialize unchanged.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum TestCommand {
    Shell(String),
    Raw(Vec<String>),
}

impl TestCommand {
    fn program(&self) -> OsString {
        match self {
            Self::Shell(_) => "bash".into(),
            Self::Raw(args) => args[0].clone().into(),
        }
    }

    fn args(&self) -> Vec<OsString> {
        match self {
            Self::Shell(cmd) => vec!["-c".into(), cmd.into()],
            Self::Raw(args) => args[1..].iter().map(OsString::from).collect(),
        }
    }
}

/// Production reference runner: spawns `command` as a child process per
/// batch, exposing the tested change ids via `WEIR_CHANGE_IDS` the way a
/// CI job reads its triggering revisions from the environment. Cancellation
/// kills the child rather than waiting for it to notice; `kill_on_drop`
/// backstops that if the select arm is never reached.
pub struct CommandTestRunner {
    pub command: TestCommand,
}

impl CommandTestRunner {
    pub fn new(command: TestCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, changes: &[Change], cancel: CancellationToken) -> TestOutcome {
        let mut cmd = TokioCommand::new(self.command.program());
        cmd.args(self.command.args());
        cmd.env(
            "WEIR_CHANGE_IDS",
            changes.iter().map(|c| c.id.as_str()).collect::<Vec<_>>().join(","),
        );
        cmd.stdout(Stdio::null()).stderr(Stdio::piped()).kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return TestOutcome::Failed(format!("failed to spawn test command: {e}")),
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                TestOutcome::TimedOut
            }
            status = child.wait() => match status {
                Ok(status) if status.success() => TestOutcome::Passed,
                Ok(status) => TestOutcome::Failed(format!("exited with {status}")),
                Err(e) => TestOutcome::Failed(format!("failed waiting for test command: {e}")),
            },
        }
    }
}

/// Reference runner driven by a per-change-id outcome table, and a set of
/// change ids whose test blocks until cancelled -- a scriptable stand-in for
/// `CommandTestRunner` in tests, without the subprocess.
#[derive(Default)]
pub struct ScriptedTestRunner {
    outcomes: Mutex<HashMap<ChangeId, TestOutcome>>,
    block_until_cancelled: Mutex<std::collections::HashSet<ChangeId>>,
}

impl ScriptedTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, change_id: impl Into<ChangeId>, outcome: TestOutcome) {
        self.outcomes.lock().insert(change_id.into(), outcome);
    }

    pub fn block_until_cancelled(&self, change_id: impl Into<ChangeId>) {
        self.block_until_cancelled.lock().insert(change_id.into());
    }
}

#[async_trait]
impl TestRunner for ScriptedTestRunner {
    async fn run(&self, changes: &[Change], cancel: CancellationToken) -> TestOutcome {
        let last = changes.last().expect("batch must be non-empty");
        if self.block_until_cancelled.lock().contains(&last.id) {
            cancel.cancelled().await;
            return TestOutcome::TimedOut;
        }
        self.outcomes.lock().get(&last.id).cloned().unwrap_or(TestOutcome::Passed)
    }
}

/// Given a batch (prefix of the main queue), registers a Pending branch for
/// every new prefix length and spawns the async task that drives it through
/// Testing -> {Passed, Failed} and publishes the result.
pub struct SpeculativeExecutor<T: TestRunner + 'static> {
    registry: Arc<BranchRegistry>,
    runner: Arc<T>,
    stats: Arc<Stats>,
    test_timeout: Duration,
    result_tx: broadcast::Sender<Arc<TestResult>>,
    job_cts: Mutex<HashMap<BranchId, CancellationToken>>,
}

impl<T: TestRunner + 'static> SpeculativeExecutor<T> {
    pub fn new(registry: Arc<BranchRegistry>, runner: Arc<T>, stats: Arc<Stats>, test_timeout: Duration) -> Self {
        let (result_tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            registry,
            runner,
            stats,
            test_timeout,
            result_tx,
            job_cts: Mutex::new(HashMap::new()),
        }
    }

    /// Streams results back. Must be called before the results you want to
    /// observe are produced -- this is a broadcast channel, not a log.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TestResult>> {
        self.result_tx.subscribe()
    }

    /// Registers and launches every new prefix of `batch` ( step 1-2).
    /// Existing branches for a prefix are left untouched. Returns the
    /// BranchIds in depth order.
    pub fn schedule_batch(self: &Arc<Self>, batch: &[Change]) -> Vec<BranchId> {
        let mut branch_ids = Vec::with_capacity(batch.len());
        for depth in 1..=batch.len() {
            let prefix_changes = &batch[..depth];
            let prefix_ids: Vec<ChangeId> = prefix_changes.iter().map(|c| c.id.clone()).collect();
            let (branch_id, existed) = self.registry.get_or_create(&prefix_ids);
            branch_ids.push(branch_id.clone());
            if existed {
                continue;
            }
            self.stats.record_branch_created(depth);
            let cancel = CancellationToken::new();
            self.job_cts.lock().insert(branch_id.clone(), cancel.clone());
            let this = self.clone();
            let prefix_changes = prefix_changes.to_vec();
            tokio::spawn(async move {
                this.run_branch(branch_id, prefix_changes, cancel).await;
            });
        }
        branch_ids
    }

    /// Cancels the in-flight local task for `branch_id`, if any. Idempotent:
    /// a branch with no running task (already terminal, or never started)
    /// is simply a no-op, matching the kill switch's tolerance for
    /// already-stopped resources.
    pub fn cancel(&self, branch_id: &str) {
        if let Some(ct) = self.job_cts.lock().remove(branch_id) {
            ct.cancel();
        }
    }

    async fn run_branch(self: Arc<Self>, branch_id: BranchId, changes: Vec<Change>, cancel: CancellationToken) {
        // Cancelled before we even started: exit without publishing,
        // without blocking on a receiver that may have stopped ( step 3).
        if cancel.is_cancelled() {
            return;
        }
        self.registry.mutate(&branch_id, |b| b.status = Status::Testing);

        let change_ids: Vec<ChangeId> = changes.iter().map(|c| c.id.clone()).collect();
        let run_handle = Some(branch_id.clone());
        self.registry.mutate(&branch_id, |b| b.test_run_handle = run_handle.clone());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("branch {branch_id} cancelled before test completion, dropping result");
                self.job_cts.lock().remove(&branch_id);
                return;
            }
            result = tokio::time::timeout(self.test_timeout, self.runner.run(&changes, cancel.clone())) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => {
                        self.stats.record_timeout();
                        TestOutcome::TimedOut
                    }
                }
            }
        };

        self.job_cts.lock().remove(&branch_id);

        let new_status = match &outcome {
            TestOutcome::Passed => {
                self.stats.record_pass();
                Status::Passed
            }
            TestOutcome::Failed(_) | TestOutcome::TimedOut => {
                if matches!(outcome, TestOutcome::Failed(_)) {
                    self.stats.record_failure();
                }
                Status::Failed
            }
        };
        self.registry.mutate(&branch_id, |b| b.status = new_status);

        let result = Arc::new(TestResult {
            change_ids,
            outcome,
            run_handle: Some(branch_id.clone()),
        });
        // Must not block registration: a full channel just drops the send
        // (the receiver side logs this as a metric miss upstream in the
        // coordinator's result loop via lagged-receiver handling).
        if self.result_tx.send(result).is_err() {
            warn!("no subscribers for result of branch {branch_id}; dropping");
        }
    }
}
