//! Coordinator loop and merge promotion: ties every component together --
//! admission, the speculative executor, result matching, merge promotion,
//! and the kill switch -- behind the producer API
//! (`submit`/`stats`/`health_report`/`start`/`stop`).
//!
//! The loop itself is a "watch for new input, launch jobs, consume a
//! result stream, reconcile state" shape: a `tokio::select!` over a
//! ticker, a results channel, and a cancellation token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionRouter;
use crate::branch::{branch_id, BranchRegistry, Status};
use crate::change::{Change, ChangeId};
use crate::errors::{AdmissionError, KillSwitchError};
use crate::executor::{SpeculativeExecutor, TestOutcome, TestResult, TestRunner};
use crate::kill::KillSwitch;
use crate::locks::LockDriver;
use crate::stats::{QueueStats, Stats};
use crate::validator::{BranchHealthReport, OwnerLookup, Validator};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub tick_interval: Duration,
    pub default_depth: usize,
    pub min_adaptive_depth: usize,
    pub high_pass_rate_threshold: f64,
    pub low_pass_rate_threshold: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            default_depth: 5,
            min_adaptive_depth: 1,
            high_pass_rate_threshold: 0.90,
            low_pass_rate_threshold: 0.70,
        }
    }
}

/// Maps a change to the producer that submitted it, the authoritative
/// source the validator's ownership check reads through its
/// `OwnerLookup` trait.
#[derive(Default)]
pub struct OwnerMap {
    inner: Mutex<HashMap<ChangeId, String>>,
}

impl OwnerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, change_id: ChangeId, producer: String) {
        self.inner.lock().insert(change_id, producer);
    }
}

impl OwnerLookup for OwnerMap {
    fn producer_of(&self, change_id: &ChangeId) -> Option<String> {
        self.inner.lock().get(change_id).cloned()
    }
}

pub struct Coordinator<T: TestRunner + 'static> {
    registry: Arc<BranchRegistry>,
    admission: Arc<AdmissionRouter>,
    executor: Arc<SpeculativeExecutor<T>>,
    kill_switch: Arc<KillSwitch>,
    validator: Arc<Validator>,
    stats: Arc<Stats>,
    owners: Arc<OwnerMap>,
    lock_driver: Arc<dyn LockDriver>,
    lock_ttl: Duration,
    lock_renewal_interval: Duration,
    /// One cancellation token per change with an active renewal task,
    /// keyed by change id. Fired and removed once the change leaves the
    /// queue (merged or evicted), so the renewal loop stops before the
    /// lock itself is released.
    renewals: Mutex<HashMap<ChangeId, CancellationToken>>,
    config: CoordinatorConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: TestRunner + 'static> Coordinator<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<BranchRegistry>,
        admission: Arc<AdmissionRouter>,
        executor: Arc<SpeculativeExecutor<T>>,
        kill_switch: Arc<KillSwitch>,
        validator: Arc<Validator>,
        stats: Arc<Stats>,
        lock_driver: Arc<dyn LockDriver>,
        lock_ttl: Duration,
        lock_renewal_interval: Duration,
        config: CoordinatorConfig,
    ) -> Self {
        info!("using conflict predicate: {}", admission.describe_predicate());
        Self {
            registry,
            admission,
            executor,
            kill_switch,
            validator,
            stats,
            owners: Arc::new(OwnerMap::new()),
            lock_driver,
            lock_ttl,
            lock_renewal_interval,
            renewals: Mutex::new(HashMap::new()),
            config,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Admits `change` after acquiring an exclusive lock on every path it
    /// touches, then spawns a background task that keeps those locks alive
    /// past their TTL for as long as the change remains queued. Locks are
    /// held by the change's own id as holder, so `try_merge`/`handle_failure`
    /// can cancel the renewal and release them by change id alone once the
    /// change leaves the queue.
    pub async fn submit(&self, change: Change) -> Result<(), AdmissionError> {
        self.lock_driver.acquire_all(&change.id, &change.paths, self.lock_ttl).await?;
        self.owners.record(change.id.clone(), change.producer.clone());
        if let Err(e) = self.admission.submit(change.clone(), &CancellationToken::new()).await {
            if let Err(release_err) = self.lock_driver.release_all(&change.id, &change.paths).await {
                warn!("rollback release of locks for {} failed: {release_err}", change.id);
            }
            return Err(e);
        }

        let cancel = CancellationToken::new();
        self.lock_driver.clone().spawn_renewal(change.id.clone(), change.paths.clone(), self.lock_ttl, self.lock_renewal_interval, cancel.clone());
        self.renewals.lock().insert(change.id, cancel);
        Ok(())
    }

    /// Stops the background renewal task for `change_id`, if one is
    /// running. Must be called before the change's locks are released, so
    /// the renewal loop never races a release with a fresh renew.
    fn cancel_renewal(&self, change_id: &str) {
        if let Some(cancel) = self.renewals.lock().remove(change_id) {
            cancel.cancel();
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    pub fn health_report(&self, branch_id: &str, requester: &str) -> BranchHealthReport {
        self.validator.health_report(&self.registry, branch_id, requester, self.owners.as_ref())
    }

    /// Validates and performs a kill in one step: `kill_switch.kill` is
    /// never reached unless `validate_kill` first clears the branch as
    /// protected, unowned-by-someone-else, and not mid-flight.
    pub async fn kill_with_validation(&self, branch_id: &str, requester: &str) -> Result<(), KillSwitchError> {
        self.validator.validate_kill(&self.registry, branch_id, requester, self.owners.as_ref())?;
        self.kill_switch.kill(branch_id, "kill requested by operator").await
    }

    /// Starts the tick loop and the result-processing loop as background
    /// tasks. Returns immediately; `stop()` tears both down.
    pub fn start(self: &Arc<Self>) {
        let tick_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.run_tick_loop().await })
        };
        let result_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.run_result_loop().await })
        };
        self.tasks.lock().extend([tick_handle, result_handle]);
    }

    /// Idempotent: repeat calls observe the same cancelled token and a
    /// second `shutdown()` on the admission router, both already no-ops.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.admission.shutdown();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn run_tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("tick loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn run_result_loop(self: Arc<Self>) {
        let mut results = self.executor.subscribe();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("result loop shutting down");
                    return;
                }
                received = results.recv() => {
                    match received {
                        Ok(result) => self.handle_result(result).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("result loop lagged, dropped {n} results");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("result channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One iteration of the tick loop's adaptive-depth batch extraction,
    /// plus bypass-lane processing. `schedule_batch` is idempotent against
    /// already-known prefixes, so re-offering the same bypass occupants and
    /// main-queue head every tick is harmless -- only genuinely new prefixes
    /// spawn a task.
    async fn tick(&self) {
        let depth = self.adaptive_depth();
        let (batch, bypass_snapshot) = {
            let state = self.admission.state();
            let locked = state.lock();
            let batch_len = depth.min(locked.main_queue.len());
            let batch: Vec<Change> = locked.main_queue.iter().take(batch_len).cloned().collect();
            let bypass: Vec<Change> = locked.bypass_lane.clone();
            (batch, bypass)
        };

        if !batch.is_empty() {
            self.executor.schedule_batch(&batch);
        }
        for change in bypass_snapshot {
            self.executor.schedule_batch(&[change]);
        }
    }

    fn adaptive_depth(&self) -> usize {
        let rate = self.stats.rolling_success_rate();
        if rate >= self.config.high_pass_rate_threshold {
            self.config.default_depth + 2
        } else if rate <= self.config.low_pass_rate_threshold {
            self.config.min_adaptive_depth.max(self.config.default_depth.saturating_sub(2))
        } else {
            self.config.default_depth
        }
    }

    async fn handle_result(&self, result: Arc<TestResult>) {
        let bid = branch_id(&result.change_ids);
        let Some(branch) = self.registry.get(&bid) else {
            warn!("dropping result for unknown branch {bid} (result-match miss)");
            return;
        };

        match &result.outcome {
            TestOutcome::Passed => self.try_merge().await,
            TestOutcome::Failed(detail) => self.handle_failure(&bid, branch.depth, &format!("tests failed: {detail}")).await,
            TestOutcome::TimedOut => self.handle_failure(&bid, branch.depth, "tests failed: timed out").await,
        }
    }

    /// Merges the deepest *contiguous* passing prefix of the main queue:
    /// a branch at depth 5 passing does not certify depths 1..4,
    /// since each depth is an independently-scheduled test of its own
    /// prefix. We only promote as far as a run of confirmed `Passed`
    /// branches reaches, starting from depth 1.
    async fn try_merge(&self) {
        let state = self.admission.state();
        let prefix_ids: Vec<ChangeId> = {
            let locked = state.lock();
            locked.main_queue.iter().map(|c| c.id.clone()).collect()
        };

        let mut deepest_passed = 0;
        for d in 1..=prefix_ids.len() {
            let bid = branch_id(&prefix_ids[..d]);
            match self.registry.get(&bid) {
                Some(b) if b.status == Status::Passed => deepest_passed = d,
                _ => break,
            }
        }
        if deepest_passed == 0 {
            return;
        }

        let merged: Vec<Change> = {
            let mut locked = state.lock();
            locked.main_queue.drain(..deepest_passed).collect()
        };
        let merged_ids: Vec<ChangeId> = merged.iter().map(|c| c.id.clone()).collect();
        for d in 1..=deepest_passed {
            let bid = branch_id(&merged_ids[..d]);
            self.registry.remove(&bid);
        }
        for change in &merged {
            self.cancel_renewal(&change.id);
            if let Err(e) = self.lock_driver.release_all(&change.id, &change.paths).await {
                warn!("failed to release locks for merged change {}: {e}", change.id);
            }
        }
        self.stats.record_merge();
        info!("merged {deepest_passed} change(s), new base is next queued change");
    }

    /// A failure at depth 1 (the current base) conclusively indicts that
    /// change: it's evicted so the next change becomes the new base.
    /// A failure at depth > 1 only invalidates that speculative branch and
    /// its descendants; shallower, still-passing branches remain live.
    async fn handle_failure(&self, bid: &str, depth: usize, reason: &str) {
        if let Err(e) = self.kill_switch.kill_dependents(bid).await {
            warn!("cascade kill for {bid} reported an error (continuing): {e}");
        }
        if let Err(e) = self.kill_switch.kill(bid, reason).await {
            warn!("kill for {bid} reported an error (branch state is still authoritative): {e}");
        }

        if depth != 1 {
            return;
        }

        let evicted = {
            let state = self.admission.state();
            let mut locked = state.lock();
            let front_matches = locked
                .main_queue
                .front()
                .is_some_and(|front| branch_id(std::slice::from_ref(&front.id)) == bid);
            if front_matches {
                locked.main_queue.pop_front()
            } else if let Some(pos) = locked.bypass_lane.iter().position(|c| branch_id(std::slice::from_ref(&c.id)) == bid) {
                Some(locked.bypass_lane.remove(pos))
            } else {
                None
            }
        };

        if let Some(change) = evicted {
            self.cancel_renewal(&change.id);
            if let Err(e) = self.lock_driver.release_all(&change.id, &change.paths).await {
                warn!("failed to release locks for evicted change {}: {e}", change.id);
            }
        }
    }
}
