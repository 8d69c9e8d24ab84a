use std::sync::Arc;
use std::time::Duration;

use tower::ServiceExt;
use weir::admission::AdmissionRouter;
use weir::api;
use weir::branch::{branch_id, BranchRegistry};
use weir::change::Change;
use weir::collaborators::{FakeContainerManager, LoggingNotifier, NoOpWorkflowCanceller, NoOpWorktreeManager};
use weir::conflict::DirectoryOverlapConflictPredicate;
use weir::coordinator::{Coordinator, CoordinatorConfig};
use weir::executor::{ScriptedTestRunner, SpeculativeExecutor, TestOutcome};
use weir::kill::{KillSwitch, KillSwitchConfig};
use weir::locks::{FileLockCoordinator, InMemoryFileLockRegistry};
use weir::stats::Stats;
use weir::validator::{ProtectedBranches, Validator};

fn build(runner: Arc<ScriptedTestRunner>) -> Arc<Coordinator<ScriptedTestRunner>> {
    let registry = Arc::new(BranchRegistry::new());
    let admission = Arc::new(AdmissionRouter::new(Arc::new(DirectoryOverlapConflictPredicate::new(1)), 2));
    let stats = Arc::new(Stats::new(5));
    let executor = Arc::new(SpeculativeExecutor::new(registry.clone(), runner, stats.clone(), Duration::from_secs(5)));
    let kill_switch = Arc::new(KillSwitch::new(
        registry.clone(),
        Arc::new(NoOpWorkflowCanceller),
        Arc::new(FakeContainerManager::new()),
        Arc::new(NoOpWorktreeManager),
        Arc::new(LoggingNotifier),
        stats.clone(),
        KillSwitchConfig::default(),
    ));
    let validator = Arc::new(Validator::new(ProtectedBranches::new(Vec::<String>::new()), ["system"]));
    let lock_driver = Arc::new(FileLockCoordinator::new(InMemoryFileLockRegistry::new()));
    Arc::new(Coordinator::new(
        registry,
        admission,
        executor,
        kill_switch,
        validator,
        stats,
        lock_driver,
        Duration::from_secs(900),
        Duration::from_secs(300),
        CoordinatorConfig {
            tick_interval: Duration::from_millis(10),
            ..CoordinatorConfig::default()
        },
    ))
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn three_changes_merge_and_release_their_locks() {
    let runner = Arc::new(ScriptedTestRunner::new());
    let coordinator = build(runner);

    coordinator.submit(Change::new("c1", "r1", "agent-a").with_paths(["a/1"])).await.unwrap();
    coordinator.submit(Change::new("c2", "r2", "agent-b").with_paths(["b/1"])).await.unwrap();
    coordinator.submit(Change::new("c3", "r3", "agent-c").with_paths(["c/1"])).await.unwrap();
    coordinator.start();

    let merged = wait_until(|| coordinator.stats().merges >= 1, Duration::from_secs(2)).await;
    coordinator.stop().await.unwrap();

    assert!(merged, "expected the independent prefix to merge, got {:?}", coordinator.stats());

    // Locks released on merge: a fresh change touching the same path must
    // be admissible again immediately.
    coordinator.submit(Change::new("c4", "r4", "agent-a").with_paths(["a/1"])).await.unwrap();
}

#[tokio::test]
async fn mid_depth_failure_kills_branch_but_preserves_shallower_progress() {
    let runner = Arc::new(ScriptedTestRunner::new());
    runner.set_outcome("c2", TestOutcome::Failed("flaky assertion".into()));
    let coordinator = build(runner);

    coordinator.submit(Change::new("c1", "r1", "agent-a").with_paths(["a/1"])).await.unwrap();
    coordinator.submit(Change::new("c2", "r2", "agent-a").with_paths(["a/2"])).await.unwrap();
    coordinator.start();

    let merged = wait_until(|| coordinator.stats().merges >= 1, Duration::from_secs(2)).await;
    let killed = wait_until(|| coordinator.stats().kills >= 1, Duration::from_secs(2)).await;
    coordinator.stop().await.unwrap();

    assert!(merged, "depth-1 should still merge even though depth-2 failed");
    assert!(killed, "the depth-2 branch should have been killed");

    let depth2 = branch_id(&["c1".to_string(), "c2".to_string()]);
    let report = coordinator.health_report(&depth2, "system");
    assert!(!report.exists, "the failed depth-2 branch should be retired from the registry");
}

#[tokio::test]
async fn status_api_reports_health_for_a_branch_under_test() {
    let runner = Arc::new(ScriptedTestRunner::new());
    runner.block_until_cancelled("c1");
    let coordinator = build(runner);
    coordinator.submit(Change::new("c1", "r1", "agent-a").with_paths(["a/1"])).await.unwrap();
    coordinator.start();

    let depth1 = branch_id(&["c1".to_string()]);
    let appeared = wait_until(|| coordinator.health_report(&depth1, "system").exists, Duration::from_secs(1)).await;
    assert!(appeared, "branch should register once the executor schedules it");

    let app = api::router(coordinator.clone());
    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri(format!("/health/{depth1}"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    coordinator.stop().await.unwrap();
}
