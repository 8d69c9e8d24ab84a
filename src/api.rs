//! Read-only status HTTP surface: `GET /stats` and `GET /health/:branch_id`,
//! built on `axum` + `tower-http`. Mutation stays in-process via
//! `Coordinator::submit`/`stop` -- this surface never writes anything.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use log::info;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::executor::TestRunner;

pub fn router<T: TestRunner + 'static>(coordinator: Arc<Coordinator<T>>) -> Router {
    Router::new()
        .route("/stats", get(get_stats::<T>))
        .route("/health/:branch_id", get(get_health::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

pub async fn serve<T: TestRunner + 'static>(coordinator: Arc<Coordinator<T>>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(coordinator);
    info!("status API listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_stats<T: TestRunner + 'static>(State(coordinator): State<Arc<Coordinator<T>>>) -> impl IntoResponse {
    Json(coordinator.stats())
}

async fn get_health<T: TestRunner + 'static>(
    State(coordinator): State<Arc<Coordinator<T>>>,
    AxumPath(branch_id): AxumPath<String>,
) -> impl IntoResponse {
    let report = coordinator.health_report(&branch_id, "system");
    if report.exists {
        (StatusCode::OK, Json(report)).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(report)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionRouter;
    use crate::branch::BranchRegistry;
    use crate::collaborators::{FakeContainerManager, LoggingNotifier, NoOpWorkflowCanceller, NoOpWorktreeManager};
    use crate::conflict::NeverConflictPredicate;
    use crate::coordinator::CoordinatorConfig;
    use crate::executor::{AlwaysPassRunner, SpeculativeExecutor};
    use crate::kill::{KillSwitch, KillSwitchConfig};
    use crate::locks::{FileLockCoordinator, InMemoryFileLockRegistry};
    use crate::stats::Stats;
    use crate::validator::{ProtectedBranches, Validator};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn make_router() -> Router {
        let registry = Arc::new(BranchRegistry::new());
        let admission = Arc::new(AdmissionRouter::new(Arc::new(NeverConflictPredicate), 3));
        let stats = Arc::new(Stats::new(5));
        let executor = Arc::new(SpeculativeExecutor::new(registry.clone(), Arc::new(AlwaysPassRunner), stats.clone(), Duration::from_secs(5)));
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
        let coordinator = Arc::new(Coordinator::new(
            registry,
            admission,
            executor,
            kill_switch,
            validator,
            stats,
            lock_driver,
            Duration::from_secs(900),
            Duration::from_secs(300),
            CoordinatorConfig::default(),
        ));
        router(coordinator)
    }

    #[tokio::test]
    async fn stats_endpoint_returns_json() {
        let app = make_router();
        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_endpoint_404s_for_unknown_branch() {
        let app = make_router();
        let response = app
            .oneshot(Request::builder().uri("/health/branch-nonexistent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
