//! CLI entry point. Loads configuration, wires up collaborators, and starts
//! the coordinator alongside the read-only status API.
//!
//! A `clap`-derive CLI surface sized for the coordinator's longer-lived
//! service lifecycle (config path, listen address, graceful shutdown on
//! Ctrl-C) rather than a one-shot command.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use weir::admission::AdmissionRouter;
use weir::branch::BranchRegistry;
use weir::collaborators::{LoggingNotifier, NoOpContainerManager, NoOpWorktreeManager, ProcessWorkflowCanceller};
use weir::config::Config;
use weir::conflict::DirectoryOverlapConflictPredicate;
use weir::coordinator::Coordinator;
use weir::executor::{AlwaysPassRunner, CommandTestRunner, SpeculativeExecutor, TestRunner};
use weir::kill::KillSwitch;
use weir::locks::{FileLockCoordinator, InMemoryFileLockRegistry};
use weir::stats::Stats;
use weir::validator::Validator;

#[derive(Parser, Debug)]
#[command(author, version, about = "Speculative merge-queue coordinator")]
struct Args {
    /// Path to a TOML configuration file. Falls back to built-in defaults
    /// if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the config's `listen_addr` for the status API.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let listen_addr = args.listen.as_deref().unwrap_or(&config.listen_addr);
    let addr: SocketAddr = listen_addr.parse().with_context(|| format!("invalid listen address {listen_addr}"))?;

    let registry = Arc::new(BranchRegistry::new());
    let conflict = Arc::new(DirectoryOverlapConflictPredicate::new(config.conflict_depth));
    let admission = Arc::new(AdmissionRouter::new(conflict, config.max_bypass_slots));
    let stats = Arc::new(Stats::new(config.window_size));

    let lock_registry = InMemoryFileLockRegistry::new();
    let lock_driver = Arc::new(FileLockCoordinator::new(lock_registry));

    let kill_switch = Arc::new(KillSwitch::new(
        registry.clone(),
        Arc::new(ProcessWorkflowCanceller),
        Arc::new(NoOpContainerManager),
        Arc::new(NoOpWorktreeManager),
        Arc::new(LoggingNotifier),
        stats.clone(),
        config.kill_switch_config(),
    ));
    let validator = Arc::new(Validator::new(config.protected_branches(), config.system_agents.clone()));

    match config.test_command.clone() {
        Some(command) => {
            let runner = Arc::new(CommandTestRunner::new(command));
            run(registry, admission, runner, kill_switch, validator, stats, lock_driver, &config, addr).await
        }
        None => {
            info!("no test_command configured; using an always-pass runner");
            run(registry, admission, Arc::new(AlwaysPassRunner), kill_switch, validator, stats, lock_driver, &config, addr).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<T: TestRunner + 'static>(
    registry: Arc<BranchRegistry>,
    admission: Arc<AdmissionRouter>,
    runner: Arc<T>,
    kill_switch: Arc<KillSwitch>,
    validator: Arc<Validator>,
    stats: Arc<Stats>,
    lock_driver: Arc<FileLockCoordinator<InMemoryFileLockRegistry>>,
    config: &Config,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let executor = Arc::new(SpeculativeExecutor::new(registry.clone(), runner, stats.clone(), config.test_timeout()));
    let coordinator = Arc::new(Coordinator::new(
        registry,
        admission,
        executor,
        kill_switch,
        validator,
        stats,
        lock_driver,
        config.lock_ttl(),
        config.lock_renewal_interval(),
        config.coordinator_config(),
    ));

    coordinator.start();
    info!("coordinator started");

    tokio::select! {
        result = weir::api::serve(coordinator.clone(), addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    coordinator.stop().await?;
    Ok(())
}
