//! Workfarm CLI entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use workfarm::cli::{self, Cli, ReplContext};
use workfarm::domain::ports::oracle::Oracle;
use workfarm::domain::ports::store::StateStore;
use workfarm::domain::ports::worker::WorkerRuntime;
use workfarm::infrastructure::config::ConfigLoader;
use workfarm::infrastructure::store::JsonStateStore;
use workfarm::infrastructure::worker::{ProcessWorkerRuntime, SubprocessOracle};
use workfarm::infrastructure::logging;
use workfarm::services::{
    Adversary, AgentManager, Bridge, EventBus, GoalManager, PreferenceManager, SessionManager,
    TaskManager, TriggerScheduler, WorkspaceRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(worker) = cli.worker {
        config.worker.binary = worker;
    }

    let _log_guard = logging::init(&config.logging, &config.data_dir)?;
    tracing::info!(data_dir = %config.data_dir.display(), "starting workfarm");

    // Persistence and event plumbing.
    let json_store = JsonStateStore::new(config.data_dir.clone());
    json_store
        .initialize()
        .await
        .context("failed to initialize data directory")?;
    let store: Arc<dyn StateStore> = Arc::new(json_store);
    let bus = Arc::new(EventBus::default());
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();

    // External collaborators: worker subprocesses and the oracle.
    let runtime: Arc<dyn WorkerRuntime> =
        Arc::new(ProcessWorkerRuntime::new(config.worker.clone(), worker_tx));
    let oracle: Arc<dyn Oracle> = Arc::new(SubprocessOracle::new(
        config.worker.binary.clone(),
        config.data_dir.clone(),
        config.oracle.clone(),
    ));

    // Managers.
    let agents = Arc::new(AgentManager::new(store.clone(), bus.clone()));
    let tasks = Arc::new(TaskManager::new(store.clone(), bus.clone()));
    let goals = Arc::new(GoalManager::new(store.clone(), bus.clone()));
    let preferences = Arc::new(PreferenceManager::new(store.clone(), bus.clone()));
    let workspace = Arc::new(WorkspaceRegistry::new(store.clone()));
    let sessions = Arc::new(SessionManager::new(runtime, bus.clone()));

    agents.initialize().await;
    tasks.initialize().await;
    goals.initialize().await;
    workspace.initialize().await;

    // The bridge sweeps stale state, then starts consuming worker events.
    let bridge = Arc::new(Bridge::new(
        agents.clone(),
        tasks.clone(),
        sessions,
        goals.clone(),
        preferences.clone(),
        workspace.clone(),
        bus.clone(),
    ));
    bridge.initialize().await;
    let pump = bridge.clone().start_event_pump(worker_rx);

    let adversary = Arc::new(Adversary::new(
        oracle,
        bridge.clone(),
        agents.clone(),
        goals.clone(),
        tasks.clone(),
        preferences.clone(),
        workspace.clone(),
        bus.clone(),
    ));
    let listener = adversary.start();

    let scheduler = Arc::new(TriggerScheduler::new(
        goals.clone(),
        adversary.clone(),
        bus.clone(),
        Duration::from_millis(config.scheduler_tick_ms),
    ));
    let ticker = scheduler.start();

    let log_sink = spawn_log_sink(bus.clone(), store.clone());

    let result = cli::run(ReplContext {
        agents,
        tasks,
        goals,
        preferences,
        workspace,
        bridge,
        adversary,
        scheduler: scheduler.clone(),
        store,
        bus,
    })
    .await;

    scheduler.stop();
    ticker.abort();
    listener.abort();
    pump.abort();
    log_sink.abort();
    tracing::info!("workfarm stopped");
    result
}

/// Append every agent-attributed event to that agent's JSON-lines log.
fn spawn_log_sink(bus: Arc<EventBus>, store: Arc<dyn StateStore>) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "log sink lagged behind the event bus");
                    continue;
                }
                Err(_) => break,
            };
            let Some(agent_id) = event.agent_id else {
                continue;
            };
            let Ok(mut record) = serde_json::to_value(&event) else {
                continue;
            };
            if let Some(map) = record.as_object_mut() {
                map.insert(
                    "topic".to_string(),
                    serde_json::Value::String(event.payload.topic().to_string()),
                );
            }
            if let Err(e) = store.append_log(agent_id, &record).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "failed to append event log");
            }
        }
    })
}
