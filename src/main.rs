use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use mech_worker::config::WorkerConfig;
use mech_worker::delivery::LogDelivery;
use mech_worker::fixture::Fixture;
use mech_worker::health;
use mech_worker::ledger::InMemoryLedger;
use mech_worker::storage::{CallTracker, InMemoryContentStore};
use mech_worker::tools::ToolRegistry;
use mech_worker::worker::{SchedulerDeps, TaskScheduler, spawn_scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = WorkerConfig::from_env().context("Failed to load configuration")?;

    eprintln!("⚙️  Mech Worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {}", config.agent_address);
    eprintln!("   Slots: {}", config.max_executing_tasks);
    eprintln!(
        "   Deadline: {}s (timeout limit {})",
        config.task_deadline.as_secs(),
        config.timeout_limit
    );

    // ── Collaborators ────────────────────────────────────────────────────
    let tracker = CallTracker::new();
    let ledger = Arc::new(InMemoryLedger::with_tracker(Arc::clone(&tracker)));
    let store = Arc::new(InMemoryContentStore::with_tracker(Arc::clone(&tracker)));

    if let Ok(path) = std::env::var("MECH_FIXTURE_PATH") {
        let path = PathBuf::from(path);
        let fixture = Fixture::load(&path)
            .with_context(|| format!("Failed to load fixture {}", path.display()))?;
        let installed = fixture.install(&ledger, &store).await?;
        // Fixture tools are added after configured ones, keeping their order.
        for (hash, tools) in installed.file_hash_to_tools {
            config.file_hash_to_tools.entry(hash).or_default().extend(tools);
        }
        eprintln!(
            "   Fixture: {} ({} requests)",
            path.display(),
            installed.requests
        );
    }

    let tools = Arc::new(ToolRegistry::with_builtin_tools());
    eprintln!(
        "   Tools: {} configured, {} executables",
        config.tools_to_file_hash().len(),
        tools.len().await
    );

    // ── Scheduler ────────────────────────────────────────────────────────
    let health_port = config.health_port;
    let scheduler = TaskScheduler::new(
        config,
        SchedulerDeps {
            ledger,
            store,
            delivery: Arc::new(LogDelivery),
            tools,
        },
    );
    let done_tasks = scheduler.done_tasks();
    let health_state = scheduler.health();
    let (scheduler_handle, shutdown) = spawn_scheduler(scheduler);

    // ── Health endpoint ──────────────────────────────────────────────────
    if let Some(port) = health_port {
        eprintln!("   Health: http://0.0.0.0:{port}/healthcheck");
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, health_state).await {
                tracing::error!(port, "Health server stopped: {e}");
            }
        });
    } else {
        eprintln!("   Health: disabled");
    }
    eprintln!("   Press Ctrl-C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    shutdown.store(true, Ordering::Relaxed);
    scheduler_handle.await.context("Scheduler task failed")?;

    let done = done_tasks.drain().await;
    eprintln!("\n{} done task(s)", done.len());
    for task in &done {
        println!("{}", serde_json::to_string(task)?);
    }

    Ok(())
}
