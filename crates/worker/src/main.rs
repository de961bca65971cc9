use schedflow::config;
use schedflow::db;
use schedflow::events::{EventBus, SchedulerEvent};
use schedflow::poll::TokioRegistrar;
use schedflow::schedules::Scheduler;
use schedflow::store::PgStore;
use schedflow::strategies::lease_id::WorkerPrefixedLeaseId;
use schedflow::strategies::Registries;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod handlers;
use handlers::build_executor;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::Config::from_env()?;

    info!(
        worker_id = %cfg.worker_id,
        lease_seconds = cfg.lease_seconds,
        lease_grace_seconds = cfg.lease_grace_seconds,
        poll_limit = cfg.poll_limit,
        poll_wait = %cfg.poll_wait_strategy,
        sweep_wait = %cfg.sweep_wait_strategy,
        lease_id = %cfg.lease_id_strategy,
        primary_key = %cfg.primary_key_strategy,
        migrate_on_startup = cfg.migrate_on_startup,
        "schedflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let mut registries = Registries::with_builtins();
    registries.lease_id.register(
        "worker-prefixed",
        Arc::new(WorkerPrefixedLeaseId::new(&cfg.worker_id)),
    );
    let registries = Arc::new(registries);

    let executor = build_executor();
    info!(handlers = ?executor.handler_names(), "job handlers registered");

    let events = EventBus::new();
    let event_log = tokio::spawn(log_events(events.subscribe()));

    let scheduler = Scheduler::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(executor),
        registries.clone(),
        events.clone(),
        cfg.scheduler_config(),
    )?;

    let poll_wait = registries.poll_wait.get(&cfg.poll_wait_strategy)?;
    let sweep_wait = registries.poll_wait.get(&cfg.sweep_wait_strategy)?;

    let registrar = Arc::new(TokioRegistrar::new());
    let loops = scheduler.poll_loops(registrar.clone(), poll_wait.as_ref(), sweep_wait.as_ref())?;
    for l in &loops {
        l.start();
    }
    info!(loops = loops.len(), "poll loops started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; waiting for in-flight passes");

    registrar.stop();
    if tokio::time::timeout(DRAIN_TIMEOUT, registrar.drain()).await.is_err() {
        warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "in-flight passes did not finish");
    }

    for l in &loops {
        debug!(poll = %l.name(), iterations = l.iterations(), "poll loop stopped");
    }

    event_log.abort();
    pool.close().await;
    info!("schedflow worker stopped");
    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<SchedulerEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event log fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let payload = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            SchedulerEvent::GeneralError { source, message } => {
                warn!(source = %source, error = %message, "scheduler error")
            }
            SchedulerEvent::ScheduledJobLeaseExpired { .. }
            | SchedulerEvent::TaskQueuedLong { .. }
            | SchedulerEvent::TaskExecutingLong { .. }
            | SchedulerEvent::InvalidScheduleDefinition { .. } => {
                warn!(event = event.name(), payload = %payload, "scheduler event")
            }
            _ => debug!(event = event.name(), payload = %payload, "scheduler event"),
        }
    }
}
