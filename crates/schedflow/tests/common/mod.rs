use std::sync::Arc;

use chrono::{DateTime, Utc};
use schedflow::events::{EventBus, SchedulerEvent};
use schedflow::executor::JobExecutor;
use schedflow::schedules::{Scheduler, SchedulerConfig};
use schedflow::store::MemoryStore;
use schedflow::strategies::Registries;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::broadcast;

/// Connects to `TEST_DATABASE_URL`, migrates, and empties every table.
/// `None` when the variable is unset so PostgreSQL tests can be skipped.
#[allow(dead_code)]
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping PostgreSQL test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE tasks, scheduled_jobs")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

#[allow(dead_code)]
pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("bad timestamp in test")
        .with_timezone(&Utc)
}

#[allow(dead_code)]
pub struct Harness {
    pub scheduler: Scheduler,
    pub store: MemoryStore,
    pub events: EventBus,
    pub rx: broadcast::Receiver<SchedulerEvent>,
}

#[allow(dead_code)]
pub fn memory_harness(executor: Arc<dyn JobExecutor>) -> Harness {
    memory_harness_with(executor, Registries::with_builtins())
}

#[allow(dead_code)]
pub fn memory_harness_with(executor: Arc<dyn JobExecutor>, registries: Registries) -> Harness {
    memory_harness_cfg(executor, registries, SchedulerConfig::default())
}

#[allow(dead_code)]
pub fn memory_harness_cfg(
    executor: Arc<dyn JobExecutor>,
    registries: Registries,
    cfg: SchedulerConfig,
) -> Harness {
    let store = MemoryStore::new();
    let events = EventBus::new();
    let rx = events.subscribe();

    let scheduler = Scheduler::new(
        Arc::new(store.clone()),
        executor,
        Arc::new(registries),
        events.clone(),
        cfg,
    )
    .expect("builtin strategies resolve");

    Harness {
        scheduler,
        store,
        events,
        rx,
    }
}

/// Everything published so far, oldest first.
#[allow(dead_code)]
pub fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[allow(dead_code)]
pub fn event_names(events: &[SchedulerEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}
