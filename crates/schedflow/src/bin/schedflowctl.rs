use std::env;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use schedflow::config::Config;
use schedflow::events::EventBus;
use schedflow::executor::LocalExecutor;
use schedflow::schedules::{NewScheduledJob, Scheduler, SchedulerConfig};
use schedflow::store::{PgStore, Store};
use schedflow::strategies::Registries;
use schedflow::{db, time};

const USAGE: &str = "schedflowctl <command>\n\
    Commands:\n\
    - migrate\n\
    - reset\n\
    - add-cron <name> <expression> [handler] [payload-json]\n\
    - add-once <name> <rfc3339-instant> [handler] [payload-json]\n\
    - add-after-run <name> <delay-seconds> [handler] [payload-json]\n\
    - disable <schedule_id>\n\
    - list [--all]\n\
    - tasks <schedule_id>\n\
    - stats\n\
    \n\
    Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = db::make_pool(&url).await?;

    match args[1].as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        "reset" => {
            db::truncate_all(&pool).await?;
            println!("reset OK");
        }
        "add-cron" => {
            let name = arg(&args, 2, "add-cron <name> <expression>")?;
            let expr = arg(&args, 3, "add-cron <name> <expression>")?;
            let new = with_handler(NewScheduledJob::cron(name, expr), &args, 4)?;
            add(&pool, new).await?;
        }
        "add-once" => {
            let name = arg(&args, 2, "add-once <name> <instant>")?;
            let at: DateTime<Utc> = arg(&args, 3, "add-once <name> <instant>")?.parse()?;
            let new = with_handler(NewScheduledJob::once(name, at), &args, 4)?;
            add(&pool, new).await?;
        }
        "add-after-run" => {
            let name = arg(&args, 2, "add-after-run <name> <delay-seconds>")?;
            let delay: i64 = arg(&args, 3, "add-after-run <name> <delay-seconds>")?.parse()?;
            let new = with_handler(NewScheduledJob::after_run(name, delay), &args, 4)?;
            add(&pool, new).await?;
        }
        "disable" => {
            let id = arg(&args, 2, "disable <schedule_id>")?;
            let disabled = scheduler(&pool)?
                .disable_schedule(id, time::now_utc())
                .await?;
            if disabled {
                println!("disabled {id}");
            } else {
                println!("not disabled (already retired or lease busy): {id}");
            }
        }
        "list" => {
            let include_pasture = args.get(2).map(|s| s == "--all").unwrap_or(false);
            list(&pool, include_pasture).await?;
        }
        "tasks" => {
            let id = arg(&args, 2, "tasks <schedule_id>")?;
            tasks(&pool, id).await?;
        }
        "stats" => stats(&pool).await?,
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, usage: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("usage: schedflowctl {usage}"))
}

fn with_handler(
    new: NewScheduledJob,
    args: &[String],
    idx: usize,
) -> anyhow::Result<NewScheduledJob> {
    let Some(handler) = args.get(idx) else {
        return Ok(new);
    };
    let payload: Value = match args.get(idx + 1) {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };
    Ok(new.handler(handler, payload))
}

fn scheduler(pool: &PgPool) -> anyhow::Result<Scheduler> {
    let cfg = Config::from_env()
        .map(|c| c.scheduler_config())
        .unwrap_or_else(|_| SchedulerConfig::default());

    // administrative commands never start jobs
    let scheduler = Scheduler::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(LocalExecutor::new()),
        Arc::new(Registries::with_builtins()),
        EventBus::new(),
        cfg,
    )?;
    Ok(scheduler)
}

async fn add(pool: &PgPool, new: NewScheduledJob) -> anyhow::Result<()> {
    let schedule = scheduler(pool)?
        .create_schedule(new, time::now_utc())
        .await?;
    println!(
        "created {} ({}) {}",
        schedule.id, schedule.task_creation_strategy_name, schedule.schedule_definition
    );
    Ok(())
}

async fn list(pool: &PgPool, include_pasture: bool) -> anyhow::Result<()> {
    let store = PgStore::new(pool.clone());
    let schedules = store.list_schedules(include_pasture, 500).await?;

    println!(
        "{:<36}  {:<10}  {:<7}  {:<20}  definition",
        "id", "strategy", "retired", "name"
    );
    for s in schedules {
        println!(
            "{:<36}  {:<10}  {:<7}  {:<20}  {}",
            s.id, s.task_creation_strategy_name, s.pasture, s.display_name, s.schedule_definition
        );
    }
    Ok(())
}

async fn tasks(pool: &PgPool, schedule_id: &str) -> anyhow::Result<()> {
    let store = PgStore::new(pool.clone());
    let tasks = store.tasks_for_schedule(schedule_id, &[]).await?;

    for t in tasks {
        println!(
            "{}  {:<16} execute_at={} retry={} job={} info={}",
            t.id,
            t.state.as_str(),
            t.execute_at.to_rfc3339(),
            t.retry_index,
            t.execution_job_id.as_deref().unwrap_or("-"),
            t.completed_info.unwrap_or(Value::Null)
        );
    }
    Ok(())
}

async fn stats(pool: &PgPool) -> anyhow::Result<()> {
    let store = PgStore::new(pool.clone());
    let counts = store.task_state_counts().await?;

    println!("\n=== task states ===");
    if counts.is_empty() {
        println!("(no tasks)");
    }
    for (state, n) in counts {
        println!("{:<16} {}", state.as_str(), n);
    }
    Ok(())
}
