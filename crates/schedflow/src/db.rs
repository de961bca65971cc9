use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let max_connections = env_parse::<u32>("SCHEDFLOW_DB_MAX_CONNECTIONS")
        .unwrap_or(8)
        .clamp(1, 64);

    let acquire_timeout_secs = env_parse::<u64>("SCHEDFLOW_DB_ACQUIRE_TIMEOUT_SECS")
        .unwrap_or(10)
        .clamp(1, 60);

    let disable_jit = env_bool("SCHEDFLOW_DISABLE_JIT", true);

    let opts = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET TIME ZONE 'UTC'").execute(&mut *conn).await?;
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        });

    let pool = opts.connect(database_url).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Drop every row. Used by `schedflowctl reset` and tests.
pub async fn truncate_all(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("TRUNCATE tasks, scheduled_jobs").execute(pool).await?;
    Ok(())
}
