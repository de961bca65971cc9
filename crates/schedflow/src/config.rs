use crate::schedules::engine::SchedulerConfig;

/// Runtime configuration, read from the environment (and `.env`).
///
/// Every key is looked up as `SCHEDFLOW_<KEY>` first, then `<KEY>`.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub lease_seconds: i64,
    pub lease_grace_seconds: i64,
    pub poll_limit: i64,
    pub queued_timeout_seconds: i64,
    pub executing_timeout_seconds: i64,
    pub poll_wait_strategy: String,
    pub sweep_wait_strategy: String,
    pub lease_id_strategy: String,
    pub primary_key_strategy: String,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("SCHEDFLOW_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("SCHEDFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let lease_seconds = env_i64("LEASE_SECONDS", 30).max(1);
        let lease_grace_seconds = env_i64("LEASE_GRACE_SECONDS", 0).max(0);
        let poll_limit = env_i64("POLL_LIMIT", 50).clamp(1, 10_000);
        let queued_timeout_seconds = env_i64("QUEUED_TIMEOUT_SECONDS", 300).max(1);
        let executing_timeout_seconds = env_i64("EXECUTING_TIMEOUT_SECONDS", 3600).max(1);

        let poll_wait_strategy = env_string("POLL_WAIT_STRATEGY", "simple-backoff");
        let sweep_wait_strategy = env_string("SWEEP_WAIT_STRATEGY", "constant-30s");
        let lease_id_strategy = env_string("LEASE_ID_STRATEGY", "uuid");
        let primary_key_strategy = env_string("PRIMARY_KEY_STRATEGY", "uuid-v4");

        let migrate_on_startup = env_bool("SCHEDFLOW_MIGRATE_ON_STARTUP")
            .or_else(|| env_bool("MIGRATE_ON_STARTUP"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            worker_id,
            lease_seconds,
            lease_grace_seconds,
            poll_limit,
            queued_timeout_seconds,
            executing_timeout_seconds,
            poll_wait_strategy,
            sweep_wait_strategy,
            lease_id_strategy,
            primary_key_strategy,
            migrate_on_startup,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            lease_seconds: self.lease_seconds,
            lease_grace_seconds: self.lease_grace_seconds,
            poll_limit: self.poll_limit,
            queued_timeout_seconds: self.queued_timeout_seconds,
            executing_timeout_seconds: self.executing_timeout_seconds,
            lease_id_strategy: self.lease_id_strategy.clone(),
            primary_key_strategy: self.primary_key_strategy.clone(),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_i64(key: &str, default: i64) -> i64 {
    env_or_fallback(&format!("SCHEDFLOW_{key}"), key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env_or_fallback(&format!("SCHEDFLOW_{key}"), key).unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
