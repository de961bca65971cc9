use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::StrategyRegistry;
use crate::schedules::model::{ScheduledJob, Task};
use crate::time;

/// Decides whether a `failed` task gets a successor, and when it runs.
///
/// `Some(execute_at)` synthesises a task with `retry_index + 1` and tags the
/// failed one `fail-restarted`. `None` leaves it `failed`.
pub trait RetryStrategy: Send + Sync {
    fn decide(
        &self,
        schedule: &ScheduledJob,
        failed_task: &Task,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Default, Clone)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn decide(&self, _: &ScheduledJob, _: &Task, _: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
}

/// Up to `max_retries` successors, each `delay_seconds` after the failure.
#[derive(Debug, Clone)]
pub struct FixedCountRetry {
    pub max_retries: i32,
    pub delay_seconds: i64,
}

impl Default for FixedCountRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_seconds: 60,
        }
    }
}

impl RetryStrategy for FixedCountRetry {
    fn decide(&self, _: &ScheduledJob, failed: &Task, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if failed.retry_index >= self.max_retries {
            return None;
        }
        time::add_seconds(now, self.delay_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub max_retries: i32,
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_seconds: 2,
            max_seconds: 15 * 60,
            jitter_pct: 0.20,
        }
    }
}

/// Exponential backoff, capped and jittered. See [`next_delay_seconds`].
#[derive(Debug, Clone, Default)]
pub struct BackoffRetry {
    pub cfg: BackoffConfig,
}

impl BackoffRetry {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg }
    }
}

impl RetryStrategy for BackoffRetry {
    fn decide(&self, _: &ScheduledJob, failed: &Task, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if failed.retry_index >= self.cfg.max_retries {
            return None;
        }
        // retry_index 0 failed -> first retry
        let delay = next_delay_seconds(failed.retry_index + 1, &self.cfg, &mut rand::thread_rng());
        time::add_seconds(now, delay)
    }
}

/// `base * 2^(retry_no - 1)`, capped at `max_seconds`, then ±`jitter_pct`,
/// clamped to `[0, max_seconds]`.
pub fn next_delay_seconds(retry_no: i32, cfg: &BackoffConfig, rng: &mut impl Rng) -> i64 {
    let exp = (retry_no.max(1) as u32).saturating_sub(1);

    // too large an exponent just saturates; the cap handles it
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);
    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    if jitter_range <= 0.0 {
        return delay.clamp(0, cfg.max_seconds);
    }
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    ((delay as f64 + jitter).round() as i64).clamp(0, cfg.max_seconds)
}

pub(crate) fn register_builtins(registry: &mut StrategyRegistry<dyn RetryStrategy>) {
    registry.register("no-retry", Arc::new(NoRetry));
    registry.register("fixed-count", Arc::new(FixedCountRetry::default()));
    registry.register("backoff", Arc::new(BackoffRetry::default()));
}
