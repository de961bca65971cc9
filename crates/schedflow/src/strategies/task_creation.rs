use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::StrategyRegistry;
use crate::error::Result;
use crate::schedules::definition::{self, ScheduleDefinition};
use crate::time;

/// Poll cadence for schedules that fire independently of task completion.
pub const POLL_CRON: &str = "cron";
/// Completion-driven or single-shot schedules; never polled.
pub const POLL_NONE: &str = "none";

/// Decides when a schedule's next task should run.
///
/// All three computations are pure. `None` means "no task now": the schedule
/// is exhausted, or this hook does not apply to the recurrence kind.
pub trait TaskCreationStrategy: Send + Sync {
    /// Which poll loop (if any) must visit schedules using this strategy.
    fn poll_strategy(&self) -> &'static str;

    fn decode(&self, raw: &Value) -> Result<ScheduleDefinition>;

    fn create_from_new_schedule(
        &self,
        now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>>;

    /// `now` is the instant the previous task finished.
    fn create_after_task_completes(
        &self,
        now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>>;

    fn create_on_poll(
        &self,
        now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Default, Clone)]
pub struct CronStrategy;

impl TaskCreationStrategy for CronStrategy {
    fn poll_strategy(&self) -> &'static str {
        POLL_CRON
    }

    fn decode(&self, raw: &Value) -> Result<ScheduleDefinition> {
        definition::decode_cron("cron", raw)
    }

    fn create_from_new_schedule(
        &self,
        now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        self.create_on_poll(now, definition)
    }

    fn create_after_task_completes(
        &self,
        _now: DateTime<Utc>,
        _definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        None
    }

    fn create_on_poll(
        &self,
        now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        match definition {
            ScheduleDefinition::Cron(model) => model.next_after(time::to_utc(now)),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AfterRunStrategy;

impl TaskCreationStrategy for AfterRunStrategy {
    fn poll_strategy(&self) -> &'static str {
        POLL_NONE
    }

    fn decode(&self, raw: &Value) -> Result<ScheduleDefinition> {
        definition::decode_after_run("after-run", raw)
    }

    fn create_from_new_schedule(
        &self,
        now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        match definition {
            ScheduleDefinition::AfterRun(model) => Some(model.first_run_at.unwrap_or(now)),
            _ => None,
        }
    }

    fn create_after_task_completes(
        &self,
        now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        match definition {
            ScheduleDefinition::AfterRun(model) => time::add_seconds(now, model.delay_seconds),
            _ => None,
        }
    }

    fn create_on_poll(
        &self,
        _now: DateTime<Utc>,
        _definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Default, Clone)]
pub struct OnceStrategy;

impl TaskCreationStrategy for OnceStrategy {
    fn poll_strategy(&self) -> &'static str {
        POLL_NONE
    }

    fn decode(&self, raw: &Value) -> Result<ScheduleDefinition> {
        definition::decode_once("once", raw)
    }

    fn create_from_new_schedule(
        &self,
        _now: DateTime<Utc>,
        definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        match definition {
            ScheduleDefinition::Once(model) => Some(model.execute_at),
            _ => None,
        }
    }

    fn create_after_task_completes(
        &self,
        _now: DateTime<Utc>,
        _definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        None
    }

    fn create_on_poll(
        &self,
        _now: DateTime<Utc>,
        _definition: &ScheduleDefinition,
    ) -> Option<DateTime<Utc>> {
        None
    }
}

pub(crate) fn register_builtins(registry: &mut StrategyRegistry<dyn TaskCreationStrategy>) {
    registry.register("cron", Arc::new(CronStrategy));
    registry.register("after-run", Arc::new(AfterRunStrategy));
    registry.register("once", Arc::new(OnceStrategy));
}
