//! Typed recurrence models behind `schedule_definition`.
//!
//! The stored JSON is decoded once, by the schedule's task-creation strategy,
//! into a [`ScheduleDefinition`]. Nothing past that boundary looks at raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cron::CronModel;
use crate::error::{Result, SchedError};
use crate::time;

/// Stored form of a cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronDefinition {
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfterRunModel {
    pub delay_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnceModel {
    pub execute_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDefinition {
    Cron(CronModel),
    AfterRun(AfterRunModel),
    Once(OnceModel),
}

impl ScheduleDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleDefinition::Cron(_) => "cron",
            ScheduleDefinition::AfterRun(_) => "after-run",
            ScheduleDefinition::Once(_) => "once",
        }
    }
}

/// Deserialize `raw` into `T`, reporting failures against `strategy`.
pub(crate) fn parse_json<T: for<'de> Deserialize<'de>>(strategy: &str, raw: &Value) -> Result<T> {
    serde_json::from_value(raw.clone())
        .map_err(|e| SchedError::invalid_definition(strategy, e.to_string()))
}

pub fn decode_cron(strategy: &str, raw: &Value) -> Result<ScheduleDefinition> {
    let def: CronDefinition = parse_json(strategy, raw)?;
    Ok(ScheduleDefinition::Cron(CronModel::parse(&def.expression)?))
}

pub fn decode_after_run(strategy: &str, raw: &Value) -> Result<ScheduleDefinition> {
    let model: AfterRunModel = parse_json(strategy, raw)?;
    if !(0..=time::MAX_OFFSET_SECONDS).contains(&model.delay_seconds) {
        return Err(SchedError::invalid_definition(
            strategy,
            format!(
                "delay_seconds must be within 0..={}, got {}",
                time::MAX_OFFSET_SECONDS,
                model.delay_seconds
            ),
        ));
    }
    Ok(ScheduleDefinition::AfterRun(model))
}

pub fn decode_once(strategy: &str, raw: &Value) -> Result<ScheduleDefinition> {
    let model: OnceModel = parse_json(strategy, raw)?;
    Ok(ScheduleDefinition::Once(model))
}
