use std::sync::Arc;

use super::StrategyRegistry;
use crate::schedules::model::{NewTask, ScheduledJob, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    Run,
    Skip,
}

impl DuplicateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateDecision::Run => "run",
            DuplicateDecision::Skip => "skip",
        }
    }
}

/// Resolves overlap between a newly computed task and the schedule's
/// non-terminal tasks. Only consulted when `active_tasks` is non-empty.
pub trait DuplicateTaskStrategy: Send + Sync {
    fn decide(
        &self,
        schedule: &ScheduledJob,
        active_tasks: &[Task],
        new_task: &NewTask,
    ) -> DuplicateDecision;
}

#[derive(Debug, Default, Clone)]
pub struct AlwaysRun;

impl DuplicateTaskStrategy for AlwaysRun {
    fn decide(&self, _: &ScheduledJob, _: &[Task], _: &NewTask) -> DuplicateDecision {
        DuplicateDecision::Run
    }
}

/// Keeps a schedule single-flight.
#[derive(Debug, Default, Clone)]
pub struct AlwaysSkip;

impl DuplicateTaskStrategy for AlwaysSkip {
    fn decide(&self, _: &ScheduledJob, active_tasks: &[Task], _: &NewTask) -> DuplicateDecision {
        if active_tasks.is_empty() {
            DuplicateDecision::Run
        } else {
            DuplicateDecision::Skip
        }
    }
}

pub(crate) fn register_builtins(registry: &mut StrategyRegistry<dyn DuplicateTaskStrategy>) {
    registry.register("always-run", Arc::new(AlwaysRun));
    registry.register("always-skip", Arc::new(AlwaysSkip));
}
