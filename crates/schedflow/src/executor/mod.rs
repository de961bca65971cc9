//! Job-execution backend boundary.

pub mod local;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::schedules::model::{ScheduledJob, Task};

pub use local::LocalExecutor;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum JobExecutionState {
    Running,
    Succeeded { info: Value },
    Failed { info: Value },
    /// The backend has no record of the execution-job id.
    Unknown,
}

impl JobExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobExecutionState::Succeeded { .. } | JobExecutionState::Failed { .. }
        )
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Begin running `task` with its schedule's `job_context`; returns the
    /// execution-job id used for later polls.
    async fn start(&self, task: &Task, schedule: &ScheduledJob) -> Result<String>;

    async fn poll(&self, execution_job_id: &str) -> Result<JobExecutionState>;

    /// The scheduler has recorded the terminal outcome; state may be dropped.
    async fn release(&self, _execution_job_id: &str) -> Result<()> {
        Ok(())
    }
}
