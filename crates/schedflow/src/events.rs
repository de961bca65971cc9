//! Typed publish/subscribe channel for scheduler notifications.
//!
//! Every component that emits events receives an [`EventBus`] at construction;
//! there is no process-wide instance. Publishing never blocks and never fails:
//! with no subscribers the event is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::executor::JobExecutionState;
use crate::schedules::model::{Task, UpdateState};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SchedulerEvent {
    ScheduledJobDisabled {
        schedule_id: String,
    },
    ScheduledJobLeaseExpired {
        schedule_id: String,
        lease_owner: Option<String>,
        lease_expires: Option<DateTime<Utc>>,
        update_state: Option<UpdateState>,
        update_task_pk: Option<String>,
    },
    TaskCreated {
        task: Task,
    },
    TaskReadyToExecute {
        task: Task,
    },
    TaskRunning {
        task: Task,
    },
    TaskFinished {
        task: Task,
    },
    TaskQueuedLong {
        task: Task,
    },
    TaskExecutingLong {
        task: Task,
    },
    JobExecutionFinished {
        task_id: String,
        execution_job_id: String,
        state: JobExecutionState,
    },
    GeneralError {
        source: String,
        message: String,
    },
    InvalidScheduleDefinition {
        schedule_id: Option<String>,
        strategy: String,
        reason: String,
    },
}

impl SchedulerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::ScheduledJobDisabled { .. } => "scheduledJobDisabled",
            SchedulerEvent::ScheduledJobLeaseExpired { .. } => "scheduledJobLeaseExpired",
            SchedulerEvent::TaskCreated { .. } => "taskCreated",
            SchedulerEvent::TaskReadyToExecute { .. } => "taskReadyToExecute",
            SchedulerEvent::TaskRunning { .. } => "taskRunning",
            SchedulerEvent::TaskFinished { .. } => "taskFinished",
            SchedulerEvent::TaskQueuedLong { .. } => "taskQueuedLong",
            SchedulerEvent::TaskExecutingLong { .. } => "taskExecutingLong",
            SchedulerEvent::JobExecutionFinished { .. } => "jobExecutionFinished",
            SchedulerEvent::GeneralError { .. } => "generalError",
            SchedulerEvent::InvalidScheduleDefinition { .. } => "invalidScheduleDefinition",
        }
    }

    pub fn general_error(source: &str, err: impl std::fmt::Display) -> Self {
        SchedulerEvent::GeneralError {
            source: source.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
