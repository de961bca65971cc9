//! Task life-cycle transitions.
//!
//! Every method takes the lease owner id of the task's schedule. The store
//! applies the change only if that owner still holds the lease and the task
//! is still in the expected state; otherwise the call returns `Ok(None)` and
//! the caller should stop, another worker is handling the task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SchedError};
use crate::events::{EventBus, SchedulerEvent};
use crate::schedules::model::{NewTask, Task, TaskState, TaskTransition};
use crate::store::Store;

#[derive(Clone)]
pub struct TaskStateMachine {
    store: Arc<dyn Store>,
    events: EventBus,
}

impl TaskStateMachine {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn create(&self, owner: &str, task: &NewTask) -> Result<Option<Task>> {
        let created = self.store.insert_task(owner, task).await?;
        if let Some(t) = &created {
            debug!(task_id = %t.id, schedule_id = %t.schedule_id, execute_at = %t.execute_at, "task created");
            self.events
                .publish(SchedulerEvent::TaskCreated { task: t.clone() });
        }
        Ok(created)
    }

    /// Apply `transition` to `task`. Transitions outside the table fail before
    /// the store is touched.
    pub async fn transition(
        &self,
        task: &Task,
        owner: &str,
        transition: TaskTransition,
    ) -> Result<Option<Task>> {
        if transition.from != task.state || !transition.from.can_transition_to(transition.to) {
            return Err(SchedError::IllegalTransition {
                from: task.state,
                to: transition.to,
            });
        }

        let updated = self
            .store
            .transition_task(&task.id, owner, &transition)
            .await?;

        match &updated {
            Some(t) => {
                debug!(task_id = %t.id, from = %transition.from, to = %transition.to, "task transition");
                if let Some(event) = event_for(t) {
                    self.events.publish(event);
                }
            }
            None => {
                debug!(task_id = %task.id, from = %transition.from, to = %transition.to, "task transition lost");
            }
        }

        Ok(updated)
    }

    pub async fn mark_queued(&self, task: &Task, owner: &str, at: DateTime<Utc>) -> Result<Option<Task>> {
        self.transition(task, owner, TaskTransition::new(task.state, TaskState::Queued, at))
            .await
    }

    pub async fn mark_started(
        &self,
        task: &Task,
        owner: &str,
        execution_job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let t = TaskTransition::new(task.state, TaskState::Started, at).with_job_id(execution_job_id);
        self.transition(task, owner, t).await
    }

    pub async fn mark_start_error(&self, task: &Task, owner: &str, at: DateTime<Utc>) -> Result<Option<Task>> {
        self.transition(task, owner, TaskTransition::new(task.state, TaskState::StartError, at))
            .await
    }

    pub async fn mark_complete_queued(
        &self,
        task: &Task,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        self.transition(
            task,
            owner,
            TaskTransition::new(task.state, TaskState::CompleteQueued, at),
        )
        .await
    }

    pub async fn mark_complete_error(
        &self,
        task: &Task,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        self.transition(
            task,
            owner,
            TaskTransition::new(task.state, TaskState::CompleteError, at),
        )
        .await
    }

    /// `complete-queued -> completed | failed` with the backend's outcome payload.
    pub async fn mark_finished(
        &self,
        task: &Task,
        owner: &str,
        succeeded: bool,
        info: Value,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let to = if succeeded {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        self.transition(task, owner, TaskTransition::new(task.state, to, at).with_info(info))
            .await
    }

    pub async fn mark_fail_restarted(
        &self,
        task: &Task,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        self.transition(
            task,
            owner,
            TaskTransition::new(task.state, TaskState::FailRestarted, at),
        )
        .await
    }
}

fn event_for(task: &Task) -> Option<SchedulerEvent> {
    let task = task.clone();
    match task.state {
        TaskState::Queued => Some(SchedulerEvent::TaskReadyToExecute { task }),
        TaskState::Started => Some(SchedulerEvent::TaskRunning { task }),
        TaskState::Completed | TaskState::Failed => Some(SchedulerEvent::TaskFinished { task }),
        _ => None,
    }
}
