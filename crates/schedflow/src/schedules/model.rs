use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Life-cycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Queued,
    Started,
    StartError,
    CompleteQueued,
    CompleteError,
    Completed,
    Failed,
    FailRestarted,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::Pending,
        TaskState::Queued,
        TaskState::Started,
        TaskState::StartError,
        TaskState::CompleteQueued,
        TaskState::CompleteError,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::FailRestarted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Started => "started",
            TaskState::StartError => "start-error",
            TaskState::CompleteQueued => "complete-queued",
            TaskState::CompleteError => "complete-error",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::FailRestarted => "fail-restarted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::FailRestarted
        )
    }

    /// States a task may move to from `self`.
    pub fn successors(&self) -> &'static [TaskState] {
        match self {
            TaskState::Pending => &[TaskState::Queued],
            TaskState::Queued => &[TaskState::Started, TaskState::StartError],
            TaskState::Started => &[TaskState::StartError, TaskState::CompleteQueued],
            TaskState::StartError => &[TaskState::Queued],
            TaskState::CompleteQueued => &[
                TaskState::CompleteError,
                TaskState::Completed,
                TaskState::Failed,
            ],
            TaskState::CompleteError => &[TaskState::CompleteQueued],
            // the retry tag is the only change a terminal task accepts
            TaskState::Failed => &[TaskState::FailRestarted],
            TaskState::Completed | TaskState::FailRestarted => &[],
        }
    }

    pub fn can_transition_to(&self, to: TaskState) -> bool {
        self.successors().contains(&to)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}

/// Marks a schedule whose tasks are mid-update by the lease holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    CreatingTask,
    ExecutingTask,
    CompletingTask,
    Disabling,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::CreatingTask => "creating-task",
            UpdateState::ExecutingTask => "executing-task",
            UpdateState::CompletingTask => "completing-task",
            UpdateState::Disabling => "disabling",
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UpdateState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating-task" => Ok(UpdateState::CreatingTask),
            "executing-task" => Ok(UpdateState::ExecutingTask),
            "completing-task" => Ok(UpdateState::CompletingTask),
            "disabling" => Ok(UpdateState::Disabling),
            other => Err(format!("unknown update state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,

    pub lease_owner: Option<String>,
    pub lease_expires: Option<DateTime<Utc>>,

    pub update_state: Option<UpdateState>,
    pub update_task_pk: Option<String>,

    pub pasture: bool,

    pub duplicate_strategy_name: String,
    pub retry_strategy_name: String,
    pub task_creation_strategy_name: String,
    pub schedule_definition: Value,
    pub job_context: Value,

    pub display_name: String,
    pub description: Option<String>,
    pub created_on: DateTime<Utc>,

    pub previous_schedule: Option<String>,
    pub previous_reason: Option<String>,
}

impl ScheduledJob {
    /// Locked iff the lease (plus grace) still reaches past `now`.
    pub fn is_locked(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match self.lease_expires {
            Some(expires) => expires + grace > now,
            None => false,
        }
    }

    /// A lease is recorded but no longer valid: a worker lost it mid-flight.
    pub fn lease_expired(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.lease_expires.is_some() && !self.is_locked(now, grace)
    }

    pub fn job_handler(&self) -> Option<&str> {
        self.job_context.get("handler").and_then(Value::as_str)
    }
}

/// Administrative input for a new schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScheduledJob {
    pub display_name: String,
    pub description: Option<String>,
    pub task_creation_strategy_name: String,
    pub schedule_definition: Value,
    pub duplicate_strategy_name: String,
    pub retry_strategy_name: String,
    pub job_context: Value,
}

impl NewScheduledJob {
    pub fn new(display_name: &str, task_creation_strategy_name: &str, definition: Value) -> Self {
        Self {
            display_name: display_name.to_string(),
            description: None,
            task_creation_strategy_name: task_creation_strategy_name.to_string(),
            schedule_definition: definition,
            duplicate_strategy_name: "always-skip".to_string(),
            retry_strategy_name: "no-retry".to_string(),
            job_context: Value::Null,
        }
    }

    pub fn cron(display_name: &str, expression: &str) -> Self {
        Self::new(
            display_name,
            "cron",
            serde_json::json!({ "expression": expression }),
        )
    }

    pub fn once(display_name: &str, execute_at: DateTime<Utc>) -> Self {
        Self::new(
            display_name,
            "once",
            serde_json::json!({ "execute_at": execute_at }),
        )
    }

    pub fn after_run(display_name: &str, delay_seconds: i64) -> Self {
        Self::new(
            display_name,
            "after-run",
            serde_json::json!({ "delay_seconds": delay_seconds }),
        )
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn duplicate_strategy(mut self, name: &str) -> Self {
        self.duplicate_strategy_name = name.to_string();
        self
    }

    pub fn retry_strategy(mut self, name: &str) -> Self {
        self.retry_strategy_name = name.to_string();
        self
    }

    pub fn handler(mut self, handler: &str, payload: Value) -> Self {
        self.job_context = serde_json::json!({ "handler": handler, "payload": payload });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub schedule_id: String,
    pub state: TaskState,

    pub created_on: DateTime<Utc>,
    pub execute_at: DateTime<Utc>,

    pub execution_job_id: Option<String>,
    pub execution_queued: Option<DateTime<Utc>>,
    pub execution_started: Option<DateTime<Utc>>,
    pub execution_finished: Option<DateTime<Utc>>,

    pub next_timeout_check: Option<DateTime<Utc>>,
    pub retry_index: i32,
    pub completed_info: Option<Value>,
}

impl Task {
    /// Apply a checked transition in place. Timestamps are stamped at most once.
    pub fn apply(&mut self, t: &TaskTransition) {
        self.state = t.to;
        match t.to {
            TaskState::Queued => {
                self.execution_queued.get_or_insert(t.at);
            }
            TaskState::Started => {
                self.execution_started.get_or_insert(t.at);
                if t.execution_job_id.is_some() {
                    self.execution_job_id = t.execution_job_id.clone();
                }
            }
            TaskState::Completed | TaskState::Failed => {
                self.execution_finished.get_or_insert(t.at);
                self.completed_info = t.completed_info.clone();
            }
            _ => {}
        }
        self.next_timeout_check = None;
    }
}

/// Insert payload for a task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub schedule_id: String,
    pub execute_at: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    pub retry_index: i32,
}

/// One requested state change, applied by the store only if the task is still in `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
    pub execution_job_id: Option<String>,
    pub completed_info: Option<Value>,
}

impl TaskTransition {
    pub fn new(from: TaskState, to: TaskState, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            at,
            execution_job_id: None,
            completed_info: None,
        }
    }

    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.execution_job_id = Some(job_id.to_string());
        self
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.completed_info = Some(info);
        self
    }
}
