//! Datastore contract consumed by the scheduling core.
//!
//! Every mutating call is a single conditional update. A guard that does not
//! hold (someone else owns the lease, the task already moved on) yields
//! `Ok(false)` / `Ok(None)`, never an error.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::schedules::model::{
    NewScheduledJob, NewTask, ScheduledJob, Task, TaskState, TaskTransition, UpdateState,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ----------------------------
    // Schedules
    // ----------------------------

    async fn insert_schedule(
        &self,
        id: &str,
        new: &NewScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob>;

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledJob>>;

    async fn list_schedules(&self, include_pasture: bool, limit: i64) -> Result<Vec<ScheduledJob>>;

    /// Active schedules whose task-creation strategy is one of `strategy_names`
    /// and that have no `pending` task, in id order starting after `after_id`.
    async fn poll_cron_schedules(
        &self,
        strategy_names: &[String],
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>>;

    /// Schedules holding a lease that ran out (`lease_expires + grace <= now`).
    async fn poll_expired_leases(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>>;

    // ----------------------------
    // Lease CAS
    // ----------------------------

    /// Take the lease if nobody holds a live one.
    async fn try_acquire_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
        grace: Duration,
    ) -> Result<bool>;

    /// Push `lease_expires` forward if `owner` still holds a live lease.
    async fn renew_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
        grace: Duration,
    ) -> Result<bool>;

    /// Clear the lease if `owner` is still the recorded holder.
    async fn release_lease(&self, id: &str, owner: &str) -> Result<bool>;

    // ----------------------------
    // Lease-guarded schedule writes
    // ----------------------------

    async fn set_update_state(
        &self,
        id: &str,
        owner: &str,
        state: Option<UpdateState>,
        task_pk: Option<&str>,
    ) -> Result<bool>;

    async fn set_pasture(&self, id: &str, owner: &str) -> Result<bool>;

    /// Retire `old_id` and insert its replacement with lineage fields set.
    async fn supersede_schedule(
        &self,
        old_id: &str,
        owner: &str,
        new_id: &str,
        new: &NewScheduledJob,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>>;

    // ----------------------------
    // Tasks
    // ----------------------------

    /// Insert a task if `owner` holds the owning schedule's lease.
    async fn insert_task(&self, owner: &str, task: &NewTask) -> Result<Option<Task>>;

    /// Apply `transition` if the task is still in `transition.from` and `owner`
    /// holds the owning schedule's lease.
    async fn transition_task(
        &self,
        task_id: &str,
        owner: &str,
        transition: &TaskTransition,
    ) -> Result<Option<Task>>;

    /// Sweep bookkeeping; guarded on the task still being in `state`.
    async fn set_next_timeout_check(
        &self,
        task_id: &str,
        state: TaskState,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Tasks of one schedule, restricted to `states` unless it is empty.
    async fn tasks_for_schedule(&self, schedule_id: &str, states: &[TaskState])
        -> Result<Vec<Task>>;

    /// `pending` tasks with `execute_at <= now` on active schedules, oldest first.
    async fn poll_executable_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Task>>;

    /// `queued` tasks whose `execution_queued` is older than `timeout_seconds`.
    async fn poll_long_queued_tasks(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: i64,
        limit: i64,
    ) -> Result<Vec<Task>>;

    /// `started`/`complete-queued` tasks whose `execution_started` is older than `timeout_seconds`.
    async fn poll_long_executing_tasks(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: i64,
        limit: i64,
    ) -> Result<Vec<Task>>;

    /// Tasks waiting on the execution backend (`started`, `complete-queued`, `complete-error`).
    async fn poll_completion_tasks(&self, limit: i64) -> Result<Vec<Task>>;

    async fn poll_start_error_tasks(&self, limit: i64) -> Result<Vec<Task>>;

    async fn task_state_counts(&self) -> Result<Vec<(TaskState, i64)>>;
}

/// States that still need the owning schedule's attention.
pub const ACTIVE_STATES: [TaskState; 6] = [
    TaskState::Pending,
    TaskState::Queued,
    TaskState::Started,
    TaskState::StartError,
    TaskState::CompleteQueued,
    TaskState::CompleteError,
];

pub const COMPLETION_STATES: [TaskState; 3] = [
    TaskState::Started,
    TaskState::CompleteQueued,
    TaskState::CompleteError,
];
