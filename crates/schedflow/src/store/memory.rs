//! In-process store with the same conditional-update semantics as [`super::PgStore`].
//!
//! One mutex guards all rows, so each call is atomic the way a single-row
//! `UPDATE ... WHERE` is in PostgreSQL.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{Store, COMPLETION_STATES};
use crate::error::Result;
use crate::time;
use crate::schedules::model::{
    NewScheduledJob, NewTask, ScheduledJob, Task, TaskState, TaskTransition, UpdateState,
};

#[derive(Default)]
struct Rows {
    schedules: BTreeMap<String, ScheduledJob>,
    tasks: BTreeMap<String, Task>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<Rows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raw row access for tests. Not part of the [`Store`] contract.
    pub fn test_access(&self) -> TestAccess<'_> {
        TestAccess { store: self }
    }
}

pub struct TestAccess<'a> {
    store: &'a MemoryStore,
}

impl TestAccess<'_> {
    pub fn schedules(&self) -> Vec<ScheduledJob> {
        self.store.rows().schedules.values().cloned().collect()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.store.rows().tasks.values().cloned().collect()
    }

    pub fn put_schedule(&self, schedule: ScheduledJob) {
        self.store
            .rows()
            .schedules
            .insert(schedule.id.clone(), schedule);
    }

    pub fn put_task(&self, task: Task) {
        self.store.rows().tasks.insert(task.id.clone(), task);
    }
}

fn build_schedule(id: &str, new: &NewScheduledJob, now: DateTime<Utc>) -> ScheduledJob {
    ScheduledJob {
        id: id.to_string(),
        lease_owner: None,
        lease_expires: None,
        update_state: None,
        update_task_pk: None,
        pasture: false,
        duplicate_strategy_name: new.duplicate_strategy_name.clone(),
        retry_strategy_name: new.retry_strategy_name.clone(),
        task_creation_strategy_name: new.task_creation_strategy_name.clone(),
        schedule_definition: new.schedule_definition.clone(),
        job_context: new.job_context.clone(),
        display_name: new.display_name.clone(),
        description: new.description.clone(),
        created_on: now,
        previous_schedule: None,
        previous_reason: None,
    }
}

fn holds_lease(rows: &Rows, schedule_id: &str, owner: &str) -> bool {
    rows.schedules
        .get(schedule_id)
        .and_then(|s| s.lease_owner.as_deref())
        == Some(owner)
}

fn take_limited<I: Iterator<Item = Task>>(iter: I, limit: i64) -> Vec<Task> {
    let mut out: Vec<Task> = iter.collect();
    out.sort_by(|a, b| a.execute_at.cmp(&b.execute_at).then(a.id.cmp(&b.id)));
    out.truncate(limit.max(0) as usize);
    out
}

fn timeout_check_due(task: &Task, now: DateTime<Utc>) -> bool {
    task.next_timeout_check.map_or(true, |at| at <= now)
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_schedule(
        &self,
        id: &str,
        new: &NewScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob> {
        let schedule = build_schedule(id, new, now);
        self.rows()
            .schedules
            .insert(id.to_string(), schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.rows().schedules.get(id).cloned())
    }

    async fn list_schedules(&self, include_pasture: bool, limit: i64) -> Result<Vec<ScheduledJob>> {
        let mut out: Vec<ScheduledJob> = self
            .rows()
            .schedules
            .values()
            .filter(|s| include_pasture || !s.pasture)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_on.cmp(&b.created_on).then(a.id.cmp(&b.id)));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn poll_cron_schedules(
        &self,
        strategy_names: &[String],
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>> {
        let rows = self.rows();
        let has_pending = |id: &str| {
            rows.tasks
                .values()
                .any(|t| t.schedule_id == id && t.state == TaskState::Pending)
        };

        let out = rows
            .schedules
            .values()
            .filter(|s| after_id.map_or(true, |after| s.id.as_str() > after))
            .filter(|s| !s.pasture && strategy_names.contains(&s.task_creation_strategy_name))
            .filter(|s| !has_pending(&s.id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(out)
    }

    async fn poll_expired_leases(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>> {
        let mut out: Vec<ScheduledJob> = self
            .rows()
            .schedules
            .values()
            .filter(|s| s.lease_expired(now, grace))
            .cloned()
            .collect();
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn try_acquire_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
        grace: Duration,
    ) -> Result<bool> {
        let mut rows = self.rows();
        let Some(schedule) = rows.schedules.get_mut(id) else {
            return Ok(false);
        };
        if schedule.is_locked(now, grace) {
            return Ok(false);
        }
        schedule.lease_owner = Some(owner.to_string());
        schedule.lease_expires = Some(expires);
        Ok(true)
    }

    async fn renew_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
        grace: Duration,
    ) -> Result<bool> {
        let mut rows = self.rows();
        let Some(schedule) = rows.schedules.get_mut(id) else {
            return Ok(false);
        };
        if schedule.lease_owner.as_deref() != Some(owner) || !schedule.is_locked(now, grace) {
            return Ok(false);
        }
        schedule.lease_expires = Some(expires);
        Ok(true)
    }

    async fn release_lease(&self, id: &str, owner: &str) -> Result<bool> {
        let mut rows = self.rows();
        let Some(schedule) = rows.schedules.get_mut(id) else {
            return Ok(false);
        };
        if schedule.lease_owner.as_deref() != Some(owner) {
            return Ok(false);
        }
        schedule.lease_owner = None;
        schedule.lease_expires = None;
        Ok(true)
    }

    async fn set_update_state(
        &self,
        id: &str,
        owner: &str,
        state: Option<UpdateState>,
        task_pk: Option<&str>,
    ) -> Result<bool> {
        let mut rows = self.rows();
        match rows.schedules.get_mut(id) {
            Some(schedule) if schedule.lease_owner.as_deref() == Some(owner) => {
                schedule.update_state = state;
                schedule.update_task_pk = task_pk.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_pasture(&self, id: &str, owner: &str) -> Result<bool> {
        let mut rows = self.rows();
        match rows.schedules.get_mut(id) {
            Some(schedule) if schedule.lease_owner.as_deref() == Some(owner) => {
                schedule.pasture = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn supersede_schedule(
        &self,
        old_id: &str,
        owner: &str,
        new_id: &str,
        new: &NewScheduledJob,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>> {
        let mut rows = self.rows();
        match rows.schedules.get_mut(old_id) {
            Some(old) if old.lease_owner.as_deref() == Some(owner) => old.pasture = true,
            _ => return Ok(None),
        }

        let mut replacement = build_schedule(new_id, new, now);
        replacement.previous_schedule = Some(old_id.to_string());
        replacement.previous_reason = Some(reason.to_string());
        rows.schedules
            .insert(new_id.to_string(), replacement.clone());
        Ok(Some(replacement))
    }

    async fn insert_task(&self, owner: &str, task: &NewTask) -> Result<Option<Task>> {
        let mut rows = self.rows();
        if !holds_lease(&rows, &task.schedule_id, owner) {
            return Ok(None);
        }
        let row = Task {
            id: task.id.clone(),
            schedule_id: task.schedule_id.clone(),
            state: TaskState::Pending,
            created_on: task.created_on,
            execute_at: task.execute_at,
            execution_job_id: None,
            execution_queued: None,
            execution_started: None,
            execution_finished: None,
            next_timeout_check: None,
            retry_index: task.retry_index,
            completed_info: None,
        };
        rows.tasks.insert(row.id.clone(), row.clone());
        Ok(Some(row))
    }

    async fn transition_task(
        &self,
        task_id: &str,
        owner: &str,
        transition: &TaskTransition,
    ) -> Result<Option<Task>> {
        let mut rows = self.rows();
        let schedule_id = match rows.tasks.get(task_id) {
            Some(task) if task.state == transition.from => task.schedule_id.clone(),
            _ => return Ok(None),
        };
        if !holds_lease(&rows, &schedule_id, owner) {
            return Ok(None);
        }
        let Some(task) = rows.tasks.get_mut(task_id) else {
            return Ok(None);
        };
        task.apply(transition);
        Ok(Some(task.clone()))
    }

    async fn set_next_timeout_check(
        &self,
        task_id: &str,
        state: TaskState,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self.rows();
        match rows.tasks.get_mut(task_id) {
            Some(task) if task.state == state => {
                task.next_timeout_check = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.rows().tasks.get(id).cloned())
    }

    async fn tasks_for_schedule(
        &self,
        schedule_id: &str,
        states: &[TaskState],
    ) -> Result<Vec<Task>> {
        let rows = self.rows();
        let iter = rows
            .tasks
            .values()
            .filter(|t| t.schedule_id == schedule_id)
            .filter(|t| states.is_empty() || states.contains(&t.state))
            .cloned();
        Ok(take_limited(iter, i64::MAX))
    }

    async fn poll_executable_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Task>> {
        let rows = self.rows();
        let iter = rows
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending && t.execute_at <= now)
            .filter(|t| {
                rows.schedules
                    .get(&t.schedule_id)
                    .is_some_and(|s| !s.pasture)
            })
            .cloned();
        Ok(take_limited(iter, limit))
    }

    async fn poll_long_queued_tasks(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let cutoff = time::sub_seconds(now, timeout_seconds).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let rows = self.rows();
        let iter = rows
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued)
            .filter(|t| t.execution_queued.is_some_and(|q| q <= cutoff))
            .filter(|t| timeout_check_due(t, now))
            .cloned();
        Ok(take_limited(iter, limit))
    }

    async fn poll_long_executing_tasks(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let cutoff = time::sub_seconds(now, timeout_seconds).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let rows = self.rows();
        let iter = rows
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Started | TaskState::CompleteQueued))
            .filter(|t| t.execution_started.is_some_and(|s| s <= cutoff))
            .filter(|t| timeout_check_due(t, now))
            .cloned();
        Ok(take_limited(iter, limit))
    }

    async fn poll_completion_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let rows = self.rows();
        let iter = rows
            .tasks
            .values()
            .filter(|t| COMPLETION_STATES.contains(&t.state))
            .cloned();
        Ok(take_limited(iter, limit))
    }

    async fn poll_start_error_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let rows = self.rows();
        let iter = rows
            .tasks
            .values()
            .filter(|t| t.state == TaskState::StartError)
            .cloned();
        Ok(take_limited(iter, limit))
    }

    async fn task_state_counts(&self) -> Result<Vec<(TaskState, i64)>> {
        let rows = self.rows();
        Ok(TaskState::ALL
            .iter()
            .map(|st| {
                let n = rows.tasks.values().filter(|t| t.state == *st).count() as i64;
                (*st, n)
            })
            .filter(|(_, n)| *n > 0)
            .collect())
    }
}
