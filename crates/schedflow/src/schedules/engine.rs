//! The scheduler: lease-guarded passes over schedules and tasks.
//!
//! Each pass is one poll-loop action. A pass reads candidate rows without a
//! lock, then takes the owning schedule's lease for every row it wants to
//! change. Losing a lease race or a task CAS just skips that row. A failure on
//! one row is reported and the pass moves on to the next.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedError};
use crate::events::{EventBus, SchedulerEvent};
use crate::executor::{JobExecutionState, JobExecutor};
use crate::poll::{self, PollLoop, RegisterPollCallback};
use crate::schedules::definition::ScheduleDefinition;
use crate::schedules::lease::LeaseManager;
use crate::schedules::model::{NewScheduledJob, NewTask, ScheduledJob, Task, TaskState, UpdateState};
use crate::schedules::tasks::TaskStateMachine;
use crate::store::{Store, ACTIVE_STATES};
use crate::strategies::{
    DuplicateDecision, GeneratePollWaitTimesStrategy, PrimaryKeyStrategy, Registries,
    TaskCreationStrategy,
};
use crate::time;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lease_seconds: i64,
    pub lease_grace_seconds: i64,
    pub poll_limit: i64,
    pub queued_timeout_seconds: i64,
    pub executing_timeout_seconds: i64,
    pub lease_id_strategy: String,
    pub primary_key_strategy: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 30,
            lease_grace_seconds: 0,
            poll_limit: 50,
            queued_timeout_seconds: 300,
            executing_timeout_seconds: 3600,
            lease_id_strategy: "uuid".to_string(),
            primary_key_strategy: "uuid-v4".to_string(),
        }
    }
}

/// A schedule's task-creation strategy plus its decoded definition.
struct Resolved {
    creation: Arc<dyn TaskCreationStrategy>,
    definition: ScheduleDefinition,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    executor: Arc<dyn JobExecutor>,
    registries: Arc<Registries>,
    events: EventBus,
    leases: LeaseManager,
    tasks: TaskStateMachine,
    keys: Arc<dyn PrimaryKeyStrategy>,
    cfg: SchedulerConfig,
    /// Last schedule id seen by the cron pass; the next page starts after it.
    cron_cursor: Arc<Mutex<Option<String>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn JobExecutor>,
        registries: Arc<Registries>,
        events: EventBus,
        cfg: SchedulerConfig,
    ) -> Result<Self> {
        let lease_ids = registries.lease_id.get(&cfg.lease_id_strategy)?;
        let keys = registries.primary_key.get(&cfg.primary_key_strategy)?;
        if !(1..=time::MAX_OFFSET_SECONDS).contains(&cfg.lease_seconds) {
            return Err(SchedError::InvalidLeaseDuration {
                seconds: cfg.lease_seconds,
            });
        }
        let grace = Duration::seconds(cfg.lease_grace_seconds.clamp(0, time::MAX_OFFSET_SECONDS));

        Ok(Self {
            leases: LeaseManager::new(store.clone(), lease_ids, grace, events.clone()),
            tasks: TaskStateMachine::new(store.clone(), events.clone()),
            store,
            executor,
            registries,
            events,
            keys,
            cfg,
            cron_cursor: Arc::new(Mutex::new(None)),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn tasks(&self) -> &TaskStateMachine {
        &self.tasks
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    // ----------------------------
    // Administrative operations
    // ----------------------------

    /// Insert a schedule and its first task (if its strategy yields one).
    pub async fn create_schedule(
        &self,
        new: NewScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob> {
        let resolved = self.validate(&new)?;

        let id = self.keys.create();
        let schedule = self.store.insert_schedule(&id, &new, now).await?;
        info!(
            schedule_id = %schedule.id,
            name = %schedule.display_name,
            strategy = %schedule.task_creation_strategy_name,
            "schedule created"
        );

        self.bootstrap(&schedule, &resolved, now).await?;
        Ok(self.store.get_schedule(&id).await?.unwrap_or(schedule))
    }

    /// Retire a schedule. `Ok(false)` if it was already retired or its lease is busy.
    pub async fn disable_schedule(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let schedule = self.require_schedule(id).await?;
        if schedule.pasture {
            return Ok(false);
        }

        let done = self
            .leases
            .with_lease(id, self.cfg.lease_seconds, now, |owner| async move {
                self.tracked(id, &owner, UpdateState::Disabling, None, async {
                    self.store.set_pasture(id, &owner).await
                })
                .await
            })
            .await?;

        if done.flatten() != Some(true) {
            return Ok(false);
        }

        info!(schedule_id = %id, "schedule disabled");
        self.events.publish(SchedulerEvent::ScheduledJobDisabled {
            schedule_id: id.to_string(),
        });
        Ok(true)
    }

    /// Replace a schedule with an edited copy. The old one is retired and the
    /// new one records it as `previous_schedule`.
    pub async fn supersede_schedule(
        &self,
        old_id: &str,
        new: NewScheduledJob,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>> {
        let resolved = self.validate(&new)?;
        let old = self.require_schedule(old_id).await?;
        let new_id = self.keys.create();

        let replaced = self
            .leases
            .with_lease(&old.id, self.cfg.lease_seconds, now, |owner| {
                let (new_id, new) = (&new_id, &new);
                async move {
                    self.tracked(old_id, &owner, UpdateState::Disabling, None, async {
                        self.store
                            .supersede_schedule(old_id, &owner, new_id, new, reason, now)
                            .await
                    })
                    .await
                }
            })
            .await?
            .flatten()
            .flatten();

        let Some(schedule) = replaced else {
            return Ok(None);
        };

        info!(old_schedule_id = %old_id, schedule_id = %schedule.id, reason = %reason, "schedule superseded");
        self.events.publish(SchedulerEvent::ScheduledJobDisabled {
            schedule_id: old_id.to_string(),
        });

        self.bootstrap(&schedule, &resolved, now).await?;
        Ok(Some(
            self.store.get_schedule(&new_id).await?.unwrap_or(schedule),
        ))
    }

    pub async fn task_state_counts(&self) -> Result<Vec<(TaskState, i64)>> {
        self.store.task_state_counts().await
    }

    // ----------------------------
    // Polling passes
    // ----------------------------

    /// Create the next task for cron-polled schedules that have none pending.
    pub async fn poll_task_creation(&self, now: DateTime<Utc>) -> Result<usize> {
        let names = self.registries.polled_task_creation_names();
        if names.is_empty() {
            return Ok(0);
        }

        let after = self.cron_cursor().clone();
        let schedules = self
            .store
            .poll_cron_schedules(&names, after.as_deref(), self.cfg.poll_limit)
            .await?;

        // a short page means the end was reached; wrap around next time
        *self.cron_cursor() = if (schedules.len() as i64) < self.cfg.poll_limit {
            None
        } else {
            schedules.last().map(|s| s.id.clone())
        };

        let mut created = 0;
        for schedule in &schedules {
            if schedule.is_locked(now, self.leases.grace()) {
                continue;
            }
            match self.create_on_poll(schedule, now).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => self.report("poll_task_creation", &schedule.id, &e),
            }
        }
        Ok(created)
    }

    /// Queue due `pending` tasks and hand them to the execution backend.
    pub async fn poll_executable(&self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self
            .store
            .poll_executable_tasks(now, self.cfg.poll_limit)
            .await?;

        let mut started = 0;
        for task in &tasks {
            match self.execute_task(task, now).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => self.report("poll_executable", &task.id, &e),
            }
        }
        Ok(started)
    }

    /// Ask the backend about running tasks and record terminal outcomes.
    pub async fn poll_completion(&self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self.store.poll_completion_tasks(self.cfg.poll_limit).await?;

        let mut finished = 0;
        for task in &tasks {
            match self.complete_task(task, now).await {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(e) => self.report("poll_completion", &task.id, &e),
            }
        }
        Ok(finished)
    }

    /// Move `start-error` tasks back to `queued` and try to start them again.
    pub async fn requeue_start_errors(&self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self.store.poll_start_error_tasks(self.cfg.poll_limit).await?;

        let mut started = 0;
        for task in &tasks {
            match self.execute_task(task, now).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => self.report("requeue_start_errors", &task.id, &e),
            }
        }
        Ok(started)
    }

    pub async fn sweep_long_queued(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = self.cfg.queued_timeout_seconds.clamp(0, time::MAX_OFFSET_SECONDS);
        let tasks = self
            .store
            .poll_long_queued_tasks(now, timeout, self.cfg.poll_limit)
            .await?;

        for task in &tasks {
            warn!(
                task_id = %task.id,
                schedule_id = %task.schedule_id,
                queued_at = ?task.execution_queued,
                "task queued too long"
            );
            self.events
                .publish(SchedulerEvent::TaskQueuedLong { task: task.clone() });
            if let Err(e) = self.defer_timeout_check(task, now, timeout).await {
                self.report("sweep_long_queued", &task.id, &e);
            }
        }
        Ok(tasks.len())
    }

    pub async fn sweep_long_executing(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = self.cfg.executing_timeout_seconds.clamp(0, time::MAX_OFFSET_SECONDS);
        let tasks = self
            .store
            .poll_long_executing_tasks(now, timeout, self.cfg.poll_limit)
            .await?;

        for task in &tasks {
            warn!(
                task_id = %task.id,
                schedule_id = %task.schedule_id,
                state = %task.state,
                started_at = ?task.execution_started,
                "task executing too long"
            );
            self.events
                .publish(SchedulerEvent::TaskExecutingLong { task: task.clone() });
            if let Err(e) = self.defer_timeout_check(task, now, timeout).await {
                self.report("sweep_long_executing", &task.id, &e);
            }
        }
        Ok(tasks.len())
    }

    pub async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self
            .leases
            .sweep_expired(now, self.cfg.poll_limit)
            .await?;
        Ok(expired.len())
    }

    /// Build one poll loop per pass. Task passes use `poll_wait`, sweeps use
    /// `sweep_wait`. The loops are not started.
    pub fn poll_loops(
        &self,
        registrar: Arc<dyn RegisterPollCallback>,
        poll_wait: &dyn GeneratePollWaitTimesStrategy,
        sweep_wait: &dyn GeneratePollWaitTimesStrategy,
    ) -> Result<Vec<Arc<PollLoop>>> {
        macro_rules! pass {
            ($name:literal, $method:ident, $wait:expr) => {{
                let s = self.clone();
                PollLoop::new(
                    $name,
                    $wait,
                    registrar.clone(),
                    self.events.clone(),
                    poll::action(move || {
                        let s = s.clone();
                        async move {
                            let n = s.$method(time::now_utc()).await?;
                            if n > 0 {
                                debug!(poll = $name, count = n, "pass done");
                            }
                            Ok::<(), SchedError>(())
                        }
                    }),
                )?
            }};
        }

        Ok(vec![
            pass!("task-creation", poll_task_creation, poll_wait),
            pass!("executable", poll_executable, poll_wait),
            pass!("completion", poll_completion, poll_wait),
            pass!("start-errors", requeue_start_errors, poll_wait),
            pass!("long-queued", sweep_long_queued, sweep_wait),
            pass!("long-executing", sweep_long_executing, sweep_wait),
            pass!("expired-leases", sweep_expired_leases, sweep_wait),
        ])
    }

    // ----------------------------
    // Per-row work
    // ----------------------------

    async fn create_on_poll(&self, schedule: &ScheduledJob, now: DateTime<Utc>) -> Result<bool> {
        let Some(resolved) = self.resolve_or_report(schedule) else {
            return Ok(false);
        };
        let Some(at) = resolved.creation.create_on_poll(now, &resolved.definition) else {
            return Ok(false);
        };

        let created = self
            .leases
            .with_lease(&schedule.id, self.cfg.lease_seconds, now, |owner| async move {
                // a pending task already covers the next fire time
                let pending = self
                    .store
                    .tasks_for_schedule(&schedule.id, &[TaskState::Pending])
                    .await?;
                if !pending.is_empty() {
                    return Ok(None);
                }
                self.create_task_tracked(schedule, &owner, at, now).await
            })
            .await?;

        Ok(matches!(created, Some(Some(_))))
    }

    async fn execute_task(&self, task: &Task, now: DateTime<Utc>) -> Result<bool> {
        let schedule = self.require_schedule(&task.schedule_id).await?;
        if schedule.pasture {
            return Ok(false);
        }
        let schedule = &schedule;

        let started = self
            .leases
            .with_lease(&schedule.id, self.cfg.lease_seconds, now, |owner| async move {
                self.tracked(
                    &schedule.id,
                    &owner,
                    UpdateState::ExecutingTask,
                    Some(&task.id),
                    async {
                        let Some(queued) = self.tasks.mark_queued(task, &owner, now).await? else {
                            return Ok(false);
                        };
                        self.start_queued(&queued, schedule, &owner, now).await
                    },
                )
                .await
            })
            .await?;

        Ok(started.flatten().unwrap_or(false))
    }

    async fn start_queued(
        &self,
        queued: &Task,
        schedule: &ScheduledJob,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.executor.start(queued, schedule).await {
            Ok(job_id) => Ok(self
                .tasks
                .mark_started(queued, owner, &job_id, now)
                .await?
                .is_some()),
            Err(e) => {
                warn!(task_id = %queued.id, schedule_id = %schedule.id, error = %e, "job start failed");
                self.events
                    .publish(SchedulerEvent::general_error("executor.start", &e));
                self.tasks.mark_start_error(queued, owner, now).await?;
                Ok(false)
            }
        }
    }

    async fn complete_task(&self, task: &Task, now: DateTime<Utc>) -> Result<bool> {
        let schedule = self.require_schedule(&task.schedule_id).await?;
        let schedule = &schedule;

        let finished = self
            .leases
            .with_lease(&schedule.id, self.cfg.lease_seconds, now, |owner| async move {
                self.tracked(
                    &schedule.id,
                    &owner,
                    UpdateState::CompletingTask,
                    Some(&task.id),
                    self.complete_locked(task, schedule, &owner, now),
                )
                .await
            })
            .await?;

        Ok(finished.flatten().unwrap_or(false))
    }

    async fn complete_locked(
        &self,
        task: &Task,
        schedule: &ScheduledJob,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut current = task.clone();
        if matches!(current.state, TaskState::Started | TaskState::CompleteError) {
            match self.tasks.mark_complete_queued(&current, owner, now).await? {
                Some(t) => current = t,
                None => return Ok(false),
            }
        }

        let Some(job_id) = current.execution_job_id.clone() else {
            warn!(task_id = %current.id, "running task has no execution job id");
            self.tasks.mark_complete_error(&current, owner, now).await?;
            return Ok(false);
        };

        let state = match self.executor.poll(&job_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(task_id = %current.id, job_id = %job_id, error = %e, "job poll failed");
                self.events
                    .publish(SchedulerEvent::general_error("executor.poll", &e));
                self.tasks.mark_complete_error(&current, owner, now).await?;
                return Ok(false);
            }
        };

        let (succeeded, info) = match &state {
            JobExecutionState::Running => return Ok(false),
            JobExecutionState::Unknown => {
                warn!(task_id = %current.id, job_id = %job_id, "backend does not know job");
                self.tasks.mark_complete_error(&current, owner, now).await?;
                return Ok(false);
            }
            JobExecutionState::Succeeded { info } => (true, info.clone()),
            JobExecutionState::Failed { info } => (false, info.clone()),
        };

        self.events.publish(SchedulerEvent::JobExecutionFinished {
            task_id: current.id.clone(),
            execution_job_id: job_id.clone(),
            state,
        });

        let Some(finished) = self
            .tasks
            .mark_finished(&current, owner, succeeded, info, now)
            .await?
        else {
            return Ok(false);
        };
        self.executor.release(&job_id).await?;

        info!(
            task_id = %finished.id,
            schedule_id = %schedule.id,
            state = %finished.state,
            retry_index = finished.retry_index,
            "task finished"
        );

        if !succeeded && self.retry_locked(schedule, &finished, owner, now).await? {
            return Ok(true);
        }

        self.follow_up_locked(schedule, &finished, owner, now).await?;
        Ok(true)
    }

    /// Synthesize a retry for `failed` if the retry strategy asks for one.
    async fn retry_locked(
        &self,
        schedule: &ScheduledJob,
        failed: &Task,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if schedule.pasture {
            return Ok(false);
        }

        let retry = self.registries.retry.get(&schedule.retry_strategy_name)?;
        let Some(at) = retry.decide(schedule, failed, now) else {
            return Ok(false);
        };

        let successor = self.new_task(schedule, at, failed.retry_index + 1, now);
        let Some(successor) = self
            .create_task_locked(schedule, owner, &successor, false)
            .await?
        else {
            return Ok(false);
        };

        info!(
            task_id = %failed.id,
            retry_task_id = %successor.id,
            retry_index = successor.retry_index,
            execute_at = %successor.execute_at,
            "task retry scheduled"
        );
        self.tasks.mark_fail_restarted(failed, owner, now).await?;
        Ok(true)
    }

    /// Completion-driven recurrence (after-run).
    async fn follow_up_locked(
        &self,
        schedule: &ScheduledJob,
        finished: &Task,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if schedule.pasture {
            return Ok(());
        }
        let Some(resolved) = self.resolve_or_report(schedule) else {
            return Ok(());
        };

        let finished_at = finished.execution_finished.unwrap_or(now);
        if let Some(at) = resolved
            .creation
            .create_after_task_completes(finished_at, &resolved.definition)
        {
            let next = self.new_task(schedule, at, 0, now);
            self.create_task_locked(schedule, owner, &next, true).await?;
        }
        Ok(())
    }

    async fn bootstrap(
        &self,
        schedule: &ScheduledJob,
        resolved: &Resolved,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(at) = resolved
            .creation
            .create_from_new_schedule(now, &resolved.definition)
        else {
            debug!(schedule_id = %schedule.id, "no initial task");
            return Ok(());
        };

        let created = self
            .leases
            .with_lease(&schedule.id, self.cfg.lease_seconds, now, |owner| async move {
                self.create_task_tracked(schedule, &owner, at, now).await
            })
            .await?;

        if created.is_none() {
            warn!(schedule_id = %schedule.id, "could not lease new schedule for its first task");
        }
        Ok(())
    }

    fn new_task(
        &self,
        schedule: &ScheduledJob,
        execute_at: DateTime<Utc>,
        retry_index: i32,
        now: DateTime<Utc>,
    ) -> NewTask {
        NewTask {
            id: self.keys.create(),
            schedule_id: schedule.id.clone(),
            execute_at: time::truncate_to_second(execute_at),
            created_on: now,
            retry_index,
        }
    }

    /// Create a first-generation task with the schedule marked `creating-task`.
    /// Callers already inside a tracked update use [`Self::create_task_locked`].
    async fn create_task_tracked(
        &self,
        schedule: &ScheduledJob,
        owner: &str,
        execute_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let new_task = self.new_task(schedule, execute_at, 0, now);
        let created = self
            .tracked(
                &schedule.id,
                owner,
                UpdateState::CreatingTask,
                Some(&new_task.id),
                self.create_task_locked(schedule, owner, &new_task, true),
            )
            .await?;
        Ok(created.flatten())
    }

    /// Insert `new_task` while holding the schedule lease. With
    /// `check_duplicates`, the duplicate strategy gets a say whenever the
    /// schedule still has non-terminal tasks.
    async fn create_task_locked(
        &self,
        schedule: &ScheduledJob,
        owner: &str,
        new_task: &NewTask,
        check_duplicates: bool,
    ) -> Result<Option<Task>> {
        if check_duplicates {
            let active = self
                .store
                .tasks_for_schedule(&schedule.id, &ACTIVE_STATES)
                .await?;
            if !active.is_empty() {
                let strategy = self
                    .registries
                    .duplicate
                    .get(&schedule.duplicate_strategy_name)?;
                let decision = strategy.decide(schedule, &active, new_task);
                debug!(
                    schedule_id = %schedule.id,
                    active = active.len(),
                    decision = decision.as_str(),
                    "duplicate check"
                );
                if decision == DuplicateDecision::Skip {
                    return Ok(None);
                }
            }
        }

        self.tasks.create(owner, new_task).await
    }

    // ----------------------------
    // Helpers
    // ----------------------------

    /// Mark the schedule as mid-update around `fut`. `Ok(None)` without
    /// running `fut` if the marker cannot be set (the lease is gone).
    async fn tracked<T>(
        &self,
        schedule_id: &str,
        owner: &str,
        state: UpdateState,
        task_pk: Option<&str>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<Option<T>> {
        if !self
            .store
            .set_update_state(schedule_id, owner, Some(state), task_pk)
            .await?
        {
            warn!(schedule_id = %schedule_id, update_state = %state, "lease lost before update");
            return Ok(None);
        }
        let out = fut.await;
        if !self
            .store
            .set_update_state(schedule_id, owner, None, None)
            .await?
        {
            warn!(schedule_id = %schedule_id, update_state = %state, "lease lost during update");
        }
        out.map(Some)
    }

    async fn defer_timeout_check(&self, task: &Task, now: DateTime<Utc>, timeout: i64) -> Result<()> {
        let next = time::add_seconds(now, timeout).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.store
            .set_next_timeout_check(&task.id, task.state, next)
            .await?;
        Ok(())
    }

    fn cron_cursor(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.cron_cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn require_schedule(&self, id: &str) -> Result<ScheduledJob> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or_else(|| SchedError::ScheduleNotFound { id: id.to_string() })
    }

    fn validate(&self, new: &NewScheduledJob) -> Result<Resolved> {
        let creation = self
            .registries
            .task_creation
            .get(&new.task_creation_strategy_name)?;
        self.registries.duplicate.get(&new.duplicate_strategy_name)?;
        self.registries.retry.get(&new.retry_strategy_name)?;

        match creation.decode(&new.schedule_definition) {
            Ok(definition) => Ok(Resolved {
                creation,
                definition,
            }),
            Err(e) => {
                self.events.publish(SchedulerEvent::InvalidScheduleDefinition {
                    schedule_id: None,
                    strategy: new.task_creation_strategy_name.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn resolve_or_report(&self, schedule: &ScheduledJob) -> Option<Resolved> {
        let resolved = self
            .registries
            .task_creation
            .get(&schedule.task_creation_strategy_name)
            .and_then(|creation| {
                let definition = creation.decode(&schedule.schedule_definition)?;
                Ok(Resolved {
                    creation,
                    definition,
                })
            });

        match resolved {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "schedule definition rejected");
                self.events.publish(match &e {
                    SchedError::InvalidCron { .. } | SchedError::InvalidScheduleDefinition { .. } => {
                        SchedulerEvent::InvalidScheduleDefinition {
                            schedule_id: Some(schedule.id.clone()),
                            strategy: schedule.task_creation_strategy_name.clone(),
                            reason: e.to_string(),
                        }
                    }
                    _ => SchedulerEvent::general_error("schedule.resolve", &e),
                });
                None
            }
        }
    }

    fn report(&self, source: &str, subject: &str, err: &SchedError) {
        error!(source, subject = %subject, error = %err, "scheduler pass item failed");
        self.events.publish(SchedulerEvent::general_error(
            source,
            format!("{subject}: {err}"),
        ));
    }
}
