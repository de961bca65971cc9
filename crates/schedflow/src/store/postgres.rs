// crates/schedflow/src/store/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::{Store, COMPLETION_STATES};
use crate::error::{Result, SchedError};
use crate::time;
use crate::schedules::model::{
    NewScheduledJob, NewTask, ScheduledJob, Task, TaskState, TaskTransition, UpdateState,
};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    lease_owner: Option<String>,
    lease_expires: Option<DateTime<Utc>>,
    update_state: Option<String>,
    update_task_pk: Option<String>,
    pasture: bool,
    duplicate_strategy_name: String,
    retry_strategy_name: String,
    task_creation_strategy_name: String,
    schedule_definition: Value,
    job_context: Value,
    display_name: String,
    description: Option<String>,
    created_on: DateTime<Utc>,
    previous_schedule: Option<String>,
    previous_reason: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    id: String,
    schedule_id: String,
    state: String,
    created_on: DateTime<Utc>,
    execute_at: DateTime<Utc>,
    execution_job_id: Option<String>,
    execution_queued: Option<DateTime<Utc>>,
    execution_started: Option<DateTime<Utc>>,
    execution_finished: Option<DateTime<Utc>>,
    next_timeout_check: Option<DateTime<Utc>>,
    retry_index: i32,
    completed_info: Option<Value>,
}

fn decode_err(msg: String) -> SchedError {
    SchedError::Store(sqlx::Error::Decode(msg.into()))
}

impl TryFrom<ScheduleRow> for ScheduledJob {
    type Error = SchedError;

    fn try_from(r: ScheduleRow) -> Result<Self> {
        let update_state = r
            .update_state
            .as_deref()
            .map(str::parse::<UpdateState>)
            .transpose()
            .map_err(decode_err)?;

        Ok(ScheduledJob {
            id: r.id,
            lease_owner: r.lease_owner,
            lease_expires: r.lease_expires,
            update_state,
            update_task_pk: r.update_task_pk,
            pasture: r.pasture,
            duplicate_strategy_name: r.duplicate_strategy_name,
            retry_strategy_name: r.retry_strategy_name,
            task_creation_strategy_name: r.task_creation_strategy_name,
            schedule_definition: r.schedule_definition,
            job_context: r.job_context,
            display_name: r.display_name,
            description: r.description,
            created_on: r.created_on,
            previous_schedule: r.previous_schedule,
            previous_reason: r.previous_reason,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = SchedError;

    fn try_from(r: TaskRow) -> Result<Self> {
        Ok(Task {
            state: r.state.parse().map_err(decode_err)?,
            id: r.id,
            schedule_id: r.schedule_id,
            created_on: r.created_on,
            execute_at: r.execute_at,
            execution_job_id: r.execution_job_id,
            execution_queued: r.execution_queued,
            execution_started: r.execution_started,
            execution_finished: r.execution_finished,
            next_timeout_check: r.next_timeout_check,
            retry_index: r.retry_index,
            completed_info: r.completed_info,
        })
    }
}

fn schedules(rows: Vec<ScheduleRow>) -> Result<Vec<ScheduledJob>> {
    rows.into_iter().map(ScheduledJob::try_from).collect()
}

fn tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

fn state_names(states: &[TaskState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

/// PostgreSQL-backed [`Store`]. Every CAS is one `UPDATE ... WHERE <guard> RETURNING`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const INSERT_SCHEDULE: &str = r#"
    INSERT INTO scheduled_jobs (
        id,
        duplicate_strategy_name, retry_strategy_name, task_creation_strategy_name,
        schedule_definition, job_context,
        display_name, description, created_on,
        previous_schedule, previous_reason
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    RETURNING *
"#;

#[async_trait]
impl Store for PgStore {
    // ----------------------------
    // Schedules
    // ----------------------------

    async fn insert_schedule(
        &self,
        id: &str,
        new: &NewScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob> {
        let row = sqlx::query_as::<_, ScheduleRow>(INSERT_SCHEDULE)
            .bind(id)
            .bind(&new.duplicate_strategy_name)
            .bind(&new.retry_strategy_name)
            .bind(&new.task_creation_strategy_name)
            .bind(&new.schedule_definition)
            .bind(&new.job_context)
            .bind(&new.display_name)
            .bind(&new.description)
            .bind(now)
            .bind(None::<String>)
            .bind(None::<String>)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledJob>> {
        sqlx::query_as::<_, ScheduleRow>("SELECT * FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScheduledJob::try_from)
            .transpose()
    }

    async fn list_schedules(&self, include_pasture: bool, limit: i64) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT *
            FROM scheduled_jobs
            WHERE ($1 OR pasture = FALSE)
            ORDER BY created_on ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(include_pasture)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        schedules(rows)
    }

    async fn poll_cron_schedules(
        &self,
        strategy_names: &[String],
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT s.*
            FROM scheduled_jobs s
            WHERE s.pasture = FALSE
              AND s.task_creation_strategy_name = ANY($1)
              AND ($2::text IS NULL OR s.id > $2)
              AND NOT EXISTS (
                  SELECT 1 FROM tasks t
                  WHERE t.schedule_id = s.id AND t.state = 'pending'
              )
            ORDER BY s.id ASC
            LIMIT $3
            "#,
        )
        .bind(strategy_names)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        schedules(rows)
    }

    async fn poll_expired_leases(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT *
            FROM scheduled_jobs
            WHERE lease_expires IS NOT NULL
              AND lease_expires <= $1
            ORDER BY lease_expires ASC
            LIMIT $2
            "#,
        )
        .bind(now - grace)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        schedules(rows)
    }

    // ----------------------------
    // Lease CAS
    // ----------------------------

    async fn try_acquire_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
        grace: Duration,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET lease_owner = $2,
                lease_expires = $3
            WHERE id = $1
              AND (lease_expires IS NULL OR lease_expires <= $4)
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(expires)
        .bind(now - grace)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn renew_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
        grace: Duration,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET lease_expires = $3
            WHERE id = $1
              AND lease_owner = $2
              AND lease_expires > $4
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(expires)
        .bind(now - grace)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn release_lease(&self, id: &str, owner: &str) -> Result<bool> {
        // The owner guard keeps a worker whose lease already lapsed from
        // clearing a lease that someone else re-acquired.
        let res = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET lease_owner = NULL,
                lease_expires = NULL
            WHERE id = $1
              AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Lease-guarded schedule writes
    // ----------------------------

    async fn set_update_state(
        &self,
        id: &str,
        owner: &str,
        state: Option<UpdateState>,
        task_pk: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET update_state = $3,
                update_task_pk = $4
            WHERE id = $1
              AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(state.map(|s| s.as_str()))
        .bind(task_pk)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn set_pasture(&self, id: &str, owner: &str) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET pasture = TRUE
            WHERE id = $1
              AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
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
        let mut tx = self.pool.begin().await?;

        let retired = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET pasture = TRUE
            WHERE id = $1
              AND lease_owner = $2
            "#,
        )
        .bind(old_id)
        .bind(owner)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if retired != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query_as::<_, ScheduleRow>(INSERT_SCHEDULE)
            .bind(new_id)
            .bind(&new.duplicate_strategy_name)
            .bind(&new.retry_strategy_name)
            .bind(&new.task_creation_strategy_name)
            .bind(&new.schedule_definition)
            .bind(&new.job_context)
            .bind(&new.display_name)
            .bind(&new.description)
            .bind(now)
            .bind(old_id)
            .bind(reason)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row.try_into()?))
    }

    // ----------------------------
    // Tasks
    // ----------------------------

    async fn insert_task(&self, owner: &str, task: &NewTask) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks (id, schedule_id, state, created_on, execute_at, retry_index)
            SELECT $1, s.id, 'pending', $3, $4, $5
            FROM scheduled_jobs s
            WHERE s.id = $2
              AND s.lease_owner = $6
            RETURNING *
            "#,
        )
        .bind(&task.id)
        .bind(&task.schedule_id)
        .bind(task.created_on)
        .bind(task.execute_at)
        .bind(task.retry_index)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .map(Task::try_from)
        .transpose()
    }

    async fn transition_task(
        &self,
        task_id: &str,
        owner: &str,
        transition: &TaskTransition,
    ) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks t
            SET state = $3::text,
                execution_queued = CASE WHEN $3::text = 'queued'
                    THEN COALESCE(t.execution_queued, $5) ELSE t.execution_queued END,
                execution_started = CASE WHEN $3::text = 'started'
                    THEN COALESCE(t.execution_started, $5) ELSE t.execution_started END,
                execution_job_id = CASE WHEN $3::text = 'started'
                    THEN COALESCE($6::text, t.execution_job_id) ELSE t.execution_job_id END,
                execution_finished = CASE WHEN $3::text IN ('completed', 'failed')
                    THEN COALESCE(t.execution_finished, $5) ELSE t.execution_finished END,
                completed_info = CASE WHEN $3::text IN ('completed', 'failed')
                    THEN $7::jsonb ELSE t.completed_info END,
                next_timeout_check = NULL
            FROM scheduled_jobs s
            WHERE t.id = $1
              AND t.state = $2
              AND s.id = t.schedule_id
              AND s.lease_owner = $4
            RETURNING t.*
            "#,
        )
        .bind(task_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(owner)
        .bind(transition.at)
        .bind(&transition.execution_job_id)
        .bind(&transition.completed_info)
        .fetch_optional(&self.pool)
        .await?
        .map(Task::try_from)
        .transpose()
    }

    async fn set_next_timeout_check(
        &self,
        task_id: &str,
        state: TaskState,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET next_timeout_check = $3
            WHERE id = $1
              AND state = $2
            "#,
        )
        .bind(task_id)
        .bind(state.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Task::try_from)
            .transpose()
    }

    async fn tasks_for_schedule(
        &self,
        schedule_id: &str,
        states: &[TaskState],
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE schedule_id = $1
              AND (cardinality($2::text[]) = 0 OR state = ANY($2))
            ORDER BY execute_at ASC, id ASC
            "#,
        )
        .bind(schedule_id)
        .bind(state_names(states))
        .fetch_all(&self.pool)
        .await?;

        tasks(rows)
    }

    async fn poll_executable_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT t.*
            FROM tasks t
            JOIN scheduled_jobs s ON s.id = t.schedule_id
            WHERE t.state = 'pending'
              AND t.execute_at <= $1
              AND s.pasture = FALSE
            ORDER BY t.execute_at ASC, t.id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        tasks(rows)
    }

    async fn poll_long_queued_tasks(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE state = 'queued'
              AND execution_queued <= $2
              AND (next_timeout_check IS NULL OR next_timeout_check <= $1)
            ORDER BY execute_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(time::sub_seconds(now, timeout_seconds).unwrap_or(DateTime::<Utc>::MIN_UTC))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        tasks(rows)
    }

    async fn poll_long_executing_tasks(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE state IN ('started', 'complete-queued')
              AND execution_started <= $2
              AND (next_timeout_check IS NULL OR next_timeout_check <= $1)
            ORDER BY execute_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(time::sub_seconds(now, timeout_seconds).unwrap_or(DateTime::<Utc>::MIN_UTC))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        tasks(rows)
    }

    async fn poll_completion_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE state = ANY($1)
            ORDER BY execute_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(state_names(&COMPLETION_STATES))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        tasks(rows)
    }

    async fn poll_start_error_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE state = 'start-error'
            ORDER BY execute_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        tasks(rows)
    }

    async fn task_state_counts(&self) -> Result<Vec<(TaskState, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT state, COUNT(*)
            FROM tasks
            GROUP BY state
            ORDER BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(state, n)| -> Result<(TaskState, i64)> {
                Ok((state.parse().map_err(decode_err)?, n))
            })
            .collect()
    }
}

