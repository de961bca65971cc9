use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{sync::Semaphore, time::timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobExecutionState, JobExecutor};
use crate::error::Result;
use crate::poll::BoxFuture;
use crate::schedules::model::{ScheduledJob, Task};

type HandlerFn =
    dyn for<'a> Fn(&'a JobInvocation) -> BoxFuture<'a, std::result::Result<Value, JobError>>
        + Send
        + Sync;

/// What a handler sees of the task it runs.
#[derive(Debug, Clone)]
pub struct JobInvocation {
    pub task_id: String,
    pub schedule_id: String,
    pub schedule_name: String,
    pub retry_index: i32,
    pub payload: Value,
}

impl JobInvocation {
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> std::result::Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::new("BAD_PAYLOAD", e.to_string()))
    }
}

#[derive(Debug)]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn info(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

#[derive(Clone)]
struct HandlerEntry {
    handler: Arc<HandlerFn>,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl HandlerEntry {
    async fn run(&self, inv: &JobInvocation) -> std::result::Result<Value, JobError> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| JobError::new("WORKER_SHUTDOWN", "handler semaphore closed"))?,
            ),
            None => None,
        };

        let fut = (self.handler)(inv);
        match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(JobError::new(
                    "TIMEOUT",
                    format!("handler timeout after {}ms", dur.as_millis()),
                )),
            },
            None => fut.await,
        }
    }
}

/// In-process execution backend.
///
/// Handlers are looked up by `job_context.handler` and run on tokio tasks.
/// Outcomes are kept by execution-job id until the scheduler releases them.
#[derive(Clone, Default)]
pub struct LocalExecutor {
    handlers: HashMap<String, HandlerEntry>,
    jobs: Arc<Mutex<HashMap<String, JobExecutionState>>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: for<'a> Fn(&'a JobInvocation) -> BoxFuture<'a, std::result::Result<Value, JobError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_with_options(name, handler, HandlerOptions::new());
    }

    pub fn register_with_options<F>(&mut self, name: &str, handler: F, opts: HandlerOptions)
    where
        F: for<'a> Fn(&'a JobInvocation) -> BoxFuture<'a, std::result::Result<Value, JobError>>
            + Send
            + Sync
            + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.handlers.insert(
            name.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of executions whose outcome has not been released yet.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs().len()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobExecutionState>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn record(
    jobs: &Mutex<HashMap<String, JobExecutionState>>,
    job_id: &str,
    state: JobExecutionState,
) {
    let mut jobs = jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    jobs.insert(job_id.to_string(), state);
}

#[async_trait]
impl JobExecutor for LocalExecutor {
    async fn start(&self, task: &Task, schedule: &ScheduledJob) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let handler_name = schedule.job_handler().unwrap_or_default().to_string();
        let entry = self.handlers.get(&handler_name).cloned();

        let inv = JobInvocation {
            task_id: task.id.clone(),
            schedule_id: schedule.id.clone(),
            schedule_name: schedule.display_name.clone(),
            retry_index: task.retry_index,
            payload: schedule
                .job_context
                .get("payload")
                .cloned()
                .unwrap_or(Value::Null),
        };

        record(&self.jobs, &job_id, JobExecutionState::Running);
        debug!(job_id = %job_id, task_id = %task.id, handler = %handler_name, "local job started");

        let jobs = self.jobs.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            let outcome = match entry {
                Some(entry) => entry.run(&inv).await,
                None => Err(JobError::new(
                    "UNKNOWN_JOB_TYPE",
                    format!("no handler registered for `{handler_name}`"),
                )),
            };

            let state = match outcome {
                Ok(output) => JobExecutionState::Succeeded {
                    info: json!({ "output": output }),
                },
                Err(e) => {
                    warn!(job_id = %id, task_id = %inv.task_id, code = e.code, error = %e.message, "local job failed");
                    JobExecutionState::Failed { info: e.info() }
                }
            };
            record(&jobs, &id, state);
        });

        Ok(job_id)
    }

    async fn poll(&self, execution_job_id: &str) -> Result<JobExecutionState> {
        Ok(self
            .jobs()
            .get(execution_job_id)
            .cloned()
            .unwrap_or(JobExecutionState::Unknown))
    }

    async fn release(&self, execution_job_id: &str) -> Result<()> {
        self.jobs().remove(execution_job_id);
        Ok(())
    }
}

/// Box an async block into the handler future type.
pub fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}
