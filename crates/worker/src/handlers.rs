use schedflow::executor::local::{boxed, HandlerOptions, JobError};
use schedflow::executor::LocalExecutor;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

#[derive(Deserialize)]
struct EmailSendPayload {
    user_id: i64,
    template: Option<String>,
}

#[derive(Deserialize)]
struct SleepPayload {
    millis: u64,
}

pub fn build_executor() -> LocalExecutor {
    let mut executor = LocalExecutor::new();

    // Demo handlers. Replace these with your real handlers.
    executor.register_with_options(
        "demo_ok",
        |inv| {
            boxed(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!({ "task_id": inv.task_id, "retry_index": inv.retry_index }))
            })
        },
        HandlerOptions::new().timeout(Duration::from_secs(5)),
    );
    executor.register_with_options(
        "fail_me",
        |_inv| {
            boxed(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Err(JobError::new("DEPENDENCY_DOWN", "simulated failure"))
            })
        },
        HandlerOptions::new().timeout(Duration::from_secs(5)),
    );
    executor.register_with_options(
        "sleep",
        |inv| {
            boxed(async move {
                let payload: SleepPayload = inv.parse_payload()?;
                tokio::time::sleep(Duration::from_millis(payload.millis)).await;
                Ok(json!({ "slept_ms": payload.millis }))
            })
        },
        HandlerOptions::new()
            .max_concurrency(4)
            .timeout(Duration::from_secs(60)),
    );

    // Example handler with payload validation.
    executor.register_with_options(
        "email_send",
        |inv| {
            boxed(async move {
                let payload: EmailSendPayload = inv.parse_payload()?;
                info!(
                    schedule = %inv.schedule_name,
                    user_id = payload.user_id,
                    template = payload.template.as_deref().unwrap_or("default"),
                    "email_send"
                );
                Ok(json!({ "sent_to": payload.user_id }))
            })
        },
        HandlerOptions::new()
            .max_concurrency(50)
            .timeout(Duration::from_secs(10)),
    );

    executor
}
