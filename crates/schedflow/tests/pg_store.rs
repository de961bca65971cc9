// tests/pg_store.rs
//
// Same contract as the in-memory store, against PostgreSQL.
// Skipped unless TEST_DATABASE_URL is set.
mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{at, setup_db};
use serde_json::json;
use serial_test::serial;

use schedflow::events::EventBus;
use schedflow::executor::local::boxed;
use schedflow::executor::LocalExecutor;
use schedflow::schedules::{
    NewScheduledJob, NewTask, Scheduler, SchedulerConfig, TaskState, TaskTransition, UpdateState,
};
use schedflow::store::{PgStore, Store};
use schedflow::strategies::Registries;

fn t0() -> DateTime<Utc> {
    at("2030-01-01T00:00:00Z")
}

fn secs(n: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(n)
}

fn new_task(id: &str, schedule_id: &str, execute_at: DateTime<Utc>) -> NewTask {
    NewTask {
        id: id.to_string(),
        schedule_id: schedule_id.to_string(),
        execute_at,
        created_on: t0(),
        retry_index: 0,
    }
}

async fn leased(store: &PgStore, id: &str, owner: &str) {
    assert!(store
        .try_acquire_lease(id, owner, t0(), secs(3600), Duration::zero())
        .await
        .unwrap());
}

#[tokio::test]
#[serial]
async fn pg_schedule_round_trip() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let store = PgStore::new(pool);

    let new = NewScheduledJob::cron("hourly", "0 0 * * * *")
        .description("top of the hour")
        .duplicate_strategy("always-run")
        .retry_strategy("backoff")
        .handler("report", json!({ "kind": "daily" }));
    let inserted = store.insert_schedule("s-1", &new, t0()).await.unwrap();

    assert_eq!(inserted.id, "s-1");
    assert_eq!(inserted.created_on, t0());
    assert_eq!(inserted.schedule_definition, json!({ "expression": "0 0 * * * *" }));
    assert_eq!(inserted.job_handler(), Some("report"));
    assert_eq!(inserted.duplicate_strategy_name, "always-run");
    assert_eq!(inserted.retry_strategy_name, "backoff");
    assert!(!inserted.pasture);

    let fetched = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(fetched, inserted);
    assert!(store.get_schedule("missing").await.unwrap().is_none());

    let cron = store
        .poll_cron_schedules(&["cron".to_string()], None, 10)
        .await
        .unwrap();
    assert_eq!(cron.len(), 1);
    assert!(store
        .poll_cron_schedules(&["once".to_string()], None, 10)
        .await
        .unwrap()
        .is_empty());

    leased(&store, "s-1", "me").await;
    assert!(store
        .set_update_state("s-1", "me", Some(UpdateState::Disabling), None)
        .await
        .unwrap());
    assert!(!store
        .set_update_state("s-1", "intruder", None, None)
        .await
        .unwrap());
    assert_eq!(
        store.get_schedule("s-1").await.unwrap().unwrap().update_state,
        Some(UpdateState::Disabling)
    );

    assert!(!store.set_pasture("s-1", "intruder").await.unwrap());
    assert!(store.set_pasture("s-1", "me").await.unwrap());
    assert!(store.list_schedules(false, 10).await.unwrap().is_empty());
    assert_eq!(store.list_schedules(true, 10).await.unwrap().len(), 1);
    assert!(store
        .poll_cron_schedules(&["cron".to_string()], None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[serial]
async fn pg_task_transitions_are_lease_guarded() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let store = PgStore::new(pool);
    store
        .insert_schedule("s-1", &NewScheduledJob::once("o", t0()), t0())
        .await
        .unwrap();

    // no lease -> no insert
    assert!(store
        .insert_task("me", &new_task("t-1", "s-1", t0()))
        .await
        .unwrap()
        .is_none());

    leased(&store, "s-1", "me").await;
    let task = store
        .insert_task("me", &new_task("t-1", "s-1", t0()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.state, TaskState::Pending);

    let queue = TaskTransition::new(TaskState::Pending, TaskState::Queued, secs(1));
    assert!(store
        .transition_task("t-1", "intruder", &queue)
        .await
        .unwrap()
        .is_none());
    let queued = store.transition_task("t-1", "me", &queue).await.unwrap().unwrap();
    assert_eq!(queued.state, TaskState::Queued);
    assert_eq!(queued.execution_queued, Some(secs(1)));
    // stale `from`
    assert!(store.transition_task("t-1", "me", &queue).await.unwrap().is_none());

    let start =
        TaskTransition::new(TaskState::Queued, TaskState::Started, secs(2)).with_job_id("job-1");
    let started = store.transition_task("t-1", "me", &start).await.unwrap().unwrap();
    assert_eq!(started.execution_job_id.as_deref(), Some("job-1"));
    assert_eq!(started.execution_started, Some(secs(2)));

    let wait = TaskTransition::new(TaskState::Started, TaskState::CompleteQueued, secs(3));
    store.transition_task("t-1", "me", &wait).await.unwrap().unwrap();

    let fail = TaskTransition::new(TaskState::CompleteQueued, TaskState::Failed, secs(4))
        .with_info(json!({ "code": "BOOM" }));
    let failed = store.transition_task("t-1", "me", &fail).await.unwrap().unwrap();
    assert_eq!(failed.execution_finished, Some(secs(4)));
    assert_eq!(failed.completed_info, Some(json!({ "code": "BOOM" })));
    assert_eq!(failed.execution_queued, Some(secs(1)));

    let tag = TaskTransition::new(TaskState::Failed, TaskState::FailRestarted, secs(5));
    let tagged = store.transition_task("t-1", "me", &tag).await.unwrap().unwrap();
    assert_eq!(tagged.state, TaskState::FailRestarted);
    assert_eq!(tagged.completed_info, Some(json!({ "code": "BOOM" })));
    assert_eq!(tagged.execution_finished, Some(secs(4)));

    assert_eq!(
        store
            .tasks_for_schedule("s-1", &[TaskState::FailRestarted])
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(store
        .tasks_for_schedule("s-1", &[TaskState::Pending])
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.tasks_for_schedule("s-1", &[]).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn pg_polls_select_the_right_tasks() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let store = PgStore::new(pool);

    for id in ["s-live", "s-retired"] {
        store
            .insert_schedule(id, &NewScheduledJob::once(id, t0()), t0())
            .await
            .unwrap();
        leased(&store, id, "me").await;
    }

    store.insert_task("me", &new_task("due", "s-live", t0())).await.unwrap();
    store
        .insert_task("me", &new_task("later", "s-live", secs(600)))
        .await
        .unwrap();
    store
        .insert_task("me", &new_task("retired", "s-retired", t0()))
        .await
        .unwrap();
    store.set_pasture("s-retired", "me").await.unwrap();

    let due: Vec<String> = store
        .poll_executable_tasks(secs(1), 10)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(due, vec!["due"]);

    let queue = TaskTransition::new(TaskState::Pending, TaskState::Queued, t0());
    store.transition_task("due", "me", &queue).await.unwrap().unwrap();

    assert!(store.poll_long_queued_tasks(secs(299), 300, 10).await.unwrap().is_empty());
    let long = store.poll_long_queued_tasks(secs(300), 300, 10).await.unwrap();
    assert_eq!(long.len(), 1);

    assert!(store
        .set_next_timeout_check("due", TaskState::Queued, secs(600))
        .await
        .unwrap());
    assert!(store.poll_long_queued_tasks(secs(599), 300, 10).await.unwrap().is_empty());
    assert_eq!(store.poll_long_queued_tasks(secs(600), 300, 10).await.unwrap().len(), 1);

    let start = TaskTransition::new(TaskState::Queued, TaskState::StartError, secs(1));
    store.transition_task("due", "me", &start).await.unwrap().unwrap();
    assert_eq!(store.poll_start_error_tasks(10).await.unwrap().len(), 1);
    assert!(store.poll_completion_tasks(10).await.unwrap().is_empty());

    let counts: HashMap<TaskState, i64> = store
        .task_state_counts()
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(counts.get(&TaskState::Pending), Some(&2));
    assert_eq!(counts.get(&TaskState::StartError), Some(&1));

    // expired leases, with and without grace
    let expired = store
        .poll_expired_leases(secs(3600), Duration::zero(), 10)
        .await
        .unwrap();
    assert_eq!(expired.len(), 2);
    assert!(store
        .poll_expired_leases(secs(3600), Duration::seconds(1), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[serial]
async fn pg_supersede_is_atomic() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let store = PgStore::new(pool);
    store
        .insert_schedule("old", &NewScheduledJob::after_run("v1", 60), t0())
        .await
        .unwrap();

    let v2 = NewScheduledJob::after_run("v2", 120);
    assert!(store
        .supersede_schedule("old", "nobody", "new", &v2, "edit", secs(1))
        .await
        .unwrap()
        .is_none());
    assert!(store.get_schedule("new").await.unwrap().is_none());
    assert!(!store.get_schedule("old").await.unwrap().unwrap().pasture);

    leased(&store, "old", "me").await;
    let replacement = store
        .supersede_schedule("old", "me", "new", &v2, "edit", secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replacement.previous_schedule.as_deref(), Some("old"));
    assert_eq!(replacement.previous_reason.as_deref(), Some("edit"));
    assert_eq!(replacement.schedule_definition, json!({ "delay_seconds": 120 }));
    assert!(store.get_schedule("old").await.unwrap().unwrap().pasture);
}

#[tokio::test]
#[serial]
async fn pg_scheduler_runs_an_after_run_schedule() {
    let Some(pool) = setup_db().await else {
        return;
    };

    let mut executor = LocalExecutor::new();
    executor.register("echo", |inv| {
        let payload = inv.payload.clone();
        boxed(async move { Ok(payload) })
    });

    let scheduler = Scheduler::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(executor),
        Arc::new(Registries::with_builtins()),
        EventBus::new(),
        SchedulerConfig::default(),
    )
    .unwrap();

    let schedule = scheduler
        .create_schedule(
            NewScheduledJob::after_run("echo", 30).handler("echo", json!({ "hello": "pg" })),
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(schedule.lease_owner, None);

    assert_eq!(scheduler.poll_executable(t0()).await.unwrap(), 1);

    let mut finished = 0;
    for _ in 0..200 {
        finished = scheduler.poll_completion(secs(1)).await.unwrap();
        if finished > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(finished, 1);

    let store = scheduler.store();
    let mut tasks = store.tasks_for_schedule(&schedule.id, &[]).await.unwrap();
    tasks.sort_by_key(|t| t.execute_at);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].state, TaskState::Completed);
    assert_eq!(
        tasks[0].completed_info,
        Some(json!({ "output": { "hello": "pg" } }))
    );
    assert_eq!(tasks[1].state, TaskState::Pending);
    assert_eq!(tasks[1].execute_at, secs(31));

    let row = store.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert_eq!(row.lease_owner, None);
    assert_eq!(row.update_state, None);

    assert!(scheduler.disable_schedule(&schedule.id, secs(2)).await.unwrap());
    assert_eq!(scheduler.poll_executable(secs(31)).await.unwrap(), 0);
}
