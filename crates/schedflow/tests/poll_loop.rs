// tests/poll_loop.rs
mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{drain, memory_harness};
use schedflow::events::{EventBus, SchedulerEvent};
use schedflow::executor::LocalExecutor;
use schedflow::poll::{self, BoxFuture, PollLoop, RegisterPollCallback, TokioRegistrar};
use schedflow::strategies::poll_wait::{ConstantWait, SequenceWait};
use schedflow::SchedError;

/// Registrar that queues callbacks until the test runs them.
#[derive(Default)]
struct ManualRegistrar {
    pending: Mutex<VecDeque<BoxFuture<'static, ()>>>,
    delays: Mutex<Vec<Duration>>,
}

impl RegisterPollCallback for ManualRegistrar {
    fn register(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        self.delays.lock().unwrap().push(delay);
        self.pending.lock().unwrap().push_back(task);
    }
}

impl ManualRegistrar {
    async fn run_next(&self) -> bool {
        let next = self.pending.lock().unwrap().pop_front();
        match next {
            Some(task) => {
                task.await;
                true
            }
            None => false,
        }
    }

    fn delays_secs(&self) -> Vec<u64> {
        self.delays.lock().unwrap().iter().map(Duration::as_secs).collect()
    }
}

fn counting_action(counter: Arc<AtomicUsize>) -> poll::PollAction {
    poll::action(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), SchedError>(())
        }
    })
}

#[test]
fn empty_wait_sequence_is_rejected() {
    let registrar = Arc::new(ManualRegistrar::default());
    let res = PollLoop::new(
        "empty",
        &SequenceWait(Vec::new()),
        registrar,
        EventBus::new(),
        counting_action(Arc::new(AtomicUsize::new(0))),
    );
    assert!(matches!(res, Err(SchedError::EmptyWaitTimes)));
}

#[tokio::test]
async fn waits_cycle_through_the_sequence() {
    let registrar = Arc::new(ManualRegistrar::default());
    let counter = Arc::new(AtomicUsize::new(0));

    let l = PollLoop::new(
        "cycle",
        &SequenceWait::from_secs(&[1, 2]),
        registrar.clone(),
        EventBus::new(),
        counting_action(counter.clone()),
    )
    .unwrap();

    l.start();
    assert_eq!(registrar.delays_secs(), vec![0]);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    for _ in 0..5 {
        assert!(registrar.run_next().await);
    }

    assert_eq!(registrar.delays_secs(), vec![0, 1, 2, 1, 2, 1]);
    assert_eq!(counter.load(Ordering::SeqCst), 5);
    assert_eq!(l.iterations(), 5);
    assert_eq!(l.name(), "cycle");
}

#[tokio::test]
async fn failing_iteration_is_reported_and_the_loop_continues() {
    let registrar = Arc::new(ManualRegistrar::default());
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let calls = Arc::new(AtomicUsize::new(0));

    let c = calls.clone();
    let l = PollLoop::new(
        "flaky",
        &ConstantWait(Duration::from_secs(3)),
        registrar.clone(),
        events,
        poll::action(move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(SchedError::Execution("store unavailable".into()));
                }
                Ok(())
            }
        }),
    )
    .unwrap();

    l.start();
    assert!(registrar.run_next().await);
    assert!(registrar.run_next().await);
    assert!(registrar.run_next().await);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(registrar.delays_secs(), vec![0, 3, 3, 3]);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        SchedulerEvent::GeneralError { source, message } => {
            assert_eq!(source, "flaky");
            assert!(message.contains("store unavailable"), "{message}");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn tokio_registrar_runs_on_the_timer_until_stopped() {
    let registrar = Arc::new(TokioRegistrar::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let l = PollLoop::new(
        "timer",
        &ConstantWait(Duration::from_secs(10)),
        registrar.clone(),
        EventBus::new(),
        counting_action(counter.clone()),
    )
    .unwrap();

    l.start();
    // iterations at t = 0, 10, 20, 30
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 4);

    registrar.stop();
    assert!(registrar.is_stopped());
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 4);

    // registering after stop is a no-op
    let late = Arc::new(AtomicBool::new(false));
    let flag = late.clone();
    registrar.register(
        Duration::ZERO,
        Box::pin(async move { flag.store(true, Ordering::SeqCst) }),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    registrar.drain().await;
    assert!(!late.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_the_iteration_in_flight() {
    let registrar = Arc::new(TokioRegistrar::new());
    let finished = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));

    let (f, r) = (finished.clone(), runs.clone());
    let l = PollLoop::new(
        "slow",
        &ConstantWait(Duration::from_secs(1)),
        registrar.clone(),
        EventBus::new(),
        poll::action(move || {
            let (f, r) = (f.clone(), r.clone());
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                f.store(true, Ordering::SeqCst);
                Ok::<(), SchedError>(())
            }
        }),
    )
    .unwrap();

    l.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!finished.load(Ordering::SeqCst));

    registrar.stop();
    registrar.drain().await;

    assert!(finished.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scheduler_builds_one_loop_per_pass() {
    let h = memory_harness(Arc::new(LocalExecutor::new()));
    let registrar = Arc::new(ManualRegistrar::default());

    let loops = h
        .scheduler
        .poll_loops(
            registrar.clone(),
            &ConstantWait(Duration::from_secs(1)),
            &ConstantWait(Duration::from_secs(30)),
        )
        .unwrap();

    let names: Vec<&str> = loops.iter().map(|l| l.name()).collect();
    assert_eq!(
        names,
        vec![
            "task-creation",
            "executable",
            "completion",
            "start-errors",
            "long-queued",
            "long-executing",
            "expired-leases",
        ]
    );

    for l in &loops {
        l.start();
    }
    // one pass each over an empty store
    for _ in 0..loops.len() {
        assert!(registrar.run_next().await);
    }
    assert!(loops.iter().all(|l| l.iterations() == 1));

    let mut delays = registrar.delays_secs();
    delays.sort_unstable();
    // 7 starts, then 4 task passes at 1s and 3 sweeps at 30s
    assert_eq!(delays, vec![0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 30, 30, 30]);

    let empty = SequenceWait(Vec::new());
    let err = h
        .scheduler
        .poll_loops(registrar, &empty, &ConstantWait(Duration::from_secs(1)))
        .err()
        .expect("empty wait sequence must be rejected");
    assert!(matches!(err, SchedError::EmptyWaitTimes));
}

fn panicking_action(calls: Arc<AtomicUsize>) -> poll::PollAction {
    poll::action(move || {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                panic!("row decoder blew up");
            }
            Ok::<(), SchedError>(())
        }
    })
}

#[tokio::test]
async fn panicking_iteration_is_reported_and_rescheduled() {
    let registrar = Arc::new(ManualRegistrar::default());
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let calls = Arc::new(AtomicUsize::new(0));

    let l = PollLoop::new(
        "panicky",
        &ConstantWait(Duration::from_secs(2)),
        registrar.clone(),
        events,
        panicking_action(calls.clone()),
    )
    .unwrap();

    l.start();
    assert!(registrar.run_next().await);
    assert!(registrar.run_next().await);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(l.iterations(), 2);
    assert_eq!(registrar.delays_secs(), vec![0, 2, 2]);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    for event in &events {
        match event {
            SchedulerEvent::GeneralError { source, message } => {
                assert_eq!(source, "panicky");
                assert!(message.contains("panicked"), "{message}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_loop_keeps_running_and_drains() {
    let registrar = Arc::new(TokioRegistrar::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let l = PollLoop::new(
        "panicky",
        &ConstantWait(Duration::from_secs(10)),
        registrar.clone(),
        EventBus::new(),
        panicking_action(calls.clone()),
    )
    .unwrap();

    l.start();
    // iterations at t = 0, 10, 20
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(l.iterations(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    registrar.stop();
    tokio::time::timeout(Duration::from_secs(60), registrar.drain())
        .await
        .expect("drain returns once the loop is stopped");
}
