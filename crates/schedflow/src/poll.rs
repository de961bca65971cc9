//! Self-rescheduling poll loops.
//!
//! A [`PollLoop`] runs one async action, then asks its registrar to run the
//! next iteration after `wait_times[i]`, cycling through the sequence. The loop
//! never checks for cancellation itself: a stopped registrar simply drops any
//! further registrations, so an iteration already in flight finishes and the
//! chain ends there.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, error};

use crate::error::{Result, SchedError};
use crate::events::{EventBus, SchedulerEvent};
use crate::strategies::GeneratePollWaitTimesStrategy;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The action a loop repeats.
pub type PollAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Host primitive: run `task` once after `delay`.
pub trait RegisterPollCallback: Send + Sync {
    fn register(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Registrar backed by the tokio runtime.
///
/// `stop()` cancels pending delays immediately and turns later
/// registrations into no-ops.
#[derive(Clone)]
pub struct TokioRegistrar {
    shutdown: Arc<watch::Sender<bool>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TokioRegistrar {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(tx),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until every iteration that already started has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TokioRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterPollCallback for TokioRegistrar {
    fn register(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        if self.is_stopped() {
            return;
        }

        let mut rx = self.shutdown.subscribe();
        let in_flight = self.in_flight.clone();
        let idle = self.idle.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = rx.wait_for(|stopped| *stopped) => return,
            }
            if *rx.borrow() {
                return;
            }

            in_flight.fetch_add(1, Ordering::SeqCst);
            let _guard = InFlight { in_flight, idle };
            task.await;
        });
    }
}

/// Counts one running iteration; decrements even if the iteration unwinds.
struct InFlight {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct PollLoop {
    name: String,
    wait_times: Vec<Duration>,
    next_wait: AtomicUsize,
    iterations: AtomicU64,
    action: PollAction,
    registrar: Arc<dyn RegisterPollCallback>,
    events: EventBus,
}

impl PollLoop {
    pub fn new(
        name: &str,
        wait_strategy: &dyn GeneratePollWaitTimesStrategy,
        registrar: Arc<dyn RegisterPollCallback>,
        events: EventBus,
        action: PollAction,
    ) -> Result<Arc<Self>> {
        let wait_times = wait_strategy.wait_times();
        if wait_times.is_empty() {
            return Err(SchedError::EmptyWaitTimes);
        }

        Ok(Arc::new(Self {
            name: name.to_string(),
            wait_times,
            next_wait: AtomicUsize::new(0),
            iterations: AtomicU64::new(0),
            action,
            registrar,
            events,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Register the first iteration to run right away.
    pub fn start(self: &Arc<Self>) {
        debug!(poll = %self.name, "poll loop starting");
        self.registrar
            .register(Duration::ZERO, self.clone().run_iteration());
    }

    /// Run the action once, then register the next iteration.
    pub fn run_iteration(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.run_action().await;
            self.schedule_next();
        })
    }

    async fn run_action(&self) {
        self.iterations.fetch_add(1, Ordering::SeqCst);

        // run on its own task so a panic surfaces as a JoinError
        let outcome = match tokio::spawn((self.action)()).await {
            Ok(res) => res,
            Err(join) => Err(SchedError::Execution(format!(
                "poll iteration panicked: {join}"
            ))),
        };

        if let Err(e) = outcome {
            error!(poll = %self.name, error = %e, "poll iteration failed");
            self.events
                .publish(SchedulerEvent::general_error(&self.name, &e));
        }
    }

    fn schedule_next(self: &Arc<Self>) {
        let i = self.next_wait.fetch_add(1, Ordering::SeqCst);
        let delay = self.wait_times[i % self.wait_times.len()];
        self.registrar.register(delay, self.clone().run_iteration());
    }
}

/// Wrap an async closure as a [`PollAction`].
pub fn action<F, Fut>(f: F) -> PollAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<'static, Result<()>>)
}
