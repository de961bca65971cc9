//! Name-keyed strategy registries.
//!
//! Schedules and configuration refer to behaviours by name
//! (`task_creation_strategy_name = "cron"`, `SCHEDFLOW_POLL_WAIT_STRATEGY=simple-backoff`).
//! Each concern has one registry mapping those names to a shared trait object.
//! Built-ins are installed by [`Registries::with_builtins`]; callers may
//! register more before handing the registries to the engine.

pub mod duplicate;
pub mod lease_id;
pub mod poll_wait;
pub mod primary_key;
pub mod retry;
pub mod task_creation;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, SchedError};

pub use duplicate::{DuplicateDecision, DuplicateTaskStrategy};
pub use lease_id::LeaseIdStrategy;
pub use poll_wait::GeneratePollWaitTimesStrategy;
pub use primary_key::PrimaryKeyStrategy;
pub use retry::RetryStrategy;
pub use task_creation::TaskCreationStrategy;

pub struct StrategyRegistry<T: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Arc<T>>,
}

impl<T: ?Sized> StrategyRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn register(&mut self, name: &str, strategy: Arc<T>) {
        self.entries.insert(name.to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<T>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| SchedError::UnknownStrategy {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Arc<T>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<T: ?Sized> Clone for StrategyRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            entries: self.entries.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Registries {
    pub lease_id: StrategyRegistry<dyn LeaseIdStrategy>,
    pub primary_key: StrategyRegistry<dyn PrimaryKeyStrategy>,
    pub task_creation: StrategyRegistry<dyn TaskCreationStrategy>,
    pub duplicate: StrategyRegistry<dyn DuplicateTaskStrategy>,
    pub retry: StrategyRegistry<dyn RetryStrategy>,
    pub poll_wait: StrategyRegistry<dyn GeneratePollWaitTimesStrategy>,
}

impl Registries {
    pub fn empty() -> Self {
        Self {
            lease_id: StrategyRegistry::new("lease-id"),
            primary_key: StrategyRegistry::new("primary-key"),
            task_creation: StrategyRegistry::new("task-creation"),
            duplicate: StrategyRegistry::new("duplicate-task"),
            retry: StrategyRegistry::new("retry"),
            poll_wait: StrategyRegistry::new("poll-wait-time"),
        }
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        lease_id::register_builtins(&mut r.lease_id);
        primary_key::register_builtins(&mut r.primary_key);
        task_creation::register_builtins(&mut r.task_creation);
        duplicate::register_builtins(&mut r.duplicate);
        retry::register_builtins(&mut r.retry);
        poll_wait::register_builtins(&mut r.poll_wait);
        r
    }

    /// Task-creation strategy names whose schedules must be polled on a timer.
    pub fn polled_task_creation_names(&self) -> Vec<String> {
        self.task_creation
            .entries()
            .filter(|(_, s)| s.poll_strategy() == task_creation::POLL_CRON)
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::with_builtins()
    }
}
