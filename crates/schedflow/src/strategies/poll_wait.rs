use std::sync::Arc;
use std::time::Duration;

use super::StrategyRegistry;

/// Produces the cyclic wait sequence a poll loop sleeps through between
/// iterations. An empty sequence is rejected when the loop is built.
pub trait GeneratePollWaitTimesStrategy: Send + Sync {
    fn wait_times(&self) -> Vec<Duration>;
}

#[derive(Debug, Clone)]
pub struct ConstantWait(pub Duration);

impl GeneratePollWaitTimesStrategy for ConstantWait {
    fn wait_times(&self) -> Vec<Duration> {
        vec![self.0]
    }
}

/// Fixed sequence, repeated.
#[derive(Debug, Clone)]
pub struct SequenceWait(pub Vec<Duration>);

impl SequenceWait {
    pub fn from_secs(secs: &[u64]) -> Self {
        Self(secs.iter().copied().map(Duration::from_secs).collect())
    }
}

impl GeneratePollWaitTimesStrategy for SequenceWait {
    fn wait_times(&self) -> Vec<Duration> {
        self.0.clone()
    }
}

pub(crate) fn register_builtins(registry: &mut StrategyRegistry<dyn GeneratePollWaitTimesStrategy>) {
    registry.register("simple-backoff", Arc::new(SequenceWait::from_secs(&[1, 5, 5, 30])));
    registry.register("constant-1s", Arc::new(ConstantWait(Duration::from_secs(1))));
    registry.register("constant-5s", Arc::new(ConstantWait(Duration::from_secs(5))));
    registry.register("constant-30s", Arc::new(ConstantWait(Duration::from_secs(30))));
}
