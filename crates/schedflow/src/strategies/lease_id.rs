use std::sync::Arc;

use uuid::Uuid;

use super::StrategyRegistry;

/// Produces the opaque owner tag written into `lease_owner`.
pub trait LeaseIdStrategy: Send + Sync {
    fn create(&self) -> String;
}

/// A fresh v4 UUID per lease attempt.
#[derive(Debug, Default, Clone)]
pub struct UuidLeaseId;

impl LeaseIdStrategy for UuidLeaseId {
    fn create(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// `<worker_id>:<uuid>`, so an operator can tell which process holds a lease.
#[derive(Debug, Clone)]
pub struct WorkerPrefixedLeaseId {
    worker_id: String,
}

impl WorkerPrefixedLeaseId {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
        }
    }
}

impl LeaseIdStrategy for WorkerPrefixedLeaseId {
    fn create(&self) -> String {
        format!("{}:{}", self.worker_id, Uuid::new_v4())
    }
}

pub(crate) fn register_builtins(registry: &mut StrategyRegistry<dyn LeaseIdStrategy>) {
    registry.register("uuid", Arc::new(UuidLeaseId));
}
