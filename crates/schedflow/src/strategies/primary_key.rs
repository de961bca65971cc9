use std::sync::Arc;

use uuid::Uuid;

use super::StrategyRegistry;

/// Generates primary keys for new schedule and task rows.
pub trait PrimaryKeyStrategy: Send + Sync {
    fn create(&self) -> String;
}

#[derive(Debug, Default, Clone)]
pub struct UuidV4Key;

impl PrimaryKeyStrategy for UuidV4Key {
    fn create(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Time-ordered keys; rows created later sort later.
#[derive(Debug, Default, Clone)]
pub struct UuidV7Key;

impl PrimaryKeyStrategy for UuidV7Key {
    fn create(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

pub(crate) fn register_builtins(registry: &mut StrategyRegistry<dyn PrimaryKeyStrategy>) {
    registry.register("uuid-v4", Arc::new(UuidV4Key));
    registry.register("uuid-v7", Arc::new(UuidV7Key));
}
