pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod poll;
pub mod schedules;
pub mod store;
pub mod strategies;
pub mod time;

pub use error::{Result, SchedError};
