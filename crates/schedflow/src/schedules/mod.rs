pub mod definition;
pub mod engine;
pub mod lease;
pub mod model;
pub mod tasks;

pub use definition::{AfterRunModel, CronDefinition, OnceModel, ScheduleDefinition};
pub use engine::{Scheduler, SchedulerConfig};
pub use lease::LeaseManager;
pub use model::{
    NewScheduledJob, NewTask, ScheduledJob, Task, TaskState, TaskTransition, UpdateState,
};
pub use tasks::TaskStateMachine;
