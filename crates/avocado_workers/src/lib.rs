//! Task execution: isolating runners, collecting their status, and
//! scheduling tasks to completion.

pub mod scheduler;
pub mod spawner;
pub mod status_server;
pub mod task;

pub use scheduler::{
    Scheduler, SchedulerCommand, SchedulerConfig, SchedulerError, SchedulerReport, StatusHandler,
};
pub use spawner::{SpawnContext, SpawnError, Spawner};
pub use status_server::{StatusSender, StatusServer, StatusServerError};
pub use task::{Task, TaskId};
