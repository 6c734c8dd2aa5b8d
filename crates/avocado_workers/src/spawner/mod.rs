//! Spawners isolate one task each and expose its lifecycle.

mod podman;
mod process;

use std::ffi::OsString;

use async_trait::async_trait;

use crate::status_server::StatusSender;
use crate::task::Task;

pub use podman::PodmanSpawner;
pub use process::ProcessSpawner;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Unavailable(String),
    #[error("could not encode the task recipe: {0}")]
    Recipe(#[from] serde_json::Error),
    #[error("task {0} was already spawned")]
    AlreadySpawned(String),
}

/// What a spawned task is connected to.
#[derive(Clone)]
pub struct SpawnContext {
    /// Queue for messages the spawner relays (the runner's stdout and stderr).
    pub sender: StatusSender,
    /// Network status server the runner should report to, if any.
    pub status_uri: Option<String>,
    /// Extra environment for the runner.
    pub env: Vec<(OsString, OsString)>,
}

/// Isolation of task execution.
///
/// The scheduler only depends on these operations; which isolation unit
/// backs them is up to the implementation.
#[async_trait]
pub trait Spawner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether runners of this spawner can only report over the network.
    fn requires_network_status(&self) -> bool {
        false
    }

    /// Starts the runner for `task`.
    async fn spawn(&self, task: &Task, ctx: &SpawnContext) -> Result<(), SpawnError>;

    /// Whether the isolation unit is still running, or still has output
    /// in flight to the status queue.
    fn is_task_alive(&self, task: &Task) -> bool;

    /// Asks the task to terminate gracefully.
    async fn terminate_task(&self, task: &Task);

    /// Forcibly stops the task.
    async fn kill_task(&self, task: &Task);

    /// Waits for the isolation unit to exit and forgets about it.
    async fn wait_task(&self, task: &Task);

    async fn pause_task(&self, task: &Task);

    async fn resume_task(&self, task: &Task);
}

/// The spawner named `name`, as accepted by `--nrunner-spawner`.
pub fn by_name(
    name: &str,
    runner_command: Vec<OsString>,
    podman: PodmanConfig,
) -> Option<Box<dyn Spawner>> {
    match name {
        "process" => Some(Box::new(ProcessSpawner::new(runner_command))),
        "podman" => Some(Box::new(PodmanSpawner::new(podman))),
        _ => None,
    }
}

/// Settings of the podman spawner.
#[derive(Debug, Clone)]
pub struct PodmanConfig {
    pub binary: String,
    pub image: String,
    /// Runner command inside the image.
    pub runner: Vec<String>,
}

impl Default for PodmanConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            image: "fedora:latest".to_string(),
            runner: vec!["avocado-runner".to_string()],
        }
    }
}
