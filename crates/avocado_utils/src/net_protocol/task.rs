//! What a spawner hands to a runner process, and what a runner sends back
//! first when it reports over the network.

use serde_derive::{Deserialize, Serialize};

use crate::runnable::Runnable;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Test,
    Dependency,
}

/// A runnable bound to a task identity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskRecipe {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub runnable: Runnable,
    /// `host:port` endpoints to report to. Empty means messages go to stdout.
    #[serde(default)]
    pub status_uris: Vec<String>,
    pub category: TaskCategory,
}

/// First record on a network status connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskAuth {
    pub task_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Environment variable carrying the status server endpoint into tasks.
pub const STATUS_SERVER_URI_ENV: &str = "AVOCADO_STATUS_SERVER_URI";
