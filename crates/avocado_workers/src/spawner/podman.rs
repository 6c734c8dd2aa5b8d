use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use avocado_utils::net_protocol::task::STATUS_SERVER_URI_ENV;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::OnceCell;

use super::process::ChildHandle;
use super::{PodmanConfig, SpawnContext, SpawnError, Spawner};
use crate::task::{Task, TaskId};

struct Container {
    name: String,
    handle: ChildHandle,
}

/// Runs every task's runner inside a podman container.
///
/// Runners report over the network status server; the container shares
/// the host network so the server's loopback endpoint is reachable.
pub struct PodmanSpawner {
    config: PodmanConfig,
    available: OnceCell<Result<(), String>>,
    containers: Mutex<FnvHashMap<TaskId, Arc<Container>>>,
}

impl PodmanSpawner {
    pub fn new(config: PodmanConfig) -> Self {
        Self {
            config,
            available: OnceCell::new(),
            containers: Default::default(),
        }
    }

    async fn check_available(&self) -> Result<(), SpawnError> {
        let binary = self.config.binary.clone();
        self.available
            .get_or_init(|| async move {
                match Command::new(&binary).arg("--version").output().await {
                    Ok(output) if output.status.success() => Ok(()),
                    Ok(output) => Err(format!(
                        "{binary} --version failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )),
                    Err(err) => Err(format!("{binary} is not available: {err}")),
                }
            })
            .await
            .clone()
            .map_err(SpawnError::Unavailable)
    }

    /// Arguments of `podman run` for a task.
    fn run_args(
        &self,
        name: &str,
        task: &Task,
        status_uri: &str,
        env: &[(OsString, OsString)],
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["run", "--rm", "-i", "--init", "--network", "host"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push("--name".into());
        args.push(name.into());
        args.push("-e".into());
        args.push(format!("{STATUS_SERVER_URI_ENV}={status_uri}").into());
        for (key, value) in env {
            let mut pair = key.clone();
            pair.push("=");
            pair.push(value);
            args.push("-e".into());
            args.push(pair);
        }

        let runnable = task.runnable();
        let mut volumes = Vec::new();
        if let Some(dir) = runnable
            .uri
            .as_deref()
            .map(|uri| uri.split_once(':').map_or(uri, |(path, _)| path))
            .map(Path::new)
            .filter(|path| path.exists())
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            volumes.push(format!("{0}:{0}:ro,z", dir.display()));
        }
        if let Some(dir) = &runnable.output_dir {
            volumes.push(format!("{0}:{0}:rw,z", dir.display()));
        }
        for volume in volumes {
            args.push("-v".into());
            args.push(volume.into());
        }

        args.push(self.config.image.clone().into());
        args.extend(self.config.runner.iter().map(OsString::from));
        args.push("task-run".into());
        args
    }

    fn container(&self, task: &Task) -> Option<Arc<Container>> {
        self.containers.lock().get(&task.id).cloned()
    }

    async fn podman(&self, args: &[&str]) {
        let result = Command::new(&self.config.binary).args(args).output().await;
        match result {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::debug!(
                ?args,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "podman command failed"
            ),
            Err(err) => tracing::warn!(?args, ?err, "could not run podman"),
        }
    }
}

#[async_trait]
impl Spawner for PodmanSpawner {
    fn name(&self) -> &'static str {
        "podman"
    }

    fn requires_network_status(&self) -> bool {
        true
    }

    #[tracing::instrument(level = "debug", skip_all, fields(task = %task.id))]
    async fn spawn(&self, task: &Task, ctx: &SpawnContext) -> Result<(), SpawnError> {
        if self.containers.lock().contains_key(&task.id) {
            return Err(SpawnError::AlreadySpawned(task.id.to_string()));
        }
        let Some(status_uri) = ctx.status_uri.as_deref() else {
            return Err(SpawnError::Unavailable(
                "the podman spawner requires a network status server".to_string(),
            ));
        };
        self.check_available().await?;

        let name = format!("avocado-{}", uuid::Uuid::new_v4().simple());
        let mut recipe = task.recipe.clone();
        recipe.status_uris = vec![status_uri.to_string()];
        let recipe = serde_json::to_vec(&recipe)?;

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.run_args(&name, task, status_uri, &ctx.env));
        let handle = ChildHandle::launch(cmd, &task.id, recipe, ctx.sender.clone()).await?;
        self.containers
            .lock()
            .insert(task.id.clone(), Arc::new(Container { name, handle }));
        Ok(())
    }

    fn is_task_alive(&self, task: &Task) -> bool {
        self.container(task).map_or(false, |c| c.handle.is_alive())
    }

    async fn terminate_task(&self, task: &Task) {
        if let Some(container) = self.container(task) {
            self.podman(&["kill", "--signal", "TERM", &container.name])
                .await;
        }
    }

    async fn kill_task(&self, task: &Task) {
        if let Some(container) = self.container(task) {
            self.podman(&["kill", "--signal", "KILL", &container.name])
                .await;
            container.handle.signal(nix::sys::signal::Signal::SIGKILL);
        }
    }

    async fn wait_task(&self, task: &Task) {
        if let Some(container) = self.container(task) {
            container.handle.wait().await;
        }
        self.containers.lock().remove(&task.id);
    }

    async fn pause_task(&self, task: &Task) {
        if let Some(container) = self.container(task) {
            self.podman(&["pause", &container.name]).await;
        }
    }

    async fn resume_task(&self, task: &Task) {
        if let Some(container) = self.container(task) {
            self.podman(&["unpause", &container.name]).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status_server::StatusServer;
    use avocado_utils::net_protocol::task::TaskCategory;
    use avocado_utils::runnable::Runnable;

    #[test]
    fn run_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let test = avocado_test_utils::write_script(dir.path(), "t.sh", "true");
        let runnable = Runnable::new("exec-test", Some(test.display().to_string()))
            .with_output_dir("/results/1-t");
        let task = Task::new(TaskId::new("1-t"), runnable, TaskCategory::Test);
        let spawner = PodmanSpawner::new(PodmanConfig::default());

        let args: Vec<String> = spawner
            .run_args(
                "avocado-x",
                &task,
                "127.0.0.1:9999",
                &[("EXTRA".into(), "1".into())],
            )
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();

        assert_eq!(
            &args[..8],
            &["run", "--rm", "-i", "--init", "--network", "host", "--name", "avocado-x"]
        );
        assert!(args.contains(&"AVOCADO_STATUS_SERVER_URI=127.0.0.1:9999".to_string()));
        assert!(args.contains(&"EXTRA=1".to_string()));
        let dir = dir.path().display().to_string();
        assert!(args.contains(&format!("{dir}:{dir}:ro,z")));
        assert!(args.contains(&"/results/1-t:/results/1-t:rw,z".to_string()));
        assert_eq!(
            &args[args.len() - 3..],
            &["fedora:latest", "avocado-runner", "task-run"]
        );
    }

    #[tokio::test]
    async fn requires_network_status() {
        let server = StatusServer::local();
        let spawner = PodmanSpawner::new(PodmanConfig::default());
        let task = Task::new(
            TaskId::new("1-noop"),
            Runnable::new("noop", None),
            TaskCategory::Test,
        );
        let ctx = SpawnContext {
            sender: server.sender(),
            status_uri: None,
            env: Vec::new(),
        };
        assert!(matches!(
            spawner.spawn(&task, &ctx).await,
            Err(SpawnError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let server = StatusServer::local();
        let spawner = PodmanSpawner::new(PodmanConfig {
            binary: "/no/such/podman".to_string(),
            ..PodmanConfig::default()
        });
        let task = Task::new(
            TaskId::new("1-noop"),
            Runnable::new("noop", None),
            TaskCategory::Test,
        );
        let ctx = SpawnContext {
            sender: server.sender(),
            status_uri: Some("127.0.0.1:1".to_string()),
            env: Vec::new(),
        };
        assert!(matches!(
            spawner.spawn(&task, &ctx).await,
            Err(SpawnError::Unavailable(_))
        ));
    }
}
