use std::ffi::OsString;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use avocado_utils::net_protocol::messages::Message;
use avocado_utils::net_protocol::task::STATUS_SERVER_URI_ENV;
use fnv::FnvHashMap;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use super::{SpawnContext, SpawnError, Spawner};
use crate::status_server::StatusSender;
use crate::task::{Task, TaskId};

const STDERR_CHUNK: usize = 8 * 1024;

/// A runner child process and the readers relaying its output.
pub(super) struct ChildHandle {
    pgid: Pid,
    exited: watch::Receiver<bool>,
    open_outputs: Arc<AtomicUsize>,
}

impl ChildHandle {
    /// Spawns `cmd` in its own process group, writes `stdin` to it and
    /// relays its stdout (protocol lines) and stderr into `sender`.
    pub(super) async fn launch(
        mut cmd: Command,
        task: &TaskId,
        stdin: Vec<u8>,
        sender: StatusSender,
    ) -> Result<ChildHandle, SpawnError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Unavailable("runner exited immediately".to_string()))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(&stdin).await?;
            pipe.shutdown().await?;
        }

        let open_outputs = Arc::new(AtomicUsize::new(0));
        if let Some(stdout) = child.stdout.take() {
            open_outputs.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(relay_protocol(
                stdout,
                task.clone(),
                sender.clone(),
                open_outputs.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            open_outputs.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(relay_stderr(
                stderr,
                task.clone(),
                sender,
                open_outputs.clone(),
            ));
        }

        let (exited_tx, exited) = watch::channel(false);
        let task = task.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(%task, %status, "runner exited"),
                Err(err) => tracing::warn!(%task, ?err, "failed waiting for runner"),
            }
            let _ = exited_tx.send(true);
        });

        Ok(ChildHandle {
            pgid: Pid::from_raw(pid as i32),
            exited,
            open_outputs,
        })
    }

    pub(super) fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    pub(super) fn is_alive(&self) -> bool {
        !self.has_exited() || self.open_outputs.load(Ordering::SeqCst) > 0
    }

    /// Signals the whole process group of the runner.
    pub(super) fn signal(&self, signal: Signal) {
        if let Err(err) = killpg(self.pgid, signal) {
            tracing::debug!(pgid = %self.pgid, %signal, ?err, "could not signal runner");
        }
    }

    pub(super) async fn wait(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|exited| *exited).await;
    }
}

async fn relay_protocol<R>(
    reader: R,
    task: TaskId,
    sender: StatusSender,
    open_outputs: Arc<AtomicUsize>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let message = serde_json::from_slice::<Message>(&line)
                    .unwrap_or_else(|_| Message::stdout(line.clone()));
                sender.send(&task, message).await;
            }
            Err(err) => {
                tracing::warn!(%task, ?err, "failed reading runner stdout");
                break;
            }
        }
    }
    open_outputs.fetch_sub(1, Ordering::SeqCst);
}

async fn relay_stderr<R>(
    mut reader: R,
    task: TaskId,
    sender: StatusSender,
    open_outputs: Arc<AtomicUsize>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; STDERR_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sender.send(&task, Message::stderr(&buf[..n])).await,
            Err(err) => {
                tracing::warn!(%task, ?err, "failed reading runner stderr");
                break;
            }
        }
    }
    open_outputs.fetch_sub(1, Ordering::SeqCst);
}

/// Runs every task's runner as a local child process.
pub struct ProcessSpawner {
    runner_command: Vec<OsString>,
    children: Mutex<FnvHashMap<TaskId, Arc<ChildHandle>>>,
}

impl ProcessSpawner {
    /// `runner_command` is the program (and leading arguments) of the
    /// runner application; `task-run` is appended to it.
    pub fn new(runner_command: Vec<OsString>) -> Self {
        Self {
            runner_command,
            children: Default::default(),
        }
    }

    fn child(&self, task: &Task) -> Option<Arc<ChildHandle>> {
        self.children.lock().get(&task.id).cloned()
    }
}

#[async_trait]
impl Spawner for ProcessSpawner {
    fn name(&self) -> &'static str {
        "process"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(task = %task.id))]
    async fn spawn(&self, task: &Task, ctx: &SpawnContext) -> Result<(), SpawnError> {
        if self.children.lock().contains_key(&task.id) {
            return Err(SpawnError::AlreadySpawned(task.id.to_string()));
        }
        let Some((program, leading_args)) = self.runner_command.split_first() else {
            return Err(SpawnError::Unavailable("no runner command configured".to_string()));
        };

        let mut recipe = task.recipe.clone();
        if let Some(uri) = &ctx.status_uri {
            recipe.status_uris = vec![uri.clone()];
        }
        let recipe = serde_json::to_vec(&recipe)?;

        let mut cmd = Command::new(program);
        cmd.args(leading_args)
            .arg("task-run")
            .envs(ctx.env.iter().map(|(k, v)| (k, v)));
        if let Some(uri) = &ctx.status_uri {
            cmd.env(STATUS_SERVER_URI_ENV, uri);
        }

        let handle = ChildHandle::launch(cmd, &task.id, recipe, ctx.sender.clone()).await?;
        self.children.lock().insert(task.id.clone(), Arc::new(handle));
        Ok(())
    }

    fn is_task_alive(&self, task: &Task) -> bool {
        self.child(task).map_or(false, |c| c.is_alive())
    }

    async fn terminate_task(&self, task: &Task) {
        if let Some(child) = self.child(task) {
            if !child.has_exited() {
                child.signal(Signal::SIGTERM);
            }
        }
    }

    async fn kill_task(&self, task: &Task) {
        if let Some(child) = self.child(task) {
            child.signal(Signal::SIGKILL);
        }
    }

    async fn wait_task(&self, task: &Task) {
        if let Some(child) = self.child(task) {
            child.wait().await;
        }
        self.children.lock().remove(&task.id);
    }

    async fn pause_task(&self, task: &Task) {
        if let Some(child) = self.child(task) {
            child.signal(Signal::SIGSTOP);
        }
    }

    async fn resume_task(&self, task: &Task) {
        if let Some(child) = self.child(task) {
            child.signal(Signal::SIGCONT);
        }
    }
}
