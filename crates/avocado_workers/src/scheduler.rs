//! Drives every task of a job from admission to exactly one `finished`.
//!
//! The scheduler is a single cooperative loop: it admits ready tasks up
//! to the parallelism bound, drains the status queue, and enforces
//! timeouts with a two-phase (terminate, then kill) protocol. Tasks that
//! never report are given a synthesized terminal status, so every task
//! admitted reaches the handler with a `started` followed, eventually,
//! by one `finished`.

use std::ffi::OsString;
use std::time::{Duration, Instant};

use avocado_utils::net_protocol::messages::{Finished, Message, MessageKind, Outcome};
use fnv::FnvHashMap;
use tokio::sync::mpsc;

use crate::spawner::{SpawnContext, Spawner};
use crate::status_server::StatusServer;
use crate::task::{Task, TaskId};

/// Most messages handled before deadlines are looked at again.
const DRAIN_BATCH: usize = 1024;

pub const TIMEOUT_REASON: &str = "Test interrupted: Timeout reached";
pub const LOST_RUNNER_REASON: &str = "runner exited without reporting status";
pub const DRY_RUN_REASON: &str = "Test cancelled due to --dry-run";
pub const FAILFAST_REASON: &str = "Interrupting job (failfast).";
pub const JOB_TIMEOUT_SKIP_REASON: &str = "Test skipped: job timeout reached before it started";
pub const INTERRUPTED_SKIP_REASON: &str = "Test skipped: job interrupted before it started";
pub const INTERRUPTED_REASON: &str = "Test interrupted: job interrupted by user";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel_tasks: usize,
    /// Wall clock allowed to each task, counted from its spawn.
    pub task_timeout: Option<Duration>,
    /// Time between the graceful terminate and the forced kill.
    pub soft_to_hard: Duration,
    /// Wall clock allowed to the whole job.
    pub job_timeout: Option<Duration>,
    pub failfast: bool,
    pub dry_run: bool,
    /// How long the loop waits for messages before checking deadlines.
    pub interval: Duration,
    /// How long a runner that is gone may take to deliver its last messages.
    pub lost_runner_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: num_cpus::get(),
            task_timeout: None,
            soft_to_hard: Duration::from_secs(1),
            job_timeout: None,
            failfast: false,
            dry_run: false,
            interval: Duration::from_millis(10),
            lost_runner_grace: Duration::from_millis(500),
        }
    }
}

/// Requests delivered to a running scheduler, typically from signal handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    TogglePause,
    Interrupt,
}

/// Consumer of the per-task message streams.
pub trait StatusHandler: Send {
    fn handle(&mut self, task: &Task, message: &Message);

    /// A job-level event worth recording, such as a pause.
    fn notice(&mut self, _notice: &str) {}
}

#[derive(Debug, Default)]
pub struct SchedulerReport {
    /// Terminal outcome of every task, in completion order.
    pub outcomes: Vec<(TaskId, Outcome)>,
    pub interrupted: bool,
    pub job_timed_out: bool,
    pub failfast: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task id {0} is used more than once")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Failfast,
    JobTimeout,
    Interrupted,
}

impl Stop {
    fn skip_reason(self) -> &'static str {
        match self {
            Stop::Failfast => FAILFAST_REASON,
            Stop::JobTimeout => JOB_TIMEOUT_SKIP_REASON,
            Stop::Interrupted => INTERRUPTED_SKIP_REASON,
        }
    }
}

struct Termination {
    at: Instant,
    reason: &'static str,
}

struct Running {
    deadline: Option<Instant>,
    started: bool,
    /// Messages that arrived before `started`.
    pending: Vec<Message>,
    terminate: Option<Termination>,
    gone_since: Option<Instant>,
}

enum State {
    /// Waiting on dependencies.
    Waiting,
    Ready,
    Running(Box<Running>),
    /// Finished, but the isolation unit has not exited yet.
    Reaping { since: Instant, killed: bool },
    Done,
}

struct Slot {
    task: Task,
    state: State,
    outcome: Option<Outcome>,
}

pub struct Scheduler<'a> {
    config: SchedulerConfig,
    spawner: &'a dyn Spawner,
    server: &'a mut StatusServer,
    handler: &'a mut dyn StatusHandler,
    env: Vec<(OsString, OsString)>,
    slots: Vec<Slot>,
    index: FnvHashMap<TaskId, usize>,
    stop: Option<Stop>,
    paused_at: Option<Instant>,
    job_deadline: Option<Instant>,
    report: SchedulerReport,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: SchedulerConfig,
        spawner: &'a dyn Spawner,
        server: &'a mut StatusServer,
        handler: &'a mut dyn StatusHandler,
    ) -> Self {
        let mut config = config;
        config.max_parallel_tasks = config.max_parallel_tasks.max(1);
        Self {
            config,
            spawner,
            server,
            handler,
            env: Vec::new(),
            slots: Vec::new(),
            index: Default::default(),
            stop: None,
            paused_at: None,
            job_deadline: None,
            report: SchedulerReport::default(),
        }
    }

    /// Environment handed to every spawned runner.
    pub fn with_env(mut self, env: Vec<(OsString, OsString)>) -> Self {
        self.env = env;
        self
    }

    /// Runs `tasks` to completion. Tasks are admitted in the given order
    /// once their dependencies have passed.
    pub async fn run(
        mut self,
        tasks: Vec<Task>,
        mut commands: Option<mpsc::UnboundedReceiver<SchedulerCommand>>,
    ) -> Result<SchedulerReport, SchedulerError> {
        self.load(tasks)?;
        self.job_deadline = self.config.job_timeout.map(|t| Instant::now() + t);
        let ctx = SpawnContext {
            sender: self.server.sender(),
            status_uri: self.server.uri(),
            env: self.env.clone(),
        };
        tracing::debug!(
            tasks = self.slots.len(),
            max_parallel = self.config.max_parallel_tasks,
            "scheduler starting"
        );

        loop {
            if let Some(commands) = commands.as_mut() {
                while let Ok(command) = commands.try_recv() {
                    self.apply(command).await;
                }
            }
            self.check_job_timeout().await;
            if let Some(stop) = self.stop {
                self.skip_unstarted(stop);
            }
            if self.paused_at.is_none() && self.stop.is_none() {
                self.admit(&ctx).await;
            }
            self.drain().await;
            if self.paused_at.is_none() {
                self.check_running().await;
            }
            self.check_reaping().await;

            if self
                .slots
                .iter()
                .all(|s| matches!(s.state, State::Done | State::Reaping { .. }))
            {
                break;
            }
        }

        self.reap_all().await;
        Ok(self.report)
    }

    fn load(&mut self, tasks: Vec<Task>) -> Result<(), SchedulerError> {
        for (i, task) in tasks.iter().enumerate() {
            if self.index.insert(task.id.clone(), i).is_some() {
                return Err(SchedulerError::DuplicateTask(task.id.to_string()));
            }
        }
        for task in &tasks {
            let unknown = task
                .dependencies
                .iter()
                .find(|d| !self.index.contains_key(*d));
            if let Some(dependency) = unknown {
                return Err(SchedulerError::UnknownDependency {
                    task: task.id.to_string(),
                    dependency: dependency.to_string(),
                });
            }
        }
        self.slots = tasks
            .into_iter()
            .map(|task| Slot {
                state: if task.dependencies.is_empty() {
                    State::Ready
                } else {
                    State::Waiting
                },
                task,
                outcome: None,
            })
            .collect();
        Ok(())
    }

    fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, State::Running(_)))
            .count()
    }

    async fn admit(&mut self, ctx: &SpawnContext) {
        let mut running = self.running_count();
        for i in 0..self.slots.len() {
            if running >= self.config.max_parallel_tasks {
                break;
            }
            if !matches!(self.slots[i].state, State::Ready) {
                continue;
            }

            if self.config.dry_run {
                self.publish_terminal(i, Finished::with_reason(Outcome::Cancel, DRY_RUN_REASON));
                continue;
            }

            let task = &self.slots[i].task;
            self.server.register_task(&task.id);
            match self.spawner.spawn(task, ctx).await {
                Ok(()) => {
                    tracing::debug!(task = %task.id, "task spawned");
                    let now = Instant::now();
                    self.slots[i].state = State::Running(Box::new(Running {
                        deadline: self.config.task_timeout.map(|t| now + t),
                        started: false,
                        pending: Vec::new(),
                        terminate: None,
                        gone_since: None,
                    }));
                    running += 1;
                }
                Err(err) => {
                    tracing::warn!(task = %task.id, %err, "spawn failed");
                    self.server.unregister_task(&task.id);
                    self.publish_terminal(
                        i,
                        Finished::with_reason(Outcome::Error, format!("spawn failed: {err}")),
                    );
                }
            }
        }
    }

    async fn drain(&mut self) {
        let mut handled = 0;
        while handled < DRAIN_BATCH {
            let Some(message) = self.server.try_recv() else {
                break;
            };
            self.dispatch(message);
            handled += 1;
        }
        if handled == 0 {
            if let Some(message) = self.server.recv_timeout(self.config.interval).await {
                self.dispatch(message);
            }
        }
    }

    fn dispatch(&mut self, message: Message) {
        let Some(&i) = message.task_id.as_deref().and_then(|id| self.index.get(id)) else {
            tracing::debug!(task = ?message.task_id, "message for unknown task dropped");
            return;
        };
        let slot = &mut self.slots[i];
        let State::Running(running) = &mut slot.state else {
            tracing::trace!(task = %slot.task.id, kind = message.type_name(), "late message dropped");
            return;
        };

        if let Some(finished) = message.as_finished() {
            let finished = finished.clone();
            self.publish_terminal(i, finished);
            return;
        }

        if let MessageKind::Started { timeout } = message.kind {
            if running.started {
                return;
            }
            running.started = true;
            if let Some(timeout) = timeout.filter(|t| t.is_finite() && *t >= 0.0) {
                let reported = Instant::now() + Duration::from_secs_f64(timeout);
                running.deadline = Some(match running.deadline {
                    Some(deadline) => deadline.min(reported),
                    None => reported,
                });
            }
            self.handler.handle(&slot.task, &message);
            for pending in running.pending.drain(..) {
                self.handler.handle(&slot.task, &pending);
            }
        } else if running.started {
            self.handler.handle(&slot.task, &message);
        } else {
            running.pending.push(message);
        }
    }

    /// Delivers the terminal status of task `i`, synthesizing whatever
    /// part of its stream is missing, and moves it out of the running set.
    fn publish_terminal(&mut self, i: usize, mut finished: Finished) {
        let slot = &mut self.slots[i];
        let id = slot.task.id.clone();
        let previous = std::mem::replace(&mut slot.state, State::Done);

        let mut was_spawned = false;
        match previous {
            State::Running(running) => {
                was_spawned = true;
                if !running.started {
                    self.handler
                        .handle(&slot.task, &Message::started().with_task_id(id.as_str()));
                    for pending in &running.pending {
                        self.handler.handle(&slot.task, pending);
                    }
                }
                if let Some(termination) = &running.terminate {
                    if finished.result == Outcome::Interrupted {
                        finished.fail_reason = Some(termination.reason.to_string());
                    }
                }
            }
            State::Waiting | State::Ready => {
                self.handler
                    .handle(&slot.task, &Message::started().with_task_id(id.as_str()));
            }
            State::Reaping { .. } | State::Done => {
                slot.state = previous;
                return;
            }
        }

        tracing::debug!(task = %id, result = %finished.result, "task finished");
        let result = finished.result;
        self.handler
            .handle(&slot.task, &Message::finished(finished).with_task_id(id.as_str()));
        slot.outcome = Some(result);
        if was_spawned {
            self.server.unregister_task(&id);
            slot.state = State::Reaping {
                since: Instant::now(),
                killed: false,
            };
        }
        let is_test = slot.task.is_test();
        self.report.outcomes.push((id, result));

        if self.config.failfast && is_test && result.is_failure() && self.stop.is_none() {
            tracing::info!("failfast: not starting any further tasks");
            self.stop = Some(Stop::Failfast);
            self.report.failfast = true;
        }
        self.release_dependents();
    }

    /// Moves waiting tasks whose dependencies are all done to ready, or
    /// skips them when a dependency did not pass.
    fn release_dependents(&mut self) {
        loop {
            let mut changed = false;
            for i in 0..self.slots.len() {
                if !matches!(self.slots[i].state, State::Waiting) {
                    continue;
                }
                let mut failed = None;
                let mut all_done = true;
                for dependency in &self.slots[i].task.dependencies {
                    let dep = &self.slots[self.index[dependency]];
                    match dep.outcome {
                        None => all_done = false,
                        Some(Outcome::Pass) => {}
                        Some(Outcome::Cancel) if self.config.dry_run => {}
                        Some(outcome) => {
                            failed.get_or_insert((dependency.clone(), outcome));
                        }
                    }
                }
                if let Some((dependency, outcome)) = failed {
                    self.publish_terminal(
                        i,
                        Finished::with_reason(
                            Outcome::Skip,
                            format!(
                                "Test skipped: dependency {dependency} ended {}",
                                outcome.status()
                            ),
                        ),
                    );
                    changed = true;
                } else if all_done {
                    self.slots[i].state = State::Ready;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn skip_unstarted(&mut self, stop: Stop) {
        for i in 0..self.slots.len() {
            if matches!(self.slots[i].state, State::Waiting | State::Ready) {
                self.publish_terminal(i, Finished::with_reason(Outcome::Skip, stop.skip_reason()));
            }
        }
    }

    async fn terminate_running(&mut self, reason: &'static str) {
        let now = Instant::now();
        for slot in &mut self.slots {
            if let State::Running(running) = &mut slot.state {
                if running.terminate.is_none() {
                    self.spawner.terminate_task(&slot.task).await;
                    running.terminate = Some(Termination { at: now, reason });
                }
            }
        }
    }

    async fn apply(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::TogglePause => {
                if let Some(paused_at) = self.paused_at.take() {
                    self.resume(paused_at.elapsed()).await;
                } else {
                    for slot in &self.slots {
                        if matches!(slot.state, State::Running(_)) {
                            self.spawner.pause_task(&slot.task).await;
                        }
                    }
                    self.paused_at = Some(Instant::now());
                    self.handler.notice("Job paused");
                    tracing::info!("job paused");
                }
            }
            SchedulerCommand::Interrupt => {
                if let Some(paused_at) = self.paused_at.take() {
                    self.resume(paused_at.elapsed()).await;
                }
                if self.stop == Some(Stop::Interrupted) {
                    // Second request: stop waiting for graceful shutdowns.
                    let expired = Instant::now()
                        .checked_sub(self.config.soft_to_hard)
                        .unwrap_or_else(Instant::now);
                    for slot in &mut self.slots {
                        if let State::Running(running) = &mut slot.state {
                            if let Some(termination) = &mut running.terminate {
                                termination.at = expired;
                            }
                        }
                    }
                    return;
                }
                tracing::info!("job interrupted; terminating running tasks");
                self.stop = Some(Stop::Interrupted);
                self.report.interrupted = true;
                self.terminate_running(INTERRUPTED_REASON).await;
            }
        }
    }

    /// Continues paused tasks, shifting every deadline by the time spent paused.
    async fn resume(&mut self, paused_for: Duration) {
        for slot in &mut self.slots {
            if let State::Running(running) = &mut slot.state {
                self.spawner.resume_task(&slot.task).await;
                if let Some(deadline) = &mut running.deadline {
                    *deadline += paused_for;
                }
                if let Some(termination) = &mut running.terminate {
                    termination.at += paused_for;
                }
            }
        }
        if let Some(deadline) = &mut self.job_deadline {
            *deadline += paused_for;
        }
        self.handler.notice("Job resumed");
        tracing::info!("job resumed");
    }

    async fn check_job_timeout(&mut self) {
        let Some(deadline) = self.job_deadline else {
            return;
        };
        if self.paused_at.is_some() || Instant::now() < deadline || self.report.job_timed_out {
            return;
        }
        tracing::info!("job timeout reached; terminating running tasks");
        self.report.job_timed_out = true;
        self.stop.get_or_insert(Stop::JobTimeout);
        self.terminate_running(TIMEOUT_REASON).await;
    }

    async fn check_running(&mut self) {
        let now = Instant::now();
        for i in 0..self.slots.len() {
            let slot = &mut self.slots[i];
            let State::Running(running) = &mut slot.state else {
                continue;
            };

            if running.terminate.is_none() && running.deadline.map_or(false, |d| now >= d) {
                tracing::info!(task = %slot.task.id, "task timeout reached; terminating");
                self.spawner.terminate_task(&slot.task).await;
                running.terminate = Some(Termination {
                    at: now,
                    reason: TIMEOUT_REASON,
                });
                continue;
            }

            if let Some(termination) = &running.terminate {
                if now.duration_since(termination.at) >= self.config.soft_to_hard {
                    tracing::warn!(task = %slot.task.id, "task did not terminate in time; killing");
                    let reason = termination.reason;
                    self.spawner.kill_task(&slot.task).await;
                    self.publish_terminal(i, Finished::with_reason(Outcome::Interrupted, reason));
                    if let State::Reaping { killed, .. } = &mut self.slots[i].state {
                        *killed = true;
                    }
                    continue;
                }
            }

            if self.spawner.is_task_alive(&slot.task) {
                running.gone_since = None;
                continue;
            }
            let gone_since = *running.gone_since.get_or_insert(now);
            if now.duration_since(gone_since) >= self.config.lost_runner_grace {
                let finished = match &running.terminate {
                    Some(termination) => {
                        Finished::with_reason(Outcome::Interrupted, termination.reason)
                    }
                    None => Finished::with_reason(Outcome::Error, LOST_RUNNER_REASON),
                };
                tracing::warn!(task = %slot.task.id, "runner went away without a final status");
                self.publish_terminal(i, finished);
            }
        }
    }

    async fn check_reaping(&mut self) {
        let now = Instant::now();
        for slot in &mut self.slots {
            let State::Reaping { since, killed } = &mut slot.state else {
                continue;
            };
            if !self.spawner.is_task_alive(&slot.task) {
                self.spawner.wait_task(&slot.task).await;
                slot.state = State::Done;
            } else if !*killed && now.duration_since(*since) >= self.config.soft_to_hard {
                tracing::debug!(task = %slot.task.id, "reaping lingering isolation unit");
                self.spawner.kill_task(&slot.task).await;
                *killed = true;
            }
        }
    }

    /// Makes sure no isolation unit outlives the scheduler.
    async fn reap_all(&mut self) {
        for slot in &mut self.slots {
            if let State::Reaping { killed, .. } = slot.state {
                if !killed {
                    self.spawner.kill_task(&slot.task).await;
                }
                let waited =
                    tokio::time::timeout(self.config.soft_to_hard, self.spawner.wait_task(&slot.task))
                        .await;
                if waited.is_err() {
                    tracing::warn!(task = %slot.task.id, "isolation unit did not exit after kill");
                }
                slot.state = State::Done;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spawner::SpawnError;
    use crate::status_server::StatusSender;
    use async_trait::async_trait;
    use avocado_utils::net_protocol::task::TaskCategory;
    use avocado_utils::runnable::Runnable;
    use parking_lot::Mutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Finish(Outcome),
        /// Prints before reporting `started`.
        EarlyOutput,
        /// Never finishes on its own; a cooperative one reports when terminated.
        Hang { cooperative: bool },
        /// Reports a timeout of its own, then hangs cooperatively.
        ReportTimeout(f64),
        /// Exits without a final status.
        Vanish,
        FailSpawn,
    }

    struct Unit {
        behavior: Behavior,
        alive: bool,
        sender: StatusSender,
    }

    /// Stands in for real isolation: every task follows a scripted behavior.
    struct FakeSpawner {
        behaviors: FnvHashMap<String, Behavior>,
        units: Mutex<FnvHashMap<TaskId, Unit>>,
        log: Mutex<Vec<String>>,
    }

    impl FakeSpawner {
        fn new(behaviors: &[(&str, Behavior)]) -> Self {
            Self {
                behaviors: behaviors.iter().map(|(id, b)| (id.to_string(), *b)).collect(),
                units: Default::default(),
                log: Default::default(),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn record(&self, event: &str, task: &Task) {
            self.log.lock().push(format!("{event} {}", task.id));
        }
    }

    #[async_trait]
    impl Spawner for FakeSpawner {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn spawn(&self, task: &Task, ctx: &SpawnContext) -> Result<(), SpawnError> {
            self.record("spawn", task);
            let behavior = self.behaviors[task.id.as_str()];
            let sender = ctx.sender.clone();
            let id = &task.id;
            let alive = match behavior {
                Behavior::FailSpawn => {
                    return Err(SpawnError::Unavailable("no isolation today".to_string()))
                }
                Behavior::Finish(outcome) => {
                    sender.send(id, Message::started()).await;
                    sender.send(id, Message::finished(Finished::new(outcome))).await;
                    false
                }
                Behavior::EarlyOutput => {
                    sender.send(id, Message::stdout(b"early".to_vec())).await;
                    sender.send(id, Message::started()).await;
                    sender
                        .send(id, Message::finished(Finished::new(Outcome::Pass)))
                        .await;
                    false
                }
                Behavior::Hang { .. } => {
                    sender.send(id, Message::started()).await;
                    true
                }
                Behavior::ReportTimeout(timeout) => {
                    sender
                        .send(id, Message::new(MessageKind::Started { timeout: Some(timeout) }))
                        .await;
                    true
                }
                Behavior::Vanish => {
                    sender.send(id, Message::started()).await;
                    false
                }
            };
            self.units.lock().insert(
                task.id.clone(),
                Unit {
                    behavior,
                    alive,
                    sender,
                },
            );
            Ok(())
        }

        fn is_task_alive(&self, task: &Task) -> bool {
            self.units.lock().get(&task.id).map_or(false, |u| u.alive)
        }

        async fn terminate_task(&self, task: &Task) {
            self.record("terminate", task);
            let cooperative = {
                let mut units = self.units.lock();
                let Some(unit) = units.get_mut(&task.id) else {
                    return;
                };
                let cooperative = matches!(
                    unit.behavior,
                    Behavior::Hang { cooperative: true } | Behavior::ReportTimeout(_)
                );
                if cooperative {
                    unit.alive = false;
                    Some(unit.sender.clone())
                } else {
                    None
                }
            };
            if let Some(sender) = cooperative {
                let finished =
                    Finished::with_reason(Outcome::Interrupted, "Test interrupted by SIGTERM");
                sender.send(&task.id, Message::finished(finished)).await;
            }
        }

        async fn kill_task(&self, task: &Task) {
            self.record("kill", task);
            if let Some(unit) = self.units.lock().get_mut(&task.id) {
                unit.alive = false;
            }
        }

        async fn wait_task(&self, task: &Task) {
            self.units.lock().remove(&task.id);
        }

        async fn pause_task(&self, task: &Task) {
            self.record("pause", task);
        }

        async fn resume_task(&self, task: &Task) {
            self.record("resume", task);
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<(String, Message)>,
        notices: Vec<String>,
    }

    impl StatusHandler for Recorder {
        fn handle(&mut self, task: &Task, message: &Message) {
            self.events.push((task.id.to_string(), message.clone()));
        }

        fn notice(&mut self, notice: &str) {
            self.notices.push(notice.to_string());
        }
    }

    impl Recorder {
        fn kinds(&self, id: &str) -> Vec<&'static str> {
            self.events
                .iter()
                .filter(|(task, _)| task == id)
                .map(|(_, m)| m.type_name())
                .collect()
        }

        fn finished(&self, id: &str) -> Finished {
            let mut finished = self
                .events
                .iter()
                .filter(|(task, _)| task == id)
                .filter_map(|(_, m)| m.as_finished().cloned());
            let first = finished.next().expect("task never finished");
            assert!(finished.next().is_none(), "task {id} finished twice");
            first
        }
    }

    fn task(id: &str) -> Task {
        Task::new(TaskId::new(id), Runnable::new("noop", None), TaskCategory::Test)
    }

    fn quick() -> SchedulerConfig {
        SchedulerConfig {
            max_parallel_tasks: 2,
            soft_to_hard: Duration::from_millis(50),
            lost_runner_grace: Duration::from_millis(20),
            ..SchedulerConfig::default()
        }
    }

    async fn run(
        config: SchedulerConfig,
        spawner: &FakeSpawner,
        tasks: Vec<Task>,
        commands: Option<mpsc::UnboundedReceiver<SchedulerCommand>>,
    ) -> (SchedulerReport, Recorder) {
        let mut server = StatusServer::local();
        let mut recorder = Recorder::default();
        let report = Scheduler::new(config, spawner, &mut server, &mut recorder)
            .run(tasks, commands)
            .await
            .unwrap();
        (report, recorder)
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn every_task_finishes_exactly_once() {
        let spawner = FakeSpawner::new(&[
            ("1-a", Behavior::Finish(Outcome::Pass)),
            ("2-b", Behavior::Finish(Outcome::Fail)),
            ("3-c", Behavior::FailSpawn),
        ]);
        let (report, recorder) =
            run(quick(), &spawner, vec![task("1-a"), task("2-b"), task("3-c")], None).await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(recorder.finished("1-a").result, Outcome::Pass);
        assert_eq!(recorder.finished("2-b").result, Outcome::Fail);
        let spawn_failed = recorder.finished("3-c");
        assert_eq!(spawn_failed.result, Outcome::Error);
        assert_eq!(
            spawn_failed.fail_reason.as_deref(),
            Some("spawn failed: no isolation today")
        );
        for id in ["1-a", "2-b", "3-c"] {
            let kinds = recorder.kinds(id);
            assert_eq!(kinds.first(), Some(&"started"));
            assert_eq!(kinds.last(), Some(&"finished"));
        }
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn output_before_started_is_held_back() {
        let spawner = FakeSpawner::new(&[("1-a", Behavior::EarlyOutput)]);
        let (_, recorder) = run(quick(), &spawner, vec![task("1-a")], None).await;
        assert_eq!(recorder.kinds("1-a"), vec!["started", "stdout", "finished"]);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn timeout_lets_a_cooperative_task_report() {
        let spawner = FakeSpawner::new(&[("1-a", Behavior::Hang { cooperative: true })]);
        let config = SchedulerConfig {
            task_timeout: Some(Duration::from_millis(50)),
            soft_to_hard: Duration::from_secs(2),
            ..quick()
        };
        let (_, recorder) = run(config, &spawner, vec![task("1-a")], None).await;

        let finished = recorder.finished("1-a");
        assert_eq!(finished.result, Outcome::Interrupted);
        assert_eq!(finished.fail_reason.as_deref(), Some(TIMEOUT_REASON));
        assert_eq!(spawner.log(), vec!["spawn 1-a", "terminate 1-a"]);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn timeout_kills_an_unresponsive_task() {
        let spawner = FakeSpawner::new(&[("1-a", Behavior::Hang { cooperative: false })]);
        let config = SchedulerConfig {
            task_timeout: Some(Duration::from_millis(50)),
            ..quick()
        };
        let (_, recorder) = run(config, &spawner, vec![task("1-a")], None).await;

        let finished = recorder.finished("1-a");
        assert_eq!(finished.result, Outcome::Interrupted);
        assert_eq!(finished.fail_reason.as_deref(), Some(TIMEOUT_REASON));
        assert_eq!(spawner.log(), vec!["spawn 1-a", "terminate 1-a", "kill 1-a"]);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn timeout_reported_by_the_test_applies() {
        let spawner = FakeSpawner::new(&[("1-a", Behavior::ReportTimeout(0.05))]);
        let (_, recorder) = run(quick(), &spawner, vec![task("1-a")], None).await;
        assert_eq!(recorder.finished("1-a").result, Outcome::Interrupted);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn vanished_runner_is_an_error() {
        let spawner = FakeSpawner::new(&[("1-a", Behavior::Vanish)]);
        let (_, recorder) = run(quick(), &spawner, vec![task("1-a")], None).await;
        let finished = recorder.finished("1-a");
        assert_eq!(finished.result, Outcome::Error);
        assert_eq!(finished.fail_reason.as_deref(), Some(LOST_RUNNER_REASON));
        assert_eq!(recorder.kinds("1-a"), vec!["started", "finished"]);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn dependencies_gate_and_skip() {
        let spawner = FakeSpawner::new(&[
            ("dep-ok", Behavior::Finish(Outcome::Pass)),
            ("dep-bad", Behavior::Finish(Outcome::Fail)),
            ("1-a", Behavior::Finish(Outcome::Pass)),
            ("2-b", Behavior::Finish(Outcome::Pass)),
        ]);
        let dep = |id: &str| {
            Task::new(TaskId::new(id), Runnable::new("noop", None), TaskCategory::Dependency)
        };
        let tasks = vec![
            dep("dep-ok"),
            dep("dep-bad"),
            task("1-a").with_dependencies(vec![TaskId::new("dep-ok")]),
            task("2-b").with_dependencies(vec![TaskId::new("dep-ok"), TaskId::new("dep-bad")]),
        ];
        let (report, recorder) = run(quick(), &spawner, tasks, None).await;

        assert_eq!(recorder.finished("1-a").result, Outcome::Pass);
        let skipped = recorder.finished("2-b");
        assert_eq!(skipped.result, Outcome::Skip);
        assert_eq!(
            skipped.fail_reason.as_deref(),
            Some("Test skipped: dependency dep-bad ended FAIL")
        );
        assert!(!spawner.log().contains(&"spawn 2-b".to_string()));
        let order: Vec<_> = report.outcomes.iter().map(|(id, _)| id.as_str()).collect();
        let position = |id| order.iter().position(|o| *o == id).unwrap();
        assert!(position("dep-ok") < position("1-a"));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn failfast_skips_the_rest() {
        let spawner = FakeSpawner::new(&[
            ("1-a", Behavior::Finish(Outcome::Fail)),
            ("2-b", Behavior::Finish(Outcome::Pass)),
            ("3-c", Behavior::Finish(Outcome::Pass)),
        ]);
        let config = SchedulerConfig {
            max_parallel_tasks: 1,
            failfast: true,
            ..quick()
        };
        let (report, recorder) =
            run(config, &spawner, vec![task("1-a"), task("2-b"), task("3-c")], None).await;

        assert!(report.failfast);
        for id in ["2-b", "3-c"] {
            let finished = recorder.finished(id);
            assert_eq!(finished.result, Outcome::Skip);
            assert_eq!(finished.fail_reason.as_deref(), Some(FAILFAST_REASON));
        }
        assert_eq!(spawner.log(), vec!["spawn 1-a"]);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn dry_run_spawns_nothing() {
        let spawner = FakeSpawner::new(&[("1-a", Behavior::Finish(Outcome::Fail))]);
        let config = SchedulerConfig {
            dry_run: true,
            ..quick()
        };
        let (_, recorder) = run(config, &spawner, vec![task("1-a")], None).await;
        let finished = recorder.finished("1-a");
        assert_eq!(finished.result, Outcome::Cancel);
        assert_eq!(finished.fail_reason.as_deref(), Some(DRY_RUN_REASON));
        assert!(spawner.log().is_empty());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn job_timeout_interrupts_and_skips() {
        let spawner = FakeSpawner::new(&[
            ("1-a", Behavior::Hang { cooperative: true }),
            ("2-b", Behavior::Finish(Outcome::Pass)),
        ]);
        let config = SchedulerConfig {
            max_parallel_tasks: 1,
            job_timeout: Some(Duration::from_millis(50)),
            ..quick()
        };
        let (report, recorder) = run(config, &spawner, vec![task("1-a"), task("2-b")], None).await;

        assert!(report.job_timed_out);
        assert_eq!(recorder.finished("1-a").result, Outcome::Interrupted);
        let skipped = recorder.finished("2-b");
        assert_eq!(skipped.result, Outcome::Skip);
        assert_eq!(skipped.fail_reason.as_deref(), Some(JOB_TIMEOUT_SKIP_REASON));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn interrupt_command_stops_the_job() {
        let spawner = FakeSpawner::new(&[
            ("1-a", Behavior::Hang { cooperative: true }),
            ("2-b", Behavior::Finish(Outcome::Pass)),
        ]);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(SchedulerCommand::Interrupt);
        });
        let config = SchedulerConfig {
            max_parallel_tasks: 1,
            ..quick()
        };
        let (report, recorder) =
            run(config, &spawner, vec![task("1-a"), task("2-b")], Some(rx)).await;

        assert!(report.interrupted);
        let interrupted = recorder.finished("1-a");
        assert_eq!(interrupted.result, Outcome::Interrupted);
        assert_eq!(interrupted.fail_reason.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(
            recorder.finished("2-b").fail_reason.as_deref(),
            Some(INTERRUPTED_SKIP_REASON)
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn pause_and_resume() {
        let spawner = FakeSpawner::new(&[("1-a", Behavior::Hang { cooperative: true })]);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(SchedulerCommand::TogglePause);
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(SchedulerCommand::TogglePause);
        });
        let config = SchedulerConfig {
            task_timeout: Some(Duration::from_millis(200)),
            ..quick()
        };
        let (_, recorder) = run(config, &spawner, vec![task("1-a")], Some(rx)).await;

        assert_eq!(recorder.notices, vec!["Job paused", "Job resumed"]);
        assert_eq!(
            spawner.log(),
            vec!["spawn 1-a", "pause 1-a", "resume 1-a", "terminate 1-a"]
        );
        assert_eq!(recorder.finished("1-a").result, Outcome::Interrupted);
    }

    #[tokio::test]
    async fn rejects_unknown_dependencies() {
        let spawner = FakeSpawner::new(&[]);
        let mut server = StatusServer::local();
        let mut recorder = Recorder::default();
        let result = Scheduler::new(quick(), &spawner, &mut server, &mut recorder)
            .run(
                vec![task("1-a").with_dependencies(vec![TaskId::new("nope")])],
                None,
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::UnknownDependency { .. })));
    }
}
