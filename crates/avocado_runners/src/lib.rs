//! Runners execute one runnable and report its progress as messages.

pub mod app;
mod avocado_instrumented;
mod capture_output;
mod exec_test;
pub mod interrupt;
mod noop;
mod process;
mod python_unittest;
pub mod sink;
mod tap;
pub mod tap_parser;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avocado_utils::net_protocol::messages::{Finished, Message, MessageKind, Outcome};
use avocado_utils::runnable::Runnable;
use serde_derive::Serialize;
use tokio::sync::mpsc;

pub use avocado_instrumented::AvocadoInstrumentedRunner;
pub use exec_test::ExecTestRunner;
pub use interrupt::{Interrupt, InterruptTrigger};
pub use noop::NoopRunner;
pub use python_unittest::PythonUnittestRunner;
pub use tap::TapRunner;

/// Minimum spacing of `running` heartbeats.
pub const RUNNER_RUN_STATUS_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the channel between a runner and whoever consumes its messages.
const MESSAGE_BUFFER: usize = 1024;

/// The sending half of a runner's message stream.
///
/// Guarantees a single `started` that precedes every other message; a
/// `started` is synthesized if the runner sends something else first.
/// `finished` is never sent through here: runners return it.
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<Message>,
    task_id: Option<Arc<str>>,
    started: Arc<AtomicBool>,
}

impl MessageSink {
    pub fn channel(task_id: Option<String>) -> (MessageSink, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let sink = MessageSink {
            tx,
            task_id: task_id.map(Arc::from),
            started: Arc::new(AtomicBool::new(false)),
        };
        (sink, rx)
    }

    async fn deliver(&self, mut message: Message) {
        if let Some(task_id) = &self.task_id {
            message.task_id = Some(task_id.to_string());
        }
        // A closed receiver means nobody is listening anymore; the run continues regardless.
        let _ = self.tx.send(message).await;
    }

    pub async fn send(&self, message: Message) {
        match &message.kind {
            MessageKind::Started { .. } => {
                if !self.started.swap(true, Ordering::SeqCst) {
                    self.deliver(message).await;
                }
            }
            MessageKind::Finished(_) => {
                tracing::warn!("runner tried to send finished through its sink; ignored");
            }
            _ => {
                self.ensure_started().await;
                self.deliver(message).await;
            }
        }
    }

    pub async fn started(&self, timeout: Option<f64>) {
        self.send(Message::new(MessageKind::Started { timeout }))
            .await;
    }

    async fn ensure_started(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.deliver(Message::started()).await;
        }
    }

    async fn heartbeat(&self) {
        if self.started.load(Ordering::SeqCst) {
            self.deliver(Message::running()).await;
        }
    }

    async fn finish(&self, finished: Finished) {
        self.ensure_started().await;
        self.deliver(Message::finished(finished)).await;
    }
}

/// Context shared with a runner for a single run.
#[derive(Clone)]
pub struct RunContext {
    pub interrupt: Interrupt,
}

impl RunContext {
    pub fn new(interrupt: Interrupt) -> Self {
        Self { interrupt }
    }
}

#[async_trait]
pub trait Runner: Send + Sync {
    fn kind(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Dotted configuration keys this runner reads from [Runnable::config].
    fn configuration_used(&self) -> &'static [&'static str] {
        &[]
    }

    /// Executes the runnable, streaming progress into `sink`, and returns its outcome.
    async fn run(&self, runnable: &Runnable, ctx: &RunContext, sink: &MessageSink) -> Finished;
}

/// Runners available by kind.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<&'static str, Box<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(NoopRunner));
        registry.register(Box::new(ExecTestRunner));
        registry.register(Box::new(TapRunner));
        registry.register(Box::new(PythonUnittestRunner));
        registry.register(Box::new(AvocadoInstrumentedRunner));
        registry
    }

    pub fn register(&mut self, runner: Box<dyn Runner>) {
        self.runners.insert(runner.kind(), runner);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn Runner> {
        self.runners.get(kind).map(Box::as_ref)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.runners.keys().copied()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            runnables: self.kinds().map(str::to_string).collect(),
            commands: app::COMMANDS.iter().map(|c| c.to_string()).collect(),
            configuration_used: self
                .runners
                .iter()
                .map(|(kind, runner)| {
                    let keys = runner
                        .configuration_used()
                        .iter()
                        .map(|k| k.to_string())
                        .collect();
                    (kind.to_string(), keys)
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub runnables: Vec<String>,
    pub commands: Vec<String>,
    pub configuration_used: BTreeMap<String, Vec<String>>,
}

/// Runs `runnable` to completion, emitting heartbeats while it executes.
///
/// The stream observed on the other end of `sink` is always a single
/// `started`, any number of other messages, and exactly one `finished`.
pub async fn run_runnable(
    registry: &RunnerRegistry,
    runnable: &Runnable,
    ctx: &RunContext,
    sink: &MessageSink,
) -> Finished {
    let Some(runner) = registry.get(&runnable.kind) else {
        let finished = Finished::with_reason(
            Outcome::Error,
            format!("no runner for runnable kind {:?}", runnable.kind),
        );
        sink.finish(finished.clone()).await;
        return finished;
    };

    let run = runner.run(runnable, ctx, sink);
    tokio::pin!(run);

    let mut heartbeat = tokio::time::interval(RUNNER_RUN_STATUS_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let finished = loop {
        tokio::select! {
            finished = &mut run => break finished,
            _ = heartbeat.tick() => sink.heartbeat().await,
        }
    };

    tracing::debug!(kind = %runnable.kind, result = %finished.result, "runnable finished");
    sink.finish(finished.clone()).await;
    finished
}

/// First line of an error message, the form used for `fail_reason`.
pub(crate) fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().trim().to_string()
}
