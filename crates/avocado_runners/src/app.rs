//! The `avocado-runner` application: runs runnables out of process.

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use avocado_utils::exit::ExitCode;
use avocado_utils::net_protocol::messages::Finished;
use avocado_utils::net_protocol::task::{TaskAuth, TaskRecipe, STATUS_SERVER_URI_ENV};
use avocado_utils::runnable::Runnable;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::interrupt::on_termination_signals;
use crate::sink::StatusWriter;
use crate::{run_runnable, MessageSink, RunContext, RunnerRegistry};

/// Commands the application understands, as listed by `capabilities`.
pub const COMMANDS: &[&str] = &["capabilities", "runnable-run", "runnable-run-recipe", "task-run"];

/// Environment variable holding the log filter for runner processes.
pub const LOG_ENV: &str = "AVOCADO_LOG";

/// Runs avocado runnables and reports their messages
#[derive(Parser)]
#[clap(name = "avocado-runner", version)]
pub struct RunnerCli {
    #[clap(subcommand)]
    pub command: RunnerCommand,
}

#[derive(Subcommand)]
pub enum RunnerCommand {
    /// Prints the runnable kinds, commands and configuration keys supported, as JSON.
    Capabilities,
    /// Runs a runnable described on the command line; messages go to stdout.
    RunnableRun {
        /// Kind of runnable.
        #[clap(short = 'k', long)]
        kind: String,
        /// URI of the runnable.
        #[clap(short = 'u', long)]
        uri: Option<String>,
        /// Positional argument handed to the runnable. May be repeated.
        #[clap(short = 'a', long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
        /// Keyword arguments in KEY=VALUE form.
        kwargs: Vec<String>,
    },
    /// Runs a runnable from a JSON recipe file; messages go to stdout.
    RunnableRunRecipe {
        /// Path to the recipe.
        recipe: PathBuf,
    },
    /// Runs a task recipe; messages go to its status servers, or stdout when it has none.
    TaskRun {
        /// Path to the task recipe. Read from stdin when omitted.
        #[clap(long)]
        recipe: Option<PathBuf>,
    },
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // Another subscriber may already be installed when embedded in the avocado binary.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Entry point shared by the standalone binary and `avocado runner`.
pub fn main_with_args<I, T>(args: I) -> std::process::ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    init_logging();
    let cli = RunnerCli::parse_from(args);
    match run(cli.command) {
        Ok(code) => code.into(),
        Err(err) => {
            eprintln!("avocado-runner: {err:#}");
            ExitCode::FAIL.into()
        }
    }
}

fn parse_kwargs(kwargs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    kwargs
        .iter()
        .map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("keyword argument {kv:?} is not in KEY=VALUE form"))
        })
        .collect()
}

pub fn run(command: RunnerCommand) -> anyhow::Result<ExitCode> {
    let registry = RunnerRegistry::with_builtin();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the runner runtime")?;

    match command {
        RunnerCommand::Capabilities => {
            let capabilities = serde_json::to_string(&registry.capabilities())?;
            println!("{capabilities}");
            Ok(ExitCode::ALL_OK)
        }
        RunnerCommand::RunnableRun {
            kind,
            uri,
            args,
            kwargs,
        } => {
            let runnable = Runnable::new(kind, uri)
                .with_args(args)
                .with_kwargs(parse_kwargs(&kwargs)?.into_iter().collect());
            runtime.block_on(run_to(&registry, &runnable, None, StatusWriter::stdout()))
        }
        RunnerCommand::RunnableRunRecipe { recipe } => {
            let runnable = Runnable::from_recipe_str(
                &std::fs::read_to_string(&recipe)
                    .with_context(|| format!("cannot read {}", recipe.display()))?,
            )?;
            runtime.block_on(run_to(&registry, &runnable, None, StatusWriter::stdout()))
        }
        RunnerCommand::TaskRun { recipe } => {
            let contents = match recipe {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                None => {
                    let mut contents = String::new();
                    std::io::stdin()
                        .read_to_string(&mut contents)
                        .context("cannot read the task recipe from stdin")?;
                    contents
                }
            };
            let mut task: TaskRecipe =
                serde_json::from_str(&contents).context("invalid task recipe")?;
            if task.status_uris.is_empty() {
                if let Ok(uri) = std::env::var(STATUS_SERVER_URI_ENV) {
                    task.status_uris.push(uri);
                }
            }

            runtime.block_on(async {
                let writer = if task.status_uris.is_empty() {
                    StatusWriter::stdout()
                } else {
                    let auth = TaskAuth {
                        task_id: task.id.clone(),
                        job_id: task.job_id.clone(),
                    };
                    StatusWriter::connect(&task.status_uris, &auth)
                        .await
                        .context("cannot reach any status server")?
                };
                run_to(&registry, &task.runnable, Some(task.id.clone()), writer).await
            })
        }
    }
}

/// Runs `runnable`, relaying every message to `writer`.
async fn run_to(
    registry: &RunnerRegistry,
    runnable: &Runnable,
    task_id: Option<String>,
    mut writer: StatusWriter,
) -> anyhow::Result<ExitCode> {
    let interrupt = on_termination_signals().context("cannot install signal handlers")?;
    let (sink, mut rx) = MessageSink::channel(task_id);

    let relay = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            writer.write(&message).await;
            if message.as_finished().is_some() {
                break;
            }
        }
    });

    let finished = run_runnable(registry, runnable, &RunContext::new(interrupt), &sink).await;
    drop(sink);
    relay.await.context("message relay failed")?;

    Ok(exit_code(&finished))
}

fn exit_code(finished: &Finished) -> ExitCode {
    if finished.result.is_failure() {
        ExitCode::TESTS_FAIL
    } else {
        ExitCode::ALL_OK
    }
}
