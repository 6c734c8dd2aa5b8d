mod args;
mod list;
mod logging;
mod signals;

use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::Path;

use anyhow::Context;
use avocado_job::{Job, JobData, JobEnv, JobError, Settings, TestSuite};
use avocado_reporting::output::format_error;
use avocado_resolver::resolve_references;
use avocado_runners::RunnerRegistry;
use avocado_utils::exit::ExitCode;
use avocado_utils::runnable::ConfigMap;
use clap::Parser;
use termcolor::{ColorChoice, StandardStream};

use args::{Cli, Command, ListArgs, RunArgs};
use logging::Show;

/// Name of the suite `avocado run` builds from its references.
const RUN_SUITE: &str = "run";

fn main() -> std::process::ExitCode {
    let Cli {
        config,
        show,
        command,
    } = Cli::parse();

    // The runner installs its own logging and runtime.
    let command = match command {
        Command::Runner { args } => {
            let argv = std::iter::once(OsString::from("avocado runner")).chain(args);
            return avocado_runners::app::main_with_args(argv);
        }
        command => command,
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            report_error(&anyhow::Error::new(err).context("cannot start the async runtime"));
            return ExitCode::FAIL.into();
        }
    };

    let result = runtime.block_on(async {
        match command {
            Command::Run(args) => run(config.as_deref(), &show, args).await,
            Command::List(args) => list(config.as_deref(), &show, args),
            Command::Runner { .. } => unreachable!("handled before the runtime starts"),
        }
    });

    match result {
        Ok(code) => code.into(),
        Err(err) => {
            report_error(&err);
            ExitCode::FAIL.into()
        }
    }
}

fn report_error(err: &dyn std::fmt::Display) {
    let mut stderr = StandardStream::stderr(color_choice(std::io::stderr().is_terminal()));
    let _ = format_error(&mut stderr, &format!("avocado: {err:#}"));
}

fn color_choice(is_terminal: bool) -> ColorChoice {
    if is_terminal {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    }
}

/// The command line `--show` wins over the `output.show` setting.
fn show_from(cli: &[String], settings: &Settings) -> anyhow::Result<Show> {
    if cli.is_empty() {
        Show::parse(&settings.output.show)
    } else {
        Show::parse(cli)
    }
}

async fn run(config: Option<&Path>, show: &[String], args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut settings = Settings::load(config)?;
    args.apply(&mut settings);
    settings.validate()?;
    let show = show_from(show, &settings)?;

    let suite = TestSuite::from_references(
        RUN_SUITE,
        ConfigMap::new(),
        &args.references,
        &settings.resolver_registry(),
        settings.run.ignore_missing_references,
    )?;
    let jobdata = JobData {
        references: args.references.clone(),
        args: serde_json::to_value(&args)?,
        cmdline: std::env::args().collect(),
    };

    let mut job = Job::new(settings, vec![suite], &RunnerRegistry::with_builtin())?
        .with_jobdata(jobdata);
    job.setup().await?;
    let _log_guard = logging::init(&show, job.job_log().as_deref())?;
    tracing::info!(job_id = job.unique_id(), references = ?args.references, "job starting");

    let exe = std::env::current_exe().context("cannot locate the avocado executable")?;
    let (signals, commands) = signals::forward_to_scheduler()?;
    let env = JobEnv {
        runner_command: vec![exe.into_os_string(), OsString::from("runner")],
        commands: Some(commands),
        console: show
            .app
            .then(|| color_choice(std::io::stdout().is_terminal())),
    };

    let outcome = job.run(env).await;
    signals.close();
    job.cleanup().await;

    match outcome {
        Ok(outcome) => Ok(outcome.exit_code),
        Err(error) => {
            let code = exit_code_for(&error);
            let error = anyhow::Error::new(error);
            tracing::error!(error = %format!("{error:#}"), "job failed");
            report_error(&error);
            Ok(code)
        }
    }
}

/// Configuration problems found while starting the job are reported like
/// any other bad configuration; anything else failed the job itself.
fn exit_code_for(error: &JobError) -> ExitCode {
    match error {
        JobError::Settings(_) | JobError::NoStatusServer(_) => ExitCode::FAIL,
        _ => ExitCode::JOB_FAIL,
    }
}

fn list(config: Option<&Path>, show: &[String], args: ListArgs) -> anyhow::Result<ExitCode> {
    let settings = Settings::load(config)?;
    settings.validate()?;
    let _log_guard = logging::init(&show_from(show, &settings)?, None)?;

    let resolved = resolve_references(&settings.resolver_registry(), &args.references, true)?;
    let mut stdout = StandardStream::stdout(color_choice(std::io::stdout().is_terminal()));
    list::render(&mut stdout, &resolved.resolutions, args.verbose)?;
    Ok(ExitCode::ALL_OK)
}
