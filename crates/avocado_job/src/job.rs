//! A job runs one or more suites and leaves a job directory behind.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use avocado_html::HtmlReporter;
use avocado_json::JsonReporter;
use avocado_reporting::aggregator::{
    AggregateSummary, DEPENDENCIES_DIR, JOB_LOG, TEST_RESULTS_DIR,
};
use avocado_reporting::output::{
    format_job_header, format_job_time, format_report_path, format_results_line,
};
use avocado_reporting::{Aggregator, AggregatorConfig, Counters, Destination, ReportTarget, Reporter};
use avocado_runners::RunnerRegistry;
use avocado_tap::TapReporter;
use avocado_tmt::TmtReporter;
use avocado_utils::exit::ExitCode;
use avocado_utils::net_protocol::task::TaskCategory;
use avocado_utils::runnable::ConfigMap;
use avocado_utils::time::EpochSeconds;
use avocado_workers::spawner::{self, Spawner};
use avocado_workers::{
    Scheduler, SchedulerCommand, SchedulerConfig, SchedulerError, SchedulerReport, StatusServer,
    StatusServerError, Task, TaskId,
};
use avocado_xunit::XunitReporter;
use termcolor::{ColorChoice, StandardStream};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::jobdata::{self, JobData};
use crate::settings::{Settings, SettingsError};
use crate::suite::TestSuite;
use crate::sysinfo::{self, Phase};

pub const LATEST_LINK: &str = "latest";
pub const ID_FILE: &str = "id";
/// Directory shared by every test of a job.
pub const COMMON_TMPDIR_ENV: &str = "AVOCADO_TESTS_COMMON_TMPDIR";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("suite name {0:?} is used more than once")]
    DuplicateSuite(String),
    #[error("no tests found in any suite")]
    NoTests,
    #[error("suite {suite:?} holds a runnable of kind {kind:?}, which no runner handles")]
    UnknownRunner { suite: String, kind: String },
    #[error("cannot create a job directory under {}", dir.display())]
    Logdir { dir: PathBuf, source: io::Error },
    #[error("the {0} spawner needs a network status server, but picking one automatically is disabled")]
    NoStatusServer(&'static str),
    #[error("job was run before being set up")]
    NotSetUp,
    #[error(transparent)]
    StatusServer(#[from] StatusServerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What the process hosting a job provides to it.
pub struct JobEnv {
    /// Program and leading arguments that start a runner.
    pub runner_command: Vec<OsString>,
    pub commands: Option<mpsc::UnboundedReceiver<SchedulerCommand>>,
    /// Prints the human job summary on stdout when set.
    pub console: Option<ColorChoice>,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub exit_code: ExitCode,
    pub summary: AggregateSummary,
    pub report: SchedulerReport,
}

pub struct Job {
    unique_id: String,
    settings: Settings,
    config: ConfigMap,
    scheduler: SchedulerConfig,
    aggregator: AggregatorConfig,
    suites: Vec<TestSuite>,
    jobdata: JobData,
    logdir: Option<PathBuf>,
    tmpdir: Option<tempfile::TempDir>,
    common_tmpdir: Option<OsString>,
    time_start: Option<EpochSeconds>,
    time_end: Option<EpochSeconds>,
    exitcode: Option<ExitCode>,
}

impl Job {
    /// Validates `settings` and `suites`. Nothing is written to disk until
    /// [Job::setup].
    pub fn new(
        settings: Settings,
        mut suites: Vec<TestSuite>,
        runners: &RunnerRegistry,
    ) -> Result<Self, JobError> {
        settings.validate()?;
        let scheduler = settings.scheduler_config()?;
        let aggregator = settings.aggregator_config()?;

        let mut names = HashSet::new();
        if let Some(duplicate) = suites.iter().find(|s| !names.insert(s.name.clone())) {
            return Err(JobError::DuplicateSuite(duplicate.name.clone()));
        }
        if suites.iter().all(|s| s.tests.is_empty()) {
            return Err(JobError::NoTests);
        }

        let config = settings.flatten();
        for suite in &mut suites {
            suite.merge_config(&config);
            if let Err(kind) = suite.configure_runnables(runners) {
                return Err(JobError::UnknownRunner {
                    suite: suite.name.clone(),
                    kind,
                });
            }
        }

        Ok(Self {
            unique_id: uuid::Uuid::new_v4().to_string(),
            settings,
            config,
            scheduler,
            aggregator,
            suites,
            jobdata: JobData::default(),
            logdir: None,
            tmpdir: None,
            common_tmpdir: None,
            time_start: None,
            time_end: None,
            exitcode: None,
        })
    }

    pub fn with_jobdata(mut self, jobdata: JobData) -> Self {
        self.jobdata = jobdata;
        self
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn suites(&self) -> &[TestSuite] {
        &self.suites
    }

    pub fn logdir(&self) -> Option<&Path> {
        self.logdir.as_deref()
    }

    pub fn job_log(&self) -> Option<PathBuf> {
        self.logdir.as_ref().map(|dir| dir.join(JOB_LOG))
    }

    pub fn exitcode(&self) -> Option<ExitCode> {
        self.exitcode
    }

    pub fn time_elapsed(&self) -> Option<f64> {
        Some(self.time_end?.since(self.time_start?))
    }

    /// Creates the job directory, the `latest` link, the job data and the
    /// job's temporary directory, and collects sysinfo.
    #[tracing::instrument(level = "debug", skip(self), fields(job_id = %self.unique_id))]
    pub async fn setup(&mut self) -> Result<PathBuf, JobError> {
        let time_start = EpochSeconds::now();
        let results_dir = self.settings.results_dir()?;
        let logdir = create_logdir(&results_dir, &self.unique_id, time_start).map_err(|source| {
            JobError::Logdir {
                dir: results_dir.clone(),
                source,
            }
        })?;
        update_latest_link(&logdir);

        fs::write(logdir.join(ID_FILE), format!("{}\n", self.unique_id))?;
        jobdata::write(&logdir, &self.jobdata, &self.config, &self.suites)?;

        let tmpdir = tempfile::Builder::new().prefix("avocado_job_").tempdir()?;
        self.common_tmpdir = Some(match std::env::var_os(COMMON_TMPDIR_ENV) {
            Some(preset) => preset,
            None => {
                let common = tmpdir.path().join("common");
                fs::create_dir_all(&common)?;
                common.into_os_string()
            }
        });
        self.tmpdir = Some(tmpdir);

        if self.settings.sysinfo.enabled {
            let timeout = self.settings.sysinfo_timeout()?;
            sysinfo::collect(&logdir, Phase::Pre, &self.settings.sysinfo, timeout).await?;
        }

        tracing::info!(logdir = %logdir.display(), "job directory ready");
        self.time_start = Some(time_start);
        self.logdir = Some(logdir.clone());
        Ok(logdir)
    }

    /// Runs every suite to completion and computes the exit code.
    pub async fn run(&mut self, env: JobEnv) -> Result<JobOutcome, JobError> {
        let JobEnv {
            runner_command,
            commands,
            console,
        } = env;
        let spawner = spawner::by_name(
            &self.settings.spawner.name,
            runner_command,
            self.settings.podman_config(),
        )
        .ok_or_else(|| SettingsError::UnknownSpawner(self.settings.spawner.name.clone()))?;
        self.run_with_spawner(spawner.as_ref(), commands, console)
            .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = %self.unique_id, spawner = spawner.name()))]
    pub async fn run_with_spawner(
        &mut self,
        spawner: &dyn Spawner,
        commands: Option<mpsc::UnboundedReceiver<SchedulerCommand>>,
        console: Option<ColorChoice>,
    ) -> Result<JobOutcome, JobError> {
        let logdir = self.logdir.clone().ok_or(JobError::NotSetUp)?;
        let mut server = self.status_server(spawner).await?;

        let tasks = self.tasks(&logdir);
        let total_tests = tasks.iter().filter(|t| t.is_test()).count();
        tracing::info!(tests = total_tests, tasks = tasks.len(), "running job");

        let mut out = console.map(StandardStream::stdout);
        if let Some(out) = out.as_mut() {
            let _ = format_job_header(out, &self.unique_id, &logdir.join(JOB_LOG));
        }

        let mut aggregator = Aggregator::new(
            self.unique_id.clone(),
            &logdir,
            total_tests,
            self.aggregator.clone(),
        )?
        .with_targets(self.report_targets());
        if let Some(choice) = console {
            aggregator = aggregator.with_console(Box::new(StandardStream::stdout(choice)));
        }

        let report = Scheduler::new(
            self.scheduler.clone(),
            spawner,
            &mut server,
            &mut aggregator,
        )
        .with_env(self.task_env())
        .run(tasks, commands)
        .await;
        let summary = aggregator.finish();
        let report = report?;

        let exit_code = exit_code(&summary.counters, &report);
        let time_end = EpochSeconds::now();
        self.time_end = Some(time_end);
        self.exitcode = Some(exit_code);
        tracing::info!(code = exit_code.get(), "job finished");

        if let Some(out) = out.as_mut() {
            let _ = format_results_line(out, &summary.counters);
            if let Some(html) = &self.settings.output.html {
                let _ = format_report_path(out, "html", html);
            }
            let elapsed = time_end.since(self.time_start.unwrap_or(time_end));
            let _ = format_job_time(out, elapsed);
        }

        Ok(JobOutcome {
            exit_code,
            summary,
            report,
        })
    }

    /// Collects post-job sysinfo and removes the temporary directory
    /// unless it is to be kept.
    pub async fn cleanup(&mut self) {
        if let (Some(logdir), true) = (&self.logdir, self.settings.sysinfo.enabled) {
            if let Ok(timeout) = self.settings.sysinfo_timeout() {
                if let Err(error) =
                    sysinfo::collect(logdir, Phase::Post, &self.settings.sysinfo, timeout).await
                {
                    tracing::warn!(%error, "failed to collect post-job sysinfo");
                }
            }
        }

        if let Some(tmpdir) = self.tmpdir.take() {
            if self.settings.run.keep_tmp {
                let kept = tmpdir.keep();
                tracing::info!(tmpdir = %kept.display(), "keeping job temporary directory");
            } else if let Err(error) = tmpdir.close() {
                tracing::warn!(%error, "failed to remove job temporary directory");
            }
        }
    }

    /// One task per test, preceded by the dependencies it is the first to
    /// need. Identical dependencies are run once per job.
    fn tasks(&self, logdir: &Path) -> Vec<Task> {
        let mut tasks = Vec::new();
        let mut seen_dependencies = HashSet::new();
        let prefix_suites = self.suites.len() > 1;

        for (suite_index, suite) in self.suites.iter().enumerate() {
            let suite_prefix = prefix_suites.then_some((suite_index + 1, suite.name.as_str()));
            for (index, runnable) in suite.tests.iter().enumerate() {
                let mut dependency_ids = Vec::new();
                for dependency in &runnable.dependencies {
                    let id = TaskId::for_dependency(dependency);
                    if seen_dependencies.insert(id.clone()) {
                        let output_dir = logdir.join(DEPENDENCIES_DIR).join(id.fs_safe());
                        let task = Task::new(
                            id.clone(),
                            dependency.clone().with_output_dir(output_dir),
                            TaskCategory::Dependency,
                        )
                        .with_job_id(&self.unique_id);
                        tasks.push(task);
                    }
                    dependency_ids.push(id);
                }

                let id = TaskId::for_test(index + 1, runnable, suite_prefix);
                let output_dir = logdir.join(TEST_RESULTS_DIR).join(id.fs_safe());
                let task = Task::new(
                    id,
                    runnable.clone().with_output_dir(output_dir),
                    TaskCategory::Test,
                )
                .with_job_id(&self.unique_id)
                .with_dependencies(dependency_ids);
                tasks.push(task);
            }
        }
        tasks
    }

    fn task_env(&self) -> Vec<(OsString, OsString)> {
        let mut env = Vec::new();
        if let Some(common) = &self.common_tmpdir {
            env.push((OsString::from(COMMON_TMPDIR_ENV), common.clone()));
        }
        env
    }

    async fn status_server(&self, spawner: &dyn Spawner) -> Result<StatusServer, JobError> {
        let status = &self.settings.status_server;
        let listen = status
            .listen
            .or_else(|| status.uri.as_deref().and_then(|uri| uri.parse().ok()));
        let listen = match listen {
            Some(addr) => Some(addr),
            None if spawner.requires_network_status() => {
                if status.disable_auto {
                    return Err(JobError::NoStatusServer(spawner.name()));
                }
                Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            }
            None => None,
        };

        let server = match listen {
            Some(addr) => StatusServer::bind(addr).await?,
            None => StatusServer::local(),
        };
        Ok(match &status.uri {
            Some(uri) => server.with_advertised_uri(uri.clone()),
            None => server,
        })
    }

    fn report_targets(&self) -> Vec<ReportTarget> {
        let output = &self.settings.output;
        let mut xunit = XunitReporter::default().with_max_output(output.xunit_max_output);
        if let Some(name) = &output.xunit_job_name {
            xunit = xunit.with_suite_name(name.clone());
        }

        let mut targets = vec![
            target(Box::new(JsonReporter), output.json.as_deref()),
            target(Box::new(xunit), output.xunit.as_deref()),
            target(Box::new(TapReporter), output.tap.as_deref()),
            target(Box::new(TmtReporter), output.tmt.as_deref()),
        ];
        if let Some(html) = &output.html {
            let mut html_target = ReportTarget::new(Box::new(HtmlReporter))
                .with_destination(Destination::File(html.clone()));
            html_target.in_logdir = false;
            targets.push(html_target);
        }
        targets
    }
}

fn target(reporter: Box<dyn Reporter>, extra: Option<&str>) -> ReportTarget {
    let target = ReportTarget::new(reporter);
    match extra.map(str::parse::<Destination>) {
        Some(Ok(destination)) => target.with_destination(destination),
        Some(Err(never)) => match never {},
        None => target,
    }
}

/// The exit code of a job whose tests ended as tallied in `counters`.
///
/// FAIL and ERROR set [ExitCode::TESTS_FAIL]; an INTERRUPTED test, or a
/// job stopped by the user or its timeout, sets
/// [ExitCode::JOB_INTERRUPTED]. SKIP, CANCEL and WARN are successes.
pub fn exit_code(counters: &Counters, report: &SchedulerReport) -> ExitCode {
    let mut code = ExitCode::ALL_OK;
    if counters.has_failures() {
        code |= ExitCode::TESTS_FAIL;
    }
    if counters.interrupted > 0 || report.interrupted || report.job_timed_out {
        code |= ExitCode::JOB_INTERRUPTED;
    }
    code
}

/// `job-<timestamp>-<first 7 chars of the id>`, with a numeric suffix
/// if that already exists.
fn create_logdir(results_dir: &Path, unique_id: &str, time: EpochSeconds) -> io::Result<PathBuf> {
    fs::create_dir_all(results_dir)?;
    let results_dir = fs::canonicalize(results_dir)?;
    let short_id: String = unique_id.chars().take(7).collect();
    let base = format!("job-{}-{short_id}", time.format_job_dir());

    let mut attempt = 0;
    loop {
        let name = match attempt {
            0 => base.clone(),
            n => format!("{base}.{n}"),
        };
        let candidate = results_dir.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Points `<results>/latest` at `logdir`. Best effort: a concurrent job
/// may win the race.
fn update_latest_link(logdir: &Path) {
    let (Some(parent), Some(name)) = (logdir.parent(), logdir.file_name()) else {
        return;
    };
    let link = parent.join(LATEST_LINK);
    match fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if let Err(error) = fs::remove_file(&link) {
                tracing::warn!(%error, "cannot replace the latest link");
                return;
            }
        }
        Ok(_) => {
            tracing::warn!(path = %link.display(), "not replacing latest: it is not a symlink");
            return;
        }
        Err(_) => {}
    }
    if let Err(error) = std::os::unix::fs::symlink(name, &link) {
        tracing::warn!(%error, "cannot create the latest link");
    }
}
