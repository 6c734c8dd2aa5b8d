//! Turns the per-task message streams of a job into on-disk artifacts.
//!
//! Layout under the job directory:
//!
//! ```text
//! test-results/<task-id>/{debug.log,stdout,stderr,whiteboard,status}
//! test-results/by-status/<STATUS>/<task-id> -> ../../<task-id>
//! dependencies/<task-id>/...
//! full.log
//! results.<format>
//! ```
//!
//! Every write is best effort: failures are logged and never stop the job.

use std::collections::hash_map::{Entry, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use avocado_utils::net_protocol::messages::{Finished, Message, MessageKind, Outcome};
use avocado_utils::time::EpochSeconds;
use avocado_workers::{StatusHandler, Task, TaskId};
use termcolor::WriteColor;

use crate::output::{format_notice, format_test_finished, format_test_started};
use crate::{Counters, Destination, JobReport, ReportTarget, ReportingError, TestResult};

pub const TEST_RESULTS_DIR: &str = "test-results";
pub const BY_STATUS_DIR: &str = "by-status";
pub const DEPENDENCIES_DIR: &str = "dependencies";
pub const FULL_LOG: &str = "full.log";
pub const JOB_LOG: &str = "job.log";

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Statuses whose log tail is copied into `full.log`.
    pub interesting: Vec<Outcome>,
    /// How much of the end of `debug.log` is copied, in bytes.
    pub tail_bytes: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interesting: vec![Outcome::Fail, Outcome::Cancel],
            tail_bytes: 4096,
        }
    }
}

struct OpenTest {
    logdir: PathBuf,
    debug: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    whiteboard: Vec<u8>,
    started: EpochSeconds,
    index: usize,
}

/// What is left of a job once the aggregator is finished.
#[derive(Debug)]
pub struct AggregateSummary {
    pub counters: Counters,
    pub results: Vec<TestResult>,
    /// Reports written into the job directory, by format name.
    pub reports: Vec<(&'static str, PathBuf)>,
}

pub struct Aggregator {
    config: AggregatorConfig,
    job_id: String,
    logdir: PathBuf,
    job_log: PathBuf,
    full_log: Option<File>,
    targets: Vec<ReportTarget>,
    console: Option<Box<dyn WriteColor + Send>>,
    open: HashMap<String, OpenTest>,
    results: Vec<TestResult>,
    counters: Counters,
    total_tests: usize,
    started_tests: usize,
    time_start: EpochSeconds,
}

impl Aggregator {
    /// Prepares the job directory for `total_tests` test results.
    pub fn new(
        job_id: impl Into<String>,
        logdir: impl Into<PathBuf>,
        total_tests: usize,
        config: AggregatorConfig,
    ) -> io::Result<Self> {
        let logdir = logdir.into();
        fs::create_dir_all(logdir.join(TEST_RESULTS_DIR).join(BY_STATUS_DIR))?;
        let full_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logdir.join(FULL_LOG))?;

        Ok(Self {
            config,
            job_id: job_id.into(),
            job_log: logdir.join(JOB_LOG),
            logdir,
            full_log: Some(full_log),
            targets: Vec::new(),
            console: None,
            open: HashMap::new(),
            results: Vec::new(),
            counters: Counters::default(),
            total_tests,
            started_tests: 0,
            time_start: EpochSeconds::now(),
        })
    }

    pub fn with_targets(mut self, targets: Vec<ReportTarget>) -> Self {
        self.targets = targets;
        self.write_reports(true);
        self
    }

    /// Sends per-test progress lines to `console`.
    pub fn with_console(mut self, console: Box<dyn WriteColor + Send>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Writes the final form of every report.
    pub fn finish(mut self) -> AggregateSummary {
        for (id, _) in std::mem::take(&mut self.open) {
            tracing::warn!(task = %id, "test never finished; its result is missing");
        }
        self.write_reports(false);
        if let Some(console) = self.console.as_mut() {
            let _ = console.flush();
        }

        let reports = self
            .targets
            .iter()
            .filter(|t| t.in_logdir)
            .map(|t| (t.reporter.name(), self.logdir.join(t.reporter.file_name())))
            .collect();
        AggregateSummary {
            counters: self.counters,
            results: self.results,
            reports,
        }
    }

    fn write_reports(&self, progressive_only: bool) {
        let report = JobReport {
            job_id: &self.job_id,
            logdir: &self.logdir,
            debuglog: &self.job_log,
            results: &self.results,
            counters: &self.counters,
            time_start: self.time_start,
            time_elapsed: EpochSeconds::now().since(self.time_start),
        };
        for target in &self.targets {
            let reporter = &target.reporter;
            if progressive_only && !reporter.progressive() {
                continue;
            }
            let mut destinations = Vec::new();
            if target.in_logdir {
                destinations.push(Destination::File(self.logdir.join(reporter.file_name())));
            }
            if !progressive_only {
                destinations.extend(target.extra.iter().cloned());
            }

            for destination in destinations {
                let written = match &destination {
                    Destination::Stdout => {
                        let stdout = io::stdout();
                        let mut lock = stdout.lock();
                        reporter
                            .render(&report, &mut lock)
                            .and_then(|()| lock.flush().map_err(Into::into))
                    }
                    Destination::File(path) => {
                        write_atomically(path, |out| reporter.render(&report, out))
                    }
                };
                if let Err(error) = written {
                    tracing::error!(
                        format = reporter.name(),
                        ?destination,
                        %error,
                        "failed to write report"
                    );
                }
            }
        }
    }

    fn test_logdir(&self, task: &Task) -> PathBuf {
        if task.is_test() {
            self.logdir.join(TEST_RESULTS_DIR).join(task.id.fs_safe())
        } else {
            self.logdir.join(DEPENDENCIES_DIR).join(task.id.fs_safe())
        }
    }

    fn open_test(&mut self, task: &Task, started: EpochSeconds) -> &mut OpenTest {
        let logdir = self.test_logdir(task);
        match self.open.entry(task.id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                report_io(&task.id, "logdir", fs::create_dir_all(&logdir));
                let create = |name: &str| {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(logdir.join(name));
                    report_io(&task.id, name, file)
                };

                let mut index = 0;
                if task.is_test() {
                    self.started_tests += 1;
                    index = self.started_tests;
                    if let Some(console) = self.console.as_mut() {
                        let name = display_name(task);
                        let _ = format_test_started(console, index, self.total_tests, &name);
                    }
                }
                entry.insert(OpenTest {
                    debug: create("debug.log"),
                    stdout: create("stdout"),
                    stderr: create("stderr"),
                    whiteboard: Vec::new(),
                    started,
                    index,
                    logdir,
                })
            }
        }
    }

    fn finish_test(&mut self, task: &Task, time: EpochSeconds, finished: &Finished) {
        let key = task.id.to_string();
        let Some(mut open) = self.open.remove(&key) else {
            return;
        };
        let status = finished.result.status();

        if let Some(debug) = open.debug.as_mut() {
            let mut tail = Vec::new();
            if let Some(traceback) = &finished.traceback {
                prefix_lines(&mut tail, time, "traceback", traceback.as_bytes());
            }
            let summary = match &finished.fail_reason {
                Some(reason) => format!("{status} {}: {reason}", task.id),
                None => format!("{status} {}", task.id),
            };
            prefix_lines(&mut tail, time, "job", summary.as_bytes());
            report_io(&task.id, "debug.log", debug.write_all(&tail));
        }
        if !open.whiteboard.is_empty() {
            let written = fs::write(open.logdir.join("whiteboard"), &open.whiteboard);
            report_io(&task.id, "whiteboard", written);
        }
        let written = fs::write(open.logdir.join("status"), format!("{status}\n"));
        report_io(&task.id, "status", written);

        if !task.is_test() {
            tracing::debug!(task = %task.id, status, "dependency finished");
            return;
        }

        let linked = link_by_status(&self.logdir, status, &task.id.fs_safe());
        report_io(&task.id, "by-status link", linked);

        let tail = if self.config.interesting.contains(&finished.result) {
            open.debug
                .as_mut()
                .and_then(|debug| read_tail(debug, self.config.tail_bytes).ok())
        } else {
            None
        };
        self.append_full_log(&format!("{}: {status}\n", task.id), tail.as_deref());

        let elapsed = time.since(open.started);
        let name = display_name(task);
        if let Some(console) = self.console.as_mut() {
            let _ = format_test_finished(
                console,
                open.index,
                self.total_tests,
                &name,
                finished.result,
                elapsed,
                finished.fail_reason.as_deref(),
            );
        }

        self.counters.record(finished.result);
        self.results.push(TestResult {
            id: task.id.to_string(),
            name,
            status,
            fail_reason: finished.fail_reason.clone(),
            fail_class: finished.fail_class.clone(),
            traceback: finished.traceback.clone(),
            logfile: open.logdir.join("debug.log"),
            whiteboard: String::from_utf8_lossy(&open.whiteboard).into_owned(),
            logdir: open.logdir,
            time_start: open.started.as_secs(),
            time_end: time.as_secs(),
            time_elapsed: elapsed,
            tags: task.runnable().tags.clone(),
            outcome: finished.result,
        });
        self.write_reports(true);
    }

    fn append_full_log(&mut self, line: &str, tail: Option<&[u8]>) {
        let Some(full_log) = self.full_log.as_mut() else {
            return;
        };
        let mut written = full_log.write_all(line.as_bytes());
        if let Some(tail) = tail {
            written = written.and_then(|()| full_log.write_all(tail));
            if !tail.ends_with(b"\n") {
                written = written.and_then(|()| full_log.write_all(b"\n"));
            }
        }
        if let Err(error) = written {
            tracing::error!(%error, "failed to write full.log");
        }
    }
}

impl StatusHandler for Aggregator {
    fn handle(&mut self, task: &Task, message: &Message) {
        let time = message.time;
        match &message.kind {
            MessageKind::Started { .. } => {
                self.open_test(task, time);
            }
            MessageKind::Running => {}
            MessageKind::Stdout { log } => {
                let open = self.open_test(task, time);
                write_stream(task, &mut open.debug, time, "stdout", log);
                if let Some(stdout) = open.stdout.as_mut() {
                    report_io(&task.id, "stdout", stdout.write_all(log));
                }
            }
            MessageKind::Stderr { log } => {
                let open = self.open_test(task, time);
                write_stream(task, &mut open.debug, time, "stderr", log);
                if let Some(stderr) = open.stderr.as_mut() {
                    report_io(&task.id, "stderr", stderr.write_all(log));
                }
            }
            MessageKind::Log { log, .. } => {
                let open = self.open_test(task, time);
                write_stream(task, &mut open.debug, time, "log", log);
            }
            MessageKind::Whiteboard { log } => {
                self.open_test(task, time).whiteboard = log.clone();
            }
            MessageKind::Finished(finished) => {
                self.finish_test(task, time, finished);
            }
        }
    }

    fn notice(&mut self, notice: &str) {
        self.append_full_log(&format!("{notice}\n"), None);
        if let Some(console) = self.console.as_mut() {
            let _ = format_notice(console, notice);
        }
    }
}

/// How a test is shown to people: its uri and variant, without the job-specific prefix.
pub fn display_name(task: &Task) -> String {
    let runnable = task.runnable();
    let mut name = runnable
        .uri
        .clone()
        .unwrap_or_else(|| runnable.kind.clone());
    if let Some(variant_id) = runnable.variant.as_ref().and_then(|v| v.variant_id.as_deref()) {
        name.push(';');
        name.push_str(variant_id);
    }
    name
}

fn write_stream(
    task: &Task,
    debug: &mut Option<File>,
    time: EpochSeconds,
    stream: &str,
    bytes: &[u8],
) {
    if let Some(debug) = debug.as_mut() {
        let mut buf = Vec::with_capacity(bytes.len() + 64);
        prefix_lines(&mut buf, time, stream, bytes);
        report_io(&task.id, "debug.log", debug.write_all(&buf));
    }
}

/// Appends `bytes` to `out` with every line prefixed by the time and stream.
/// A trailing partial line is terminated.
fn prefix_lines(out: &mut Vec<u8>, time: EpochSeconds, stream: &str, bytes: &[u8]) {
    let prefix = format!("{} [{stream}] ", time.format_log());
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    for line in bytes.split(|b| *b == b'\n') {
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(line);
        out.push(b'\n');
    }
}

fn read_tail(file: &mut File, max: usize) -> io::Result<Vec<u8>> {
    let len = file.seek(SeekFrom::End(0))?;
    let start = len.saturating_sub(max as u64);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::new();
    file.take(max as u64).read_to_end(&mut tail)?;
    file.seek(SeekFrom::End(0))?;
    Ok(tail)
}

fn link_by_status(logdir: &Path, status: &str, name: &str) -> io::Result<()> {
    let dir = logdir.join(TEST_RESULTS_DIR).join(BY_STATUS_DIR).join(status);
    fs::create_dir_all(&dir)?;
    let link = dir.join(name);
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(Path::new("../..").join(name), link)
}

/// Writes through a sibling temporary file so readers never see a half-written report.
fn write_atomically(
    path: &Path,
    render: impl FnOnce(&mut dyn Write) -> Result<(), ReportingError>,
) -> Result<(), ReportingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut out = io::BufWriter::new(File::create(&tmp)?);
    render(&mut out)?;
    out.flush()?;
    drop(out);
    fs::rename(&tmp, path)?;
    Ok(())
}

fn report_io<T>(task: &TaskId, what: &str, result: io::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::error!(task = %task, what, %error, "failed to write test artifact");
            None
        }
    }
}
