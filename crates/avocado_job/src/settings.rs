//! Job settings.
//!
//! Settings are layered: built-in defaults, then the user's
//! `$XDG_CONFIG_HOME/avocado/avocado.toml` when present, then a file
//! named on the command line, then command line flags (applied by the
//! caller on the loaded value). Runnables see the effective settings as
//! dotted keys, see [Settings::flatten].

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use avocado_reporting::AggregatorConfig;
use avocado_resolver::{Priority, ResolverRegistry};
use avocado_utils::duration::{parse_duration, DurationParseError};
use avocado_utils::net_protocol::messages::Outcome;
use avocado_utils::runnable::ConfigMap;
use avocado_workers::spawner::PodmanConfig;
use avocado_workers::SchedulerConfig;
use etcetera::app_strategy::{AppStrategy, AppStrategyArgs, Xdg};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE: &str = "avocado.toml";

/// Spawners accepted in `spawner.name`.
pub const SPAWNERS: &[&str] = &["process", "podman"];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read config file {}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("config file {} is malformed", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}")]
    Duration {
        key: &'static str,
        source: DurationParseError,
    },
    #[error("unknown test status {0:?} in output.interesting")]
    UnknownStatus(String),
    #[error("test runner {0:?} is not supported; only \"nrunner\" is")]
    UnsupportedTestRunner(String),
    #[error("unknown spawner {0:?}; expected one of {}", SPAWNERS.join(", "))]
    UnknownSpawner(String),
    #[error("resolver.priorities names unknown resolver {0:?}")]
    UnknownResolver(String),
    #[error("run.max_parallel_tasks must be at least 1")]
    NoParallelism,
    #[error("cannot locate the user directories: {0}")]
    HomeDir(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub run: RunSettings,
    pub runner: RunnerSettings,
    pub spawner: SpawnerSettings,
    pub status_server: StatusServerSettings,
    pub output: OutputSettings,
    pub resolver: ResolverSettings,
    pub sysinfo: SysinfoSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    /// Parent of job directories; `$XDG_DATA_HOME/avocado/job-results` when unset.
    pub results_dir: Option<PathBuf>,
    pub test_runner: String,
    /// Defaults to the number of CPUs.
    pub max_parallel_tasks: Option<usize>,
    /// `0` disables the job timeout.
    pub job_timeout: Option<String>,
    pub failfast: bool,
    pub dry_run: bool,
    pub keep_tmp: bool,
    pub ignore_missing_references: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            results_dir: None,
            test_runner: "nrunner".to_string(),
            max_parallel_tasks: None,
            job_timeout: None,
            failfast: false,
            dry_run: false,
            keep_tmp: false,
            ignore_missing_references: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    /// Interpreter for python based runners.
    pub python: String,
    pub task: TaskSettings,
    pub exectest: ExecTestSettings,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            task: TaskSettings::default(),
            exectest: ExecTestSettings::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSettings {
    /// How long the scheduler waits on the status queue per iteration.
    pub interval: String,
    pub timeout_running: Option<String>,
    /// Grace between terminating a task and killing it.
    pub soft_to_hard: String,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            interval: "0.01".to_string(),
            timeout_running: None,
            soft_to_hard: "1".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ExecTestSettings {
    pub exitcodes: ExitCodesSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ExitCodesSettings {
    /// Exit codes of exec-tests that mean the test skipped itself.
    pub skip: Vec<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SpawnerSettings {
    pub name: String,
    pub podman: PodmanSettings,
}

impl Default for SpawnerSettings {
    fn default() -> Self {
        Self {
            name: "process".to_string(),
            podman: PodmanSettings::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PodmanSettings {
    pub bin: String,
    pub image: String,
    /// Runner command inside the image.
    pub runner: Vec<String>,
}

impl Default for PodmanSettings {
    fn default() -> Self {
        let defaults = PodmanConfig::default();
        Self {
            bin: defaults.binary,
            image: defaults.image,
            runner: defaults.runner,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct StatusServerSettings {
    /// Address the job listens on for runner connections.
    pub listen: Option<SocketAddr>,
    /// Address runners are told to connect to, when it differs from `listen`.
    pub uri: Option<String>,
    /// Never pick a listen address automatically.
    pub disable_auto: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSettings {
    /// Streams shown on the console, as given to `--show`.
    pub show: Vec<String>,
    /// Statuses whose log tail is copied into `full.log`.
    pub interesting: Vec<String>,
    pub tail_bytes: usize,
    pub json: Option<String>,
    pub xunit: Option<String>,
    pub tap: Option<String>,
    pub tmt: Option<String>,
    pub html: Option<PathBuf>,
    /// Suite name in `results.xml`; the job directory name when unset.
    pub xunit_job_name: Option<String>,
    /// Bytes of test output embedded per xUnit test case.
    pub xunit_max_output: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            show: vec!["app".to_string()],
            interesting: vec!["FAIL".to_string(), "CANCEL".to_string()],
            tail_bytes: 4096,
            json: None,
            xunit: None,
            tap: None,
            tmt: None,
            html: None,
            xunit_job_name: None,
            xunit_max_output: 100_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSettings {
    /// Overrides of built-in resolver priorities, by resolver name.
    pub priorities: BTreeMap<String, Priority>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SysinfoSettings {
    pub enabled: bool,
    pub commands: Vec<String>,
    pub files: Vec<PathBuf>,
    pub commands_timeout: String,
}

impl Default for SysinfoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            commands: vec![
                "uname -a".to_string(),
                "hostname".to_string(),
                "uptime".to_string(),
            ],
            files: vec![
                PathBuf::from("/proc/cmdline"),
                PathBuf::from("/proc/meminfo"),
                PathBuf::from("/proc/cpuinfo"),
            ],
            commands_timeout: "10".to_string(),
        }
    }
}

fn app_strategy() -> Result<Xdg, SettingsError> {
    Xdg::new(AppStrategyArgs {
        top_level_domain: "org".to_string(),
        author: "avocado-framework".to_string(),
        app_name: "avocado".to_string(),
    })
    .map_err(|e| SettingsError::HomeDir(e.to_string()))
}

/// `$XDG_CONFIG_HOME/avocado/avocado.toml`, whether or not it exists.
pub fn user_config_path() -> Option<PathBuf> {
    app_strategy()
        .ok()
        .map(|strategy| strategy.config_dir().join(CONFIG_FILE))
}

fn duration(key: &'static str, value: &str) -> Result<Duration, SettingsError> {
    parse_duration(value).map_err(|source| SettingsError::Duration { key, source })
}

/// A zero duration means "no limit".
fn optional_duration(
    key: &'static str,
    value: Option<&str>,
) -> Result<Option<Duration>, SettingsError> {
    match value {
        None => Ok(None),
        Some(value) => duration(key, value).map(|d| Some(d).filter(|d| !d.is_zero())),
    }
}

fn parse_status(status: &str) -> Option<Outcome> {
    Outcome::ALL
        .into_iter()
        .find(|o| o.status().eq_ignore_ascii_case(status) || o.as_str() == status)
}

fn merge(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn flatten_into(flat: &mut ConfigMap, prefix: String, value: serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                let key = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(flat, key, value);
            }
        }
        serde_json::Value::Null => {}
        leaf => {
            flat.insert(prefix, leaf);
        }
    }
}

impl Settings {
    /// Loads the user's config file, if any, and then `explicit`, which
    /// must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        let mut files = Vec::new();
        if let Some(user) = user_config_path().filter(|p| p.is_file()) {
            files.push(user);
        }
        if let Some(explicit) = explicit {
            files.push(explicit.to_path_buf());
        }
        Self::from_files(&files)
    }

    /// Defaults overlaid with each of `files` in order. Later files win
    /// key by key; tables are merged rather than replaced.
    pub fn from_files(files: &[PathBuf]) -> Result<Self, SettingsError> {
        let mut merged = toml::Table::new();
        for path in files {
            let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            let parse_error = |source: toml::de::Error| SettingsError::Parse {
                path: path.clone(),
                source,
            };
            let layer: toml::Table = toml::from_str(&contents).map_err(parse_error)?;
            // Checked alone first so that errors name the file at fault.
            toml::Value::Table(layer.clone())
                .try_into::<Settings>()
                .map_err(parse_error)?;
            tracing::debug!(path = %path.display(), "loaded config file");
            merge(&mut merged, layer);
        }

        let settings: Settings = match files.last() {
            Some(last) => toml::Value::Table(merged)
                .try_into()
                .map_err(|source| SettingsError::Parse {
                    path: last.clone(),
                    source,
                })?,
            None => Settings::default(),
        };
        Ok(settings)
    }

    /// Checks everything that is parsed lazily, so that a bad value is
    /// reported before a job starts.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.run.test_runner != "nrunner" {
            return Err(SettingsError::UnsupportedTestRunner(
                self.run.test_runner.clone(),
            ));
        }
        if !SPAWNERS.contains(&self.spawner.name.as_str()) {
            return Err(SettingsError::UnknownSpawner(self.spawner.name.clone()));
        }
        self.scheduler_config()?;
        self.aggregator_config()?;
        self.sysinfo_timeout()?;
        let known = ResolverRegistry::with_builtin();
        if let Some(unknown) = self
            .resolver
            .priorities
            .keys()
            .find(|name| !known.names().any(|n| n == name.as_str()))
        {
            return Err(SettingsError::UnknownResolver(unknown.clone()));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig, SettingsError> {
        let max_parallel_tasks = match self.run.max_parallel_tasks {
            Some(0) => return Err(SettingsError::NoParallelism),
            Some(n) => n,
            None => num_cpus::get(),
        };
        let task = &self.runner.task;
        Ok(SchedulerConfig {
            max_parallel_tasks,
            task_timeout: optional_duration(
                "runner.task.timeout_running",
                task.timeout_running.as_deref(),
            )?,
            soft_to_hard: duration("runner.task.soft_to_hard", &task.soft_to_hard)?,
            job_timeout: optional_duration("run.job_timeout", self.run.job_timeout.as_deref())?,
            failfast: self.run.failfast,
            dry_run: self.run.dry_run,
            interval: duration("runner.task.interval", &task.interval)?,
            ..SchedulerConfig::default()
        })
    }

    pub fn aggregator_config(&self) -> Result<AggregatorConfig, SettingsError> {
        let interesting = self
            .output
            .interesting
            .iter()
            .map(|s| parse_status(s).ok_or_else(|| SettingsError::UnknownStatus(s.clone())))
            .collect::<Result<_, _>>()?;
        Ok(AggregatorConfig {
            interesting,
            tail_bytes: self.output.tail_bytes,
        })
    }

    pub fn podman_config(&self) -> PodmanConfig {
        let podman = &self.spawner.podman;
        PodmanConfig {
            binary: podman.bin.clone(),
            image: podman.image.clone(),
            runner: podman.runner.clone(),
        }
    }

    pub fn sysinfo_timeout(&self) -> Result<Duration, SettingsError> {
        duration("sysinfo.commands_timeout", &self.sysinfo.commands_timeout)
    }

    pub fn results_dir(&self) -> Result<PathBuf, SettingsError> {
        match &self.run.results_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(app_strategy()?.data_dir().join("job-results")),
        }
    }

    /// A resolver registry with the configured priorities applied.
    pub fn resolver_registry(&self) -> ResolverRegistry {
        let mut registry = ResolverRegistry::with_builtin();
        for (name, priority) in &self.resolver.priorities {
            if !registry.set_priority(name, *priority) {
                tracing::warn!(resolver = %name, "no such resolver; priority ignored");
            }
        }
        registry
    }

    /// The settings as dotted keys, e.g. `run.keep_tmp`. Unset options
    /// are left out.
    pub fn flatten(&self) -> ConfigMap {
        let mut flat = ConfigMap::new();
        match serde_json::to_value(self) {
            Ok(value) => flatten_into(&mut flat, String::new(), value),
            Err(error) => tracing::error!(%error, "settings could not be flattened"),
        }
        flat
    }
}
