//! Console and job log subscribers.

use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context};
use avocado_runners::app::LOG_ENV;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Level of the job log when `AVOCADO_LOG` is unset.
const DEFAULT_JOB_LOG_LEVEL: &str = "info";

/// What `--show` asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Show {
    /// Whether the human job summary is printed.
    pub app: bool,
    /// Filter directives for logs mirrored on stderr.
    directives: Vec<String>,
}

impl Show {
    /// Accepts `none`, `app`, `early`, `test`, `job` and `<target>[:<level>]`.
    /// `none` anywhere silences everything.
    pub fn parse(items: &[String]) -> anyhow::Result<Self> {
        let mut show = Show {
            app: false,
            directives: Vec::new(),
        };
        if items.is_empty() {
            show.app = true;
        }
        for item in items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            match item {
                "none" => {
                    return Ok(Show {
                        app: false,
                        directives: Vec::new(),
                    })
                }
                "app" => show.app = true,
                "early" => {
                    show.app = true;
                    show.directives.push("debug".to_string());
                }
                "test" => {
                    show.app = true;
                    show.directives.push("avocado_workers=debug".to_string());
                    show.directives.push("avocado_reporting=debug".to_string());
                }
                "job" => {
                    show.app = true;
                    show.directives.push("avocado_job=debug".to_string());
                }
                stream => show.directives.push(stream_directive(stream)?),
            }
        }
        Ok(show)
    }

    /// The stderr filter, if anything beyond the human summary is shown.
    pub fn console_filter(&self) -> Option<String> {
        if self.directives.is_empty() {
            None
        } else {
            Some(self.directives.join(","))
        }
    }
}

/// `avocado_workers::scheduler:trace` becomes `avocado_workers::scheduler=trace`.
fn stream_directive(stream: &str) -> anyhow::Result<String> {
    let (target, level) = match stream.rsplit_once(':') {
        Some((target, level)) if !target.ends_with(':') && LevelFilter::from_str(level).is_ok() => {
            (target, level)
        }
        _ => (stream, "debug"),
    };
    let valid_target = target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'));
    if target.is_empty() || !valid_target {
        bail!("invalid --show value '{stream}'");
    }
    Ok(format!("{target}={level}"))
}

/// Installs the process-wide subscriber. Events go to stderr per `show`,
/// and to `job_log` when given, filtered by `AVOCADO_LOG`.
///
/// The returned guard flushes the job log when dropped.
pub fn init(show: &Show, job_log: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let console = match show.console_filter() {
        Some(directives) => {
            let filter = EnvFilter::try_new(&directives)
                .with_context(|| format!("invalid --show filter '{directives}'"))?;
            Some(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
        }
        None => None,
    };

    let (file, guard) = match job_log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let filter = EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_JOB_LOG_LEVEL));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("a log subscriber is already installed")?;
    Ok(guard)
}
