use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use avocado_utils::time::EpochSeconds;
use thiserror::Error;

pub mod aggregator;
pub mod output;
mod result;

pub use aggregator::{Aggregator, AggregatorConfig};
pub use result::{Counters, TestResult};

#[derive(Debug, Error)]
pub enum ReportingError {
    #[error("failed to format a test result in the {0} format")]
    FailedToFormat(&'static str),
    #[error("failed to write a report: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Everything known about a job when a report is rendered.
#[derive(Debug, Clone, Copy)]
pub struct JobReport<'a> {
    pub job_id: &'a str,
    pub logdir: &'a Path,
    /// The job's own log, `<logdir>/job.log`.
    pub debuglog: &'a Path,
    pub results: &'a [TestResult],
    pub counters: &'a Counters,
    pub time_start: EpochSeconds,
    pub time_elapsed: f64,
}

/// A [`Reporter`] renders the results of a job in one machine-readable format.
pub trait Reporter: Send {
    /// The format name, as used on the command line.
    fn name(&self) -> &'static str;

    /// File the report is written to inside the job directory.
    fn file_name(&self) -> &'static str;

    /// Progressive reports are rewritten after every result so that an
    /// interrupted job still leaves a consistent one behind.
    fn progressive(&self) -> bool {
        false
    }

    fn render(&self, report: &JobReport<'_>, out: &mut dyn io::Write) -> Result<(), ReportingError>;
}

/// Where an extra copy of a report goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

impl FromStr for Destination {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "-" => Destination::Stdout,
            path => Destination::File(PathBuf::from(path)),
        })
    }
}

/// A reporter plus the extra destinations requested for it.
pub struct ReportTarget {
    pub reporter: Box<dyn Reporter>,
    /// Whether the report is also written into the job directory.
    pub in_logdir: bool,
    pub extra: Vec<Destination>,
}

impl ReportTarget {
    pub fn new(reporter: Box<dyn Reporter>) -> Self {
        Self {
            reporter,
            in_logdir: true,
            extra: Vec::new(),
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        if !self.extra.contains(&destination) {
            self.extra.push(destination);
        }
        self
    }
}
