//! Results in the format the `tmt` test management tool imports.

use std::io::Write;
use std::path::{Path, PathBuf};

use avocado_reporting::{JobReport, Reporter, ReportingError, TestResult};
use avocado_utils::net_protocol::messages::Outcome;
use avocado_utils::time::{format_hms, EpochSeconds};
use serde_derive::Serialize;

#[derive(Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct TmtResult<'a> {
    name: String,
    result: &'static str,
    start_time: String,
    end_time: String,
    duration: String,
    data_path: &'a Path,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    log: Vec<PathBuf>,
}

/// tmt knows fewer outcomes than we do.
fn tmt_result(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Pass => "pass",
        Outcome::Fail => "fail",
        Outcome::Error | Outcome::Interrupted => "error",
        Outcome::Skip | Outcome::Cancel => "skip",
        Outcome::Warn => "warn",
    }
}

impl<'a> TmtResult<'a> {
    fn new(result: &TestResult, data_path: &'a Path) -> Self {
        let log = match result.logfile.strip_prefix(data_path) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => result.logfile.clone(),
        };
        Self {
            name: format!("/{}", result.name),
            result: tmt_result(result.outcome),
            start_time: EpochSeconds::from_secs(result.time_start).format_rfc3339_utc(),
            end_time: EpochSeconds::from_secs(result.time_end).format_rfc3339_utc(),
            duration: format_hms(result.time_elapsed),
            data_path,
            log: vec![log],
        }
    }
}

/// `results.yaml`
#[derive(Default)]
pub struct TmtReporter;

impl Reporter for TmtReporter {
    fn name(&self) -> &'static str {
        "tmt"
    }

    fn file_name(&self) -> &'static str {
        "results.yaml"
    }

    fn render(&self, report: &JobReport<'_>, out: &mut dyn Write) -> Result<(), ReportingError> {
        let results: Vec<_> = report
            .results
            .iter()
            .map(|r| TmtResult::new(r, report.logdir))
            .collect();
        serde_yaml::to_writer(out, &results).map_err(|_| ReportingError::FailedToFormat("tmt"))
    }
}
