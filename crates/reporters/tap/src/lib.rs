use std::io::Write;

use avocado_reporting::{JobReport, Reporter, ReportingError, TestResult};
use avocado_utils::net_protocol::messages::Outcome;

/// `results.tap`: a TAP version 13 stream with one test point per result.
#[derive(Default)]
pub struct TapReporter;

fn test_point(out: &mut dyn Write, number: usize, result: &TestResult) -> std::io::Result<()> {
    let reason = result
        .fail_reason
        .as_deref()
        .and_then(|r| r.lines().next())
        .filter(|r| !r.is_empty());
    let name = &result.name;
    match (result.outcome, reason) {
        (Outcome::Pass, _) => writeln!(out, "ok {number} - {name}"),
        (Outcome::Skip | Outcome::Cancel, Some(reason)) => {
            writeln!(out, "ok {number} - {name} # SKIP {reason}")
        }
        (Outcome::Skip | Outcome::Cancel, None) => writeln!(out, "ok {number} - {name} # SKIP"),
        (Outcome::Warn, Some(reason)) => writeln!(out, "ok {number} - {name} # WARN: {reason}"),
        (Outcome::Warn, None) => writeln!(out, "ok {number} - {name} # WARN"),
        (outcome, Some(reason)) => {
            writeln!(out, "not ok {number} - {name} # {}: {reason}", outcome.status())
        }
        (outcome, None) => writeln!(out, "not ok {number} - {name} # {}", outcome.status()),
    }
}

impl Reporter for TapReporter {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn file_name(&self) -> &'static str {
        "results.tap"
    }

    fn render(&self, report: &JobReport<'_>, out: &mut dyn Write) -> Result<(), ReportingError> {
        writeln!(out, "TAP version 13")?;
        writeln!(out, "1..{}", report.results.len())?;
        for (i, result) in report.results.iter().enumerate() {
            test_point(out, i + 1, result)?;
        }
        Ok(())
    }
}
