use std::io::Write;
use std::path::Path;

use avocado_reporting::{Counters, JobReport, Reporter, ReportingError, TestResult};
use serde_derive::Serialize;

#[derive(Serialize)]
struct Results<'a> {
    job_id: &'a str,
    debuglog: &'a Path,
    tests: &'a [TestResult],
    #[serde(flatten)]
    counters: &'a Counters,
    time: f64,
    start: f64,
}

/// `results.json`: every result plus the counters.
#[derive(Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn file_name(&self) -> &'static str {
        "results.json"
    }

    fn progressive(&self) -> bool {
        true
    }

    fn render(&self, report: &JobReport<'_>, out: &mut dyn Write) -> Result<(), ReportingError> {
        let results = Results {
            job_id: report.job_id,
            debuglog: report.debuglog,
            tests: report.results,
            counters: report.counters,
            time: report.time_elapsed,
            start: report.time_start.as_secs(),
        };
        serde_json::to_writer_pretty(&mut *out, &results)?;
        writeln!(out)?;
        Ok(())
    }
}
