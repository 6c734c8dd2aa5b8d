//! A single self-contained HTML page summarizing a job.

use std::fmt::Write as _;
use std::io::Write;

use avocado_reporting::{JobReport, Reporter, ReportingError, TestResult};
use avocado_utils::net_protocol::messages::Outcome;
use avocado_utils::time::EpochSeconds;
use indoc::{formatdoc, indoc};

const STYLE: &str = indoc! {"
    body { font-family: sans-serif; margin: 2em; }
    table { border-collapse: collapse; width: 100%; }
    th, td { border: 1px solid #ccc; padding: 4px 8px; text-align: left; vertical-align: top; }
    tr.success { background: #dff0d8; }
    tr.warning { background: #fcf8e3; }
    tr.danger { background: #f2dede; }
    pre { margin: 0; white-space: pre-wrap; }
"};

#[derive(Default)]
pub struct HtmlReporter;

fn row_class(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Pass => "success",
        Outcome::Skip | Outcome::Warn | Outcome::Cancel => "warning",
        Outcome::Fail | Outcome::Error | Outcome::Interrupted => "danger",
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn push_row(html: &mut String, report: &JobReport<'_>, result: &TestResult) {
    let logfile = result
        .logfile
        .strip_prefix(report.logdir)
        .unwrap_or(&result.logfile);
    let _ = writeln!(
        html,
        r#"<tr class="{class}"><td>{start}</td><td>{id}</td><td>{status}</td><td>{time:.2}</td><td><pre>{reason}</pre></td><td><pre>{whiteboard}</pre></td><td><a href="{logfile}">debug.log</a></td></tr>"#,
        class = row_class(result.outcome),
        start = EpochSeconds::from_secs(result.time_start).format_iso(),
        id = escape(&result.id),
        status = result.status,
        time = result.time_elapsed,
        reason = escape(result.fail_reason.as_deref().unwrap_or_default()),
        whiteboard = escape(&result.whiteboard),
        logfile = escape(&logfile.to_string_lossy()),
    );
}

impl Reporter for HtmlReporter {
    fn name(&self) -> &'static str {
        "html"
    }

    fn file_name(&self) -> &'static str {
        "results.html"
    }

    fn render(&self, report: &JobReport<'_>, out: &mut dyn Write) -> Result<(), ReportingError> {
        let counters = report.counters;
        let hostname = std::fs::read_to_string(report.logdir.join("sysinfo/pre/hostname"))
            .map(|h| h.trim().to_string())
            .unwrap_or_default();

        let mut rows = String::new();
        for result in report.results {
            push_row(&mut rows, report, result);
        }

        let page = formatdoc! {r#"
            <!DOCTYPE html>
            <html>
            <head>
            <meta charset="utf-8">
            <title>Avocado Job Report {job_id}</title>
            <base href="file://{logdir}/">
            <style>
            {STYLE}</style>
            </head>
            <body>
            <h1>Avocado Job Report</h1>
            <table>
            <tr><th>Job ID</th><td>{job_id}</td></tr>
            <tr><th>Host</th><td>{hostname}</td></tr>
            <tr><th>Results Dir</th><td><a href="file://{logdir}/">{logdir}</a></td></tr>
            <tr><th>Started</th><td>{start}</td></tr>
            <tr><th>Duration</th><td>{elapsed:.2} s</td></tr>
            <tr><th>Stats</th><td>From {total} tests executed, {pass} passed ({rate:.2}% success rate)</td></tr>
            </table>
            <h2>Test Results</h2>
            <table>
            <tr><th>Start Time</th><th>Test ID</th><th>Status</th><th>Time (sec)</th><th>Info</th><th>Whiteboard</th><th>Debug Log</th></tr>
            {rows}</table>
            </body>
            </html>
            "#,
            job_id = escape(report.job_id),
            logdir = escape(&report.logdir.to_string_lossy()),
            hostname = escape(&hostname),
            start = report.time_start.format_iso(),
            elapsed = report.time_elapsed,
            total = counters.total,
            pass = counters.pass,
            rate = success_rate(counters.pass + counters.warn, counters.total),
        };
        out.write_all(page.as_bytes())?;
        Ok(())
    }
}

fn success_rate(ok: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        ok as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod test {
    use avocado_reporting::{Counters, JobReport, Reporter, TestResult};
    use avocado_utils::net_protocol::messages::Outcome;
    use avocado_utils::time::EpochSeconds;

    use super::{escape, HtmlReporter};

    #[test]
    fn renders_rows_with_relative_links() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sysinfo/pre")).unwrap();
        std::fs::write(dir.path().join("sysinfo/pre/hostname"), "builder\n").unwrap();

        let mut fail = TestResult::fake("2-fail.py:T.test", Outcome::Fail);
        fail.fail_reason = Some("1 != 2 <oops>".to_string());
        fail.logfile = dir.path().join("test-results/2-fail.py:T.test/debug.log");
        let results = vec![TestResult::fake("1-pass.sh", Outcome::Pass), fail];
        let mut counters = Counters::default();
        results.iter().for_each(|r| counters.record(r.outcome));

        let report = JobReport {
            job_id: "abc",
            logdir: dir.path(),
            debuglog: &dir.path().join("job.log"),
            results: &results,
            counters: &counters,
            time_start: EpochSeconds::from_secs(1_700_000_000.0),
            time_elapsed: 1.0,
        };
        let mut out = Vec::new();
        HtmlReporter.render(&report, &mut out).unwrap();
        let html = String::from_utf8(out).unwrap();

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<td>builder</td>"));
        assert!(html.contains("From 2 tests executed, 1 passed (50.00% success rate)"));
        assert!(html.contains(r#"<tr class="success">"#));
        assert!(html.contains(r#"<tr class="danger">"#));
        assert!(html.contains("1 != 2 &lt;oops&gt;"));
        assert!(html.contains(r#"<a href="test-results/2-fail.py:T.test/debug.log">"#));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
