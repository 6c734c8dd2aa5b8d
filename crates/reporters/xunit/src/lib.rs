//! A single xUnit `testsuite`, the subset of the JUnit schema CI systems read.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use avocado_reporting::{JobReport, Reporter, ReportingError, TestResult};
use avocado_utils::net_protocol::messages::Outcome;

/// Most test output embedded in a failing test case; the tail is kept.
const DEFAULT_MAX_OUTPUT: u64 = 100_000;

pub struct XunitReporter {
    /// Suite name; the job directory name when unset.
    suite_name: Option<String>,
    max_output: u64,
}

impl Default for XunitReporter {
    fn default() -> Self {
        Self {
            suite_name: None,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }
}

impl XunitReporter {
    pub fn with_suite_name(mut self, name: impl Into<String>) -> Self {
        self.suite_name = Some(name.into());
        self
    }

    pub fn with_max_output(mut self, max_output: u64) -> Self {
        self.max_output = max_output;
        self
    }

    fn push_result(&self, xml: &mut String, result: &TestResult) {
        let head = format!(
            "\t<testcase classname={} name={} time=\"{:.3}\"",
            escape_attr(result.class_name()),
            escape_attr(&result.name),
            result.time_elapsed,
        );
        let element = match result.outcome {
            Outcome::Pass | Outcome::Warn => {
                let _ = writeln!(xml, "{head}/>");
                return;
            }
            Outcome::Skip | Outcome::Cancel => {
                let _ = writeln!(xml, "{head}>\n\t\t<skipped />\n\t</testcase>");
                return;
            }
            Outcome::Fail => "failure",
            Outcome::Error | Outcome::Interrupted => "error",
        };

        let output = read_output(&result.logfile, self.max_output);
        let _ = writeln!(
            xml,
            "{head}>\n\t\t<{element} type={} message={}><![CDATA[{}]]></{element}>\n\t\t<system-out><![CDATA[{}]]></system-out>\n\t</testcase>",
            escape_attr(result.fail_class.as_deref().unwrap_or("<unknown>")),
            escape_attr(result.fail_reason.as_deref().unwrap_or("<unknown>")),
            escape_cdata(result.traceback.as_deref().unwrap_or("<unknown>")),
            escape_cdata(&output),
        );
    }
}

impl Reporter for XunitReporter {
    fn name(&self) -> &'static str {
        "xunit"
    }

    fn file_name(&self) -> &'static str {
        "results.xml"
    }

    fn render(&self, report: &JobReport<'_>, out: &mut dyn Write) -> Result<(), ReportingError> {
        let counters = report.counters;
        let name = match &self.suite_name {
            Some(name) => name.clone(),
            None => report
                .logdir
                .file_name()
                .map_or_else(|| "avocado".to_string(), |n| n.to_string_lossy().into_owned()),
        };

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<testsuite name={} tests=\"{}\" errors=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\" timestamp=\"{}\">",
            escape_attr(&name),
            counters.total,
            counters.error + counters.interrupted,
            counters.fail,
            counters.skip + counters.cancel,
            report.time_elapsed,
            report.time_start.format_iso(),
        );
        for result in report.results {
            self.push_result(&mut xml, result);
        }
        xml.push_str("</testsuite>\n");

        out.write_all(xml.as_bytes())?;
        Ok(())
    }
}

/// The end of a test's debug log, with terminal escapes removed.
fn read_output(logfile: &Path, max: u64) -> String {
    let read = || -> io::Result<Vec<u8>> {
        let mut file = File::open(logfile)?;
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(len.saturating_sub(max)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    };
    let raw = read().unwrap_or_default();
    // ANSI escape codes are not valid XML.
    let cleaned = strip_ansi_escapes::strip(&raw).unwrap_or(raw);
    String::from_utf8_lossy(&cleaned).into_owned()
}

fn is_printable(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\t') || (!c.is_control() && c != '\u{FFFE}' && c != '\u{FFFF}')
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\n' => escaped.push_str("&#10;"),
            c if is_printable(c) => escaped.push(c),
            c => {
                let _ = write!(escaped, "\\x{:02x}", c as u32);
            }
        }
    }
    escaped.push('"');
    escaped
}

fn escape_cdata(value: &str) -> String {
    let printable: String = value
        .chars()
        .map(|c| if is_printable(c) { c.to_string() } else { format!("\\x{:02x}", c as u32) })
        .collect();
    printable.replace("]]>", "]]>]]&gt;<![CDATA[")
}
