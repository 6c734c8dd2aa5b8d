//! Human-readable job output.

use std::io;
use std::path::Path;

use avocado_utils::net_protocol::messages::Outcome;
use termcolor::{Color, ColorSpec, WriteColor};

use crate::Counters;

/// Order of the counters on the `RESULTS` line.
const RESULTS_ORDER: [(Outcome, &str); 7] = [
    (Outcome::Pass, "PASS"),
    (Outcome::Error, "ERROR"),
    (Outcome::Fail, "FAIL"),
    (Outcome::Skip, "SKIP"),
    (Outcome::Warn, "WARN"),
    (Outcome::Interrupted, "INTERRUPT"),
    (Outcome::Cancel, "CANCEL"),
];

/// Writes `label` padded to the column the job summary lines share.
fn label(writer: &mut impl io::Write, label: &str) -> io::Result<()> {
    write!(writer, "{label:<11}: ")
}

pub fn format_job_header(writer: &mut impl WriteColor, job_id: &str, job_log: &Path) -> io::Result<()> {
    label(writer, "JOB ID")?;
    writeln!(writer, "{job_id}")?;
    label(writer, "JOB LOG")?;
    writeln!(writer, "{}", job_log.display())
}

pub fn format_test_started(
    writer: &mut impl WriteColor,
    index: usize,
    total: usize,
    name: &str,
) -> io::Result<()> {
    write!(writer, " ({index}/{total}) {name}: ")?;
    with_color_spec(writer, &bold_spec(), |w| write!(w, "STARTED"))?;
    writeln!(writer)
}

pub fn format_test_finished(
    writer: &mut impl WriteColor,
    index: usize,
    total: usize,
    name: &str,
    outcome: Outcome,
    elapsed: f64,
    fail_reason: Option<&str>,
) -> io::Result<()> {
    write!(writer, " ({index}/{total}) {name}:  ")?;
    with_color(writer, status_color(outcome), |w| write!(w, "{}", outcome.status()))?;
    write!(writer, " ({elapsed:.2} s)")?;
    if let Some(reason) = fail_reason.filter(|_| outcome != Outcome::Pass) {
        write!(writer, " ({})", first_line(reason))?;
    }
    writeln!(writer)
}

/// `RESULTS    : PASS 1 | ERROR 0 | FAIL 0 | SKIP 0 | WARN 0 | INTERRUPT 0 | CANCEL 0`
pub fn format_results_line(writer: &mut impl WriteColor, counters: &Counters) -> io::Result<()> {
    label(writer, "RESULTS")?;
    for (i, (outcome, name)) in RESULTS_ORDER.into_iter().enumerate() {
        if i > 0 {
            write!(writer, " | ")?;
        }
        let count = counters.get(outcome);
        if count > 0 {
            with_color(writer, status_color(outcome), |w| write!(w, "{name} {count}"))?;
        } else {
            write!(writer, "{name} {count}")?;
        }
    }
    writeln!(writer)
}

pub fn format_report_path(writer: &mut impl WriteColor, format: &str, path: &Path) -> io::Result<()> {
    label(writer, &format!("JOB {}", format.to_uppercase()))?;
    writeln!(writer, "{}", path.display())
}

pub fn format_job_time(writer: &mut impl WriteColor, secs: f64) -> io::Result<()> {
    label(writer, "JOB TIME")?;
    writeln!(writer, "{secs:.2} s")
}

pub fn format_notice(writer: &mut impl WriteColor, notice: &str) -> io::Result<()> {
    with_color_spec(writer, &yellow_bold_spec(), |w| writeln!(w, "{notice}"))
}

pub fn format_error(writer: &mut impl WriteColor, message: &str) -> io::Result<()> {
    with_color(writer, Color::Red, |w| writeln!(w, "{message}"))
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

#[inline]
fn bold_spec() -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_bold(true);
    spec
}

#[inline]
fn yellow_bold_spec() -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(Color::Yellow)).set_bold(true);
    spec
}

pub fn status_color(outcome: Outcome) -> Color {
    match outcome {
        Outcome::Pass => Color::Green,
        Outcome::Fail | Outcome::Error | Outcome::Interrupted => Color::Red,
        Outcome::Skip | Outcome::Cancel | Outcome::Warn => Color::Yellow,
    }
}

#[inline]
fn with_color<W>(writer: &mut W, color: Color, f: impl FnOnce(&mut W) -> io::Result<()>) -> io::Result<()>
where
    W: WriteColor,
{
    with_color_spec(writer, ColorSpec::new().set_fg(Some(color)), f)
}

#[inline]
fn with_color_spec<W>(
    writer: &mut W,
    color_spec: &ColorSpec,
    f: impl FnOnce(&mut W) -> io::Result<()>,
) -> io::Result<()>
where
    W: WriteColor,
{
    writer.set_color(color_spec)?;
    f(writer)?;
    writer.reset()
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use avocado_test_utils::color_writer::TaggedColorWriter;
    use avocado_utils::net_protocol::messages::Outcome;

    use super::{
        format_job_header, format_job_time, format_report_path, format_results_line,
        format_test_finished, format_test_started,
    };
    use crate::Counters;

    #[test]
    fn results_line() {
        let mut counters = Counters::default();
        counters.record(Outcome::Pass);
        counters.record(Outcome::Pass);
        counters.record(Outcome::Fail);
        counters.record(Outcome::Interrupted);

        let mut buf = TaggedColorWriter::default();
        format_results_line(&mut buf, &counters).unwrap();
        insta::assert_snapshot!(buf.into_string(), @"RESULTS    : <green>PASS 2<reset> | ERROR 0 | <red>FAIL 1<reset> | SKIP 0 | WARN 0 | <red>INTERRUPT 1<reset> | CANCEL 0");
    }

    #[test]
    fn results_line_without_color() {
        let mut buf = termcolor::NoColor::new(vec![]);
        format_results_line(&mut buf, &Counters::default()).unwrap();
        assert_eq!(
            String::from_utf8(buf.into_inner()).unwrap(),
            "RESULTS    : PASS 0 | ERROR 0 | FAIL 0 | SKIP 0 | WARN 0 | INTERRUPT 0 | CANCEL 0\n"
        );
    }

    #[test]
    fn test_lines() {
        let mut buf = TaggedColorWriter::default();
        format_test_started(&mut buf, 1, 2, "passtest.py:PassTest.test").unwrap();
        format_test_finished(&mut buf, 1, 2, "passtest.py:PassTest.test", Outcome::Pass, 0.014, None)
            .unwrap();
        format_test_finished(
            &mut buf,
            2,
            2,
            "failtest.py:FailTest.test",
            Outcome::Fail,
            1.5,
            Some("This test is supposed to fail\nsecond line"),
        )
        .unwrap();
        assert_eq!(
            buf.into_string(),
            concat!(
                " (1/2) passtest.py:PassTest.test: <bold>STARTED<reset>\n",
                " (1/2) passtest.py:PassTest.test:  <green>PASS<reset> (0.01 s)\n",
                " (2/2) failtest.py:FailTest.test:  <red>FAIL<reset> (1.50 s) (This test is supposed to fail)\n",
            )
        );
    }

    #[test]
    fn job_lines() {
        let mut buf = TaggedColorWriter::default();
        format_job_header(&mut buf, "abc", Path::new("/r/job-1/job.log")).unwrap();
        format_report_path(&mut buf, "html", Path::new("/r/job-1/results.html")).unwrap();
        format_job_time(&mut buf, 2.0).unwrap();
        insta::assert_snapshot!(buf.into_string(), @r###"
        JOB ID     : abc
        JOB LOG    : /r/job-1/job.log
        JOB HTML   : /r/job-1/results.html
        JOB TIME   : 2.00 s
        "###);
    }
}
