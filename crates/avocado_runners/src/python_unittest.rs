use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use avocado_utils::net_protocol::messages::{Finished, Outcome};
use avocado_utils::runnable::Runnable;
use regex::Regex;
use tokio::process::Command;

use crate::exec_test::{in_invocation_dir, spawn_failure, test_environment, TestDirs, KEEP_TMP};
use crate::process::{supervise, StdoutHandling};
use crate::{MessageSink, RunContext, Runner};

/// Interpreter used for Python based runnables.
pub(crate) const PYTHON: &str = "runner.python";

pub(crate) fn python_interpreter(runnable: &Runnable) -> String {
    runnable
        .config_value(PYTHON)
        .and_then(|v| v.as_str())
        .unwrap_or("python3")
        .to_string()
}

/// Splits `path/to/module.py:Class.method` into the module file and the
/// dotted test name.
pub(crate) fn split_python_uri(uri: &str) -> Option<(&Path, &str)> {
    let (path, test) = uri.rsplit_once(':')?;
    if path.is_empty() || test.is_empty() {
        return None;
    }
    Some((Path::new(path), test))
}

/// Runs one `unittest.TestCase` method through `python -m unittest`.
pub struct PythonUnittestRunner;

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Ok,
    Fail,
    Error,
    Skipped(String),
    ExpectedFailure,
    UnexpectedSuccess,
}

fn verdict_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\.\.\. (ok|FAIL|ERROR|skipped (?:'(.*)'|(.*))|expected failure|unexpected success)\s*$",
        )
        .expect("valid regex")
    })
}

fn exception_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][\w.]*)(?:: (.*))?$").expect("valid regex")
    })
}

fn find_verdict(output: &str) -> Option<Verdict> {
    let captures = output
        .lines()
        .filter_map(|line| verdict_regex().captures(line))
        .last()?;
    let verdict = match &captures[1] {
        "ok" => Verdict::Ok,
        "FAIL" => Verdict::Fail,
        "ERROR" => Verdict::Error,
        "expected failure" => Verdict::ExpectedFailure,
        "unexpected success" => Verdict::UnexpectedSuccess,
        _ => Verdict::Skipped(
            captures
                .get(2)
                .or_else(|| captures.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        ),
    };
    Some(verdict)
}

/// The traceback unittest prints for a failure or error, if any.
fn find_traceback(output: &str) -> Option<String> {
    let start = output.find("Traceback (most recent call last):")?;
    let block = &output[start..];
    let end = block
        .find("\n\n")
        .or_else(|| block.find("\n-----"))
        .unwrap_or(block.len());
    Some(block[..end].trim_end().to_string())
}

fn exception_of(traceback: &str) -> Option<(String, Option<String>)> {
    let last = traceback.lines().rev().find(|l| !l.starts_with(' '))?;
    let captures = exception_regex().captures(last)?;
    let class = captures[1].rsplit('.').next().unwrap_or(&captures[1]);
    Some((
        class.to_string(),
        captures.get(2).map(|m| m.as_str().to_string()),
    ))
}

fn interpret(output: &str, returncode: Option<i32>) -> Finished {
    let mut finished = match find_verdict(output) {
        Some(Verdict::Ok) | Some(Verdict::ExpectedFailure) => Finished::new(Outcome::Pass),
        Some(Verdict::Skipped(reason)) => Finished::with_reason(Outcome::Skip, reason),
        Some(Verdict::UnexpectedSuccess) => {
            Finished::with_reason(Outcome::Fail, "unexpected success")
        }
        Some(Verdict::Fail) => Finished::new(Outcome::Fail),
        Some(Verdict::Error) => Finished::new(Outcome::Error),
        None => {
            let last = output
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("unittest produced no result");
            Finished::with_reason(Outcome::Error, last)
        }
    };

    if matches!(finished.result, Outcome::Fail | Outcome::Error) {
        if let Some(traceback) = find_traceback(output) {
            if let Some((class, reason)) = exception_of(&traceback) {
                finished.fail_class = Some(class);
                if finished.fail_reason.is_none() {
                    finished.fail_reason = reason;
                }
            }
            finished.traceback = Some(traceback);
        }
    }
    finished.returncode = returncode;
    finished
}

#[async_trait]
impl Runner for PythonUnittestRunner {
    fn kind(&self) -> &'static str {
        "python-unittest"
    }

    fn description(&self) -> &'static str {
        "Runs a Python unittest.TestCase test method"
    }

    fn configuration_used(&self) -> &'static [&'static str] {
        &[KEEP_TMP, PYTHON]
    }

    async fn run(&self, runnable: &Runnable, ctx: &RunContext, sink: &MessageSink) -> Finished {
        let Some((module_path, test_name)) = runnable.uri.as_deref().and_then(split_python_uri)
        else {
            return Finished::with_reason(
                Outcome::Error,
                "uri must be in the form <module path>:<class>.<method>",
            );
        };
        let Some(module) = module_path.file_stem().and_then(|s| s.to_str()) else {
            return Finished::with_reason(Outcome::Error, "invalid python module path");
        };
        let module_dir = match module_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };

        let dirs = match TestDirs::create(runnable) {
            Ok(dirs) => dirs,
            Err(err) => return spawn_failure(runnable, err),
        };

        let mut cmd = Command::new(python_interpreter(runnable));
        cmd.args(["-m", "unittest", "-v"])
            .arg(format!("{module}.{test_name}"))
            .envs(test_environment(runnable, &dirs))
            .current_dir(in_invocation_dir(&module_dir));

        sink.started(None).await;
        let result = supervise(cmd, StdoutHandling::Collect, ctx, sink).await;
        dirs.cleanup();
        let run = match result {
            Ok(run) => run,
            Err(err) => return spawn_failure(runnable, err),
        };
        if run.interrupted {
            return Finished::with_reason(Outcome::Interrupted, "Test interrupted by SIGTERM");
        }

        let mut output = String::from_utf8_lossy(&run.stderr).into_owned();
        output.push_str(&String::from_utf8_lossy(&run.stdout));
        interpret(&output, run.status.code())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn uri_split() {
        assert_eq!(
            split_python_uri("tests/test_x.py:Mine.test_a"),
            Some((Path::new("tests/test_x.py"), "Mine.test_a"))
        );
        assert_eq!(split_python_uri("tests/test_x.py"), None);
        assert_eq!(split_python_uri("tests/test_x.py:"), None);
    }

    #[test]
    fn passing_output() {
        let output = indoc! {"
            test_pass (test_x.Mine.test_pass) ... ok

            ----------------------------------------------------------------------
            Ran 1 test in 0.000s

            OK
        "};
        let finished = interpret(output, Some(0));
        assert_eq!(finished.result, Outcome::Pass);
        assert_eq!(finished.returncode, Some(0));
    }

    #[test]
    fn failing_output_carries_traceback() {
        let output = indoc! {"
            test_fail (test_x.Mine.test_fail) ... FAIL

            ======================================================================
            FAIL: test_fail (test_x.Mine.test_fail)
            ----------------------------------------------------------------------
            Traceback (most recent call last):
              File \"/tmp/test_x.py\", line 7, in test_fail
                self.assertEqual(1, 2)
            AssertionError: 1 != 2

            ----------------------------------------------------------------------
            Ran 1 test in 0.000s

            FAILED (failures=1)
        "};
        let finished = interpret(output, Some(1));
        assert_eq!(finished.result, Outcome::Fail);
        assert_eq!(finished.fail_class.as_deref(), Some("AssertionError"));
        assert_eq!(finished.fail_reason.as_deref(), Some("1 != 2"));
        let traceback = finished.traceback.unwrap();
        assert!(traceback.starts_with("Traceback (most recent call last):"));
        assert!(traceback.ends_with("AssertionError: 1 != 2"));
    }

    #[test]
    fn errors_skips_and_expected_failures() {
        let error = indoc! {"
            test_err (test_x.Mine.test_err) ... ERROR

            Traceback (most recent call last):
              File \"/tmp/test_x.py\", line 9, in test_err
                raise ValueError(\"bad\")
            ValueError: bad
        "};
        let finished = interpret(error, Some(1));
        assert_eq!(finished.result, Outcome::Error);
        assert_eq!(finished.fail_class.as_deref(), Some("ValueError"));

        let skipped = interpret("test_s (m.C.test_s) ... skipped 'not today'\n", Some(0));
        assert_eq!(skipped.result, Outcome::Skip);
        assert_eq!(skipped.fail_reason.as_deref(), Some("not today"));

        let xfail = interpret("test_s (m.C.test_s) ... expected failure\n", Some(0));
        assert_eq!(xfail.result, Outcome::Pass);

        let xpass = interpret("test_s (m.C.test_s) ... unexpected success\n", Some(1));
        assert_eq!(xpass.result, Outcome::Fail);
    }

    #[test]
    fn import_failure_is_an_error() {
        let output = indoc! {"
            Traceback (most recent call last):
              File \"<frozen runpy>\", line 198, in _run_module_as_main
            ModuleNotFoundError: No module named 'nope'
        "};
        let finished = interpret(output, Some(1));
        assert_eq!(finished.result, Outcome::Error);
        assert_eq!(
            finished.fail_reason.as_deref(),
            Some("ModuleNotFoundError: No module named 'nope'")
        );
    }
}
