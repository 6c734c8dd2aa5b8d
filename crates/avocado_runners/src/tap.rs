use async_trait::async_trait;
use avocado_utils::net_protocol::messages::{level, Finished, Message, Outcome};
use avocado_utils::runnable::Runnable;

use crate::exec_test::{executable_command, spawn_failure, TestDirs, KEEP_TMP};
use crate::process::{outcome_from_exit, supervise, StdoutHandling};
use crate::tap_parser::{self, TapEvent, TapResult};
use crate::{MessageSink, RunContext, Runner};

/// Runs an executable that emits TAP on stdout.
pub struct TapRunner;

#[derive(Default)]
struct Tally {
    error: Option<String>,
    bailed_out: bool,
    failed: bool,
    unexpected_pass: bool,
    ran: usize,
}

impl Tally {
    fn into_finished(self) -> Finished {
        if let Some(error) = self.error {
            return Finished::with_reason(Outcome::Error, error);
        }
        if self.bailed_out {
            return Finished::with_reason(Outcome::Error, "TAP producer bailed out");
        }
        if self.failed || self.unexpected_pass {
            let reason = if self.unexpected_pass {
                "there were test failures or unexpected passes"
            } else {
                "there were test failures"
            };
            return Finished::with_reason(Outcome::Fail, reason);
        }
        if self.ran == 0 {
            return Finished::with_reason(Outcome::Skip, "no tests were run");
        }
        Finished::new(Outcome::Pass)
    }
}

fn result_name(result: TapResult) -> &'static str {
    match result {
        TapResult::Pass => "PASS",
        TapResult::Skip => "SKIP",
        TapResult::Fail => "FAIL",
        TapResult::XFail => "XFAIL",
        TapResult::XPass => "XPASS",
    }
}

/// Reports each TAP event as a log message and folds them into a result.
async fn interpret(stdout: &[u8], sink: &MessageSink) -> Finished {
    let output = String::from_utf8_lossy(stdout);
    let mut tally = Tally::default();

    for event in tap_parser::parse(&output) {
        match event {
            TapEvent::Test {
                number,
                name,
                result,
                explanation,
            } => {
                let mut line = format!("{}: {number}", result_name(result));
                if !name.is_empty() {
                    line.push(' ');
                    line.push_str(&name);
                }
                if let Some(explanation) = explanation {
                    line.push_str(&format!(" ({explanation})"));
                }
                line.push('\n');
                let severity = match result {
                    TapResult::Fail | TapResult::XPass => level::ERROR,
                    _ => level::INFO,
                };
                sink.send(Message::log(line.into_bytes(), severity)).await;

                match result {
                    TapResult::Fail => tally.failed = true,
                    TapResult::XPass => tally.unexpected_pass = true,
                    TapResult::Skip => continue,
                    TapResult::Pass | TapResult::XFail => {}
                }
                tally.ran += 1;
            }
            TapEvent::Bailout(reason) => {
                let line = format!("Bail out! {reason}\n");
                sink.send(Message::log(line.into_bytes(), level::ERROR)).await;
                tally.bailed_out = true;
            }
            TapEvent::Error(error) => {
                let line = format!("TAP parsing error: {error}\n");
                sink.send(Message::log(line.into_bytes(), level::ERROR)).await;
                tally.error.get_or_insert(error);
            }
            TapEvent::Version(_) | TapEvent::Plan { .. } => {}
        }
    }

    tally.into_finished()
}

#[async_trait]
impl Runner for TapRunner {
    fn kind(&self) -> &'static str {
        "tap"
    }

    fn description(&self) -> &'static str {
        "Runs an executable and interprets its Test Anything Protocol output"
    }

    fn configuration_used(&self) -> &'static [&'static str] {
        &[KEEP_TMP]
    }

    async fn run(&self, runnable: &Runnable, ctx: &RunContext, sink: &MessageSink) -> Finished {
        let dirs = match TestDirs::create(runnable) {
            Ok(dirs) => dirs,
            Err(err) => return spawn_failure(runnable, err),
        };
        let cmd = match executable_command(runnable, &dirs) {
            Ok(cmd) => cmd,
            Err(finished) => return finished,
        };

        sink.started(None).await;
        let run = match supervise(cmd, StdoutHandling::Collect, ctx, sink).await {
            Ok(run) => run,
            Err(err) => {
                dirs.cleanup();
                return spawn_failure(runnable, err);
            }
        };
        dirs.cleanup();

        let exit = outcome_from_exit(&run, &[]);
        if matches!(exit.result, Outcome::Interrupted | Outcome::Error) {
            return exit;
        }

        let mut finished = interpret(&run.stdout, sink).await;
        if finished.result == Outcome::Pass && exit.result != Outcome::Pass {
            finished = exit;
        }
        finished.returncode = run.status.code();
        finished
    }
}
