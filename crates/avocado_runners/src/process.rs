//! Supervision of the test process a runner starts.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use avocado_utils::net_protocol::messages::{Finished, Outcome};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::capture_output::{forward_messages, forward_raw, FinishedSlot, Stream};
use crate::{MessageSink, RunContext};

/// How long output readers may lag behind the exit of the process.
/// Grandchildren holding the pipes open are not waited for past this.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) enum StdoutHandling {
    /// Relay as `stdout` messages.
    Forward,
    /// Relay and also collect stdout and stderr for the runner.
    Collect,
    /// The child speaks the message protocol on stdout.
    Protocol(FinishedSlot),
}

pub(crate) struct ProcessRun {
    pub status: ExitStatus,
    /// Termination was requested while the process ran.
    pub interrupted: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Starts `cmd`, relays its output into `sink`, and waits for it.
///
/// A termination request on the context is forwarded to the process as
/// SIGTERM; the process is then waited for so it can clean up.
pub(crate) async fn supervise(
    mut cmd: Command,
    stdout_handling: StdoutHandling,
    ctx: &RunContext,
    sink: &MessageSink,
) -> io::Result<ProcessRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let collect = matches!(stdout_handling, StdoutHandling::Collect);
    let stdout_task = child.stdout.take().map(|stdout| match stdout_handling {
        StdoutHandling::Forward => forward_raw(stdout, Stream::Stdout, sink.clone(), false),
        StdoutHandling::Collect => forward_raw(stdout, Stream::Stdout, sink.clone(), true),
        StdoutHandling::Protocol(slot) => forward_messages(stdout, sink.clone(), slot),
    });
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| forward_raw(stderr, Stream::Stderr, sink.clone(), collect));

    let mut interrupted = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = ctx.interrupt.wait() => {
            interrupted = true;
            if let Some(pid) = pid {
                tracing::debug!(pid, "forwarding SIGTERM to test process");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            child.wait().await?
        }
    };

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;

    Ok(ProcessRun {
        status,
        interrupted,
        stdout,
        stderr,
    })
}

async fn drain(task: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(Ok(bytes))) => bytes,
        Ok(Ok(Err(err))) => {
            tracing::warn!(?err, "failed reading test process output");
            Vec::new()
        }
        Ok(Err(join_err)) => {
            tracing::warn!(?join_err, "output reader panicked");
            Vec::new()
        }
        Err(_) => {
            tracing::debug!("output still open after process exit; detaching");
            task.abort();
            Vec::new()
        }
    }
}

pub(crate) fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signal}"))
}

/// Maps how an executable ended onto a runnable outcome.
pub(crate) fn outcome_from_exit(run: &ProcessRun, skip_codes: &[i32]) -> Finished {
    if run.interrupted {
        return Finished::with_reason(Outcome::Interrupted, "Test interrupted by SIGTERM");
    }
    if let Some(signal) = run.status.signal() {
        let mut finished = Finished::with_reason(
            Outcome::Error,
            format!("Test killed by signal {}", signal_name(signal)),
        );
        finished.fail_class = Some("Signal".to_string());
        return finished;
    }

    let code = run.status.code().unwrap_or(-1);
    let mut finished = if code == 0 {
        Finished::new(Outcome::Pass)
    } else if skip_codes.contains(&code) {
        Finished::with_reason(Outcome::Skip, format!("Exit code {code} requests a skip"))
    } else {
        Finished::with_reason(Outcome::Fail, format!("Exited with status {code}"))
    };
    finished.returncode = Some(code);
    finished
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn run(raw: i32, interrupted: bool) -> ProcessRun {
        ProcessRun {
            status: ExitStatus::from_raw(raw),
            interrupted,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(outcome_from_exit(&run(0, false), &[]).result, Outcome::Pass);
        assert_eq!(outcome_from_exit(&run(1 << 8, false), &[]).result, Outcome::Fail);
        let skipped = outcome_from_exit(&run(77 << 8, false), &[77]);
        assert_eq!(skipped.result, Outcome::Skip);
        assert_eq!(skipped.returncode, Some(77));
    }

    #[test]
    fn signals_are_errors_naming_the_signal() {
        let killed = outcome_from_exit(&run(9, false), &[]);
        assert_eq!(killed.result, Outcome::Error);
        assert_eq!(killed.fail_reason.as_deref(), Some("Test killed by signal SIGKILL"));
    }

    #[test]
    fn interruption_wins() {
        let finished = outcome_from_exit(&run(15, true), &[]);
        assert_eq!(finished.result, Outcome::Interrupted);
    }
}
