use std::path::{Path, PathBuf};

use async_trait::async_trait;
use avocado_utils::net_protocol::messages::{Finished, Outcome};
use avocado_utils::runnable::Runnable;
use tokio::process::Command;

use crate::process::{outcome_from_exit, supervise, StdoutHandling};
use crate::{MessageSink, RunContext, Runner};

pub(crate) const KEEP_TMP: &str = "run.keep_tmp";
const SKIP_EXIT_CODES: &str = "runner.exectest.exitcodes.skip";

/// Runs an executable; its exit status is the result.
pub struct ExecTestRunner;

/// Scratch and output locations handed to a test process.
pub(crate) struct TestDirs {
    workdir: Option<tempfile::TempDir>,
    workdir_path: PathBuf,
    pub logdir: PathBuf,
    pub outputdir: PathBuf,
}

impl TestDirs {
    pub fn create(runnable: &Runnable) -> std::io::Result<TestDirs> {
        let workdir = tempfile::Builder::new()
            .prefix(".avocado-workdir-")
            .tempdir()?;
        let workdir_path = workdir.path().to_path_buf();
        let logdir = match &runnable.output_dir {
            Some(dir) => dir.clone(),
            None => workdir_path.join("logdir"),
        };
        let outputdir = logdir.join("data");
        std::fs::create_dir_all(&outputdir)?;

        let workdir = if runnable.config_bool(KEEP_TMP) {
            let _ = workdir.keep();
            None
        } else {
            Some(workdir)
        };

        Ok(TestDirs {
            workdir,
            workdir_path,
            logdir,
            outputdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir_path
    }

    /// Removes the scratch directory unless it is being kept.
    pub fn cleanup(self) {
        if let Some(workdir) = self.workdir {
            if let Err(err) = workdir.close() {
                tracing::warn!(?err, "failed to remove test workdir");
            }
        }
    }
}

/// The `AVOCADO_*` environment of a test process.
pub(crate) fn test_environment(runnable: &Runnable, dirs: &TestDirs) -> Vec<(String, String)> {
    let mut env = vec![
        ("AVOCADO_VERSION".to_string(), avocado_utils::VERSION.to_string()),
        (
            "AVOCADO_TEST_WORKDIR".to_string(),
            dirs.workdir().display().to_string(),
        ),
        (
            "AVOCADO_TEST_LOGDIR".to_string(),
            dirs.logdir.display().to_string(),
        ),
        (
            "AVOCADO_TEST_LOGFILE".to_string(),
            dirs.logdir.join("debug.log").display().to_string(),
        ),
        (
            "AVOCADO_TEST_OUTPUTDIR".to_string(),
            dirs.outputdir.display().to_string(),
        ),
    ];
    if let Some(basedir) = runnable
        .uri
        .as_deref()
        .and_then(|uri| Path::new(uri).parent())
    {
        env.push((
            "AVOCADO_TEST_BASEDIR".to_string(),
            in_invocation_dir(basedir).display().to_string(),
        ));
    }
    for (key, value) in runnable.params() {
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        env.push((key, value));
    }
    env.extend(runnable.kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn skip_exit_codes(runnable: &Runnable) -> Vec<i32> {
    match runnable.config_value(SKIP_EXIT_CODES) {
        Some(serde_json::Value::Array(codes)) => codes
            .iter()
            .filter_map(|c| c.as_i64())
            .map(|c| c as i32)
            .collect(),
        Some(code) => code.as_i64().map(|c| vec![c as i32]).unwrap_or_default(),
        None => Vec::new(),
    }
}

/// `path` as seen from the directory the runner was started in. Test
/// processes run in their own workdir, so relative paths must not reach them.
pub(crate) fn in_invocation_dir(path: &Path) -> PathBuf {
    match std::env::current_dir() {
        Ok(cwd) if path.as_os_str().is_empty() => cwd,
        Ok(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    }
}

/// A bare name that is not a file of the invocation directory is left to
/// the `PATH` lookup.
fn executable_path(uri: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(uri);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let local = cwd.join(path);
    if path.components().count() > 1 || local.exists() {
        local
    } else {
        path.to_path_buf()
    }
}

/// Builds the command for an executable runnable.
pub(crate) fn executable_command(
    runnable: &Runnable,
    dirs: &TestDirs,
) -> Result<Command, Finished> {
    let Some(uri) = runnable.uri.as_deref() else {
        return Err(Finished::with_reason(
            Outcome::Error,
            "runnable has no uri to execute",
        ));
    };
    let program = match std::env::current_dir() {
        Ok(cwd) => executable_path(uri, &cwd),
        Err(_) => PathBuf::from(uri),
    };
    let mut cmd = Command::new(program);
    cmd.args(&runnable.args)
        .envs(test_environment(runnable, dirs))
        .current_dir(dirs.workdir());
    Ok(cmd)
}

pub(crate) fn spawn_failure(runnable: &Runnable, err: std::io::Error) -> Finished {
    let mut finished = Finished::with_reason(
        Outcome::Error,
        format!(
            "Failed to execute {}: {err}",
            runnable.uri.as_deref().unwrap_or("<no uri>")
        ),
    );
    finished.fail_class = Some("SpawnError".to_string());
    finished
}

#[async_trait]
impl Runner for ExecTestRunner {
    fn kind(&self) -> &'static str {
        "exec-test"
    }

    fn description(&self) -> &'static str {
        "Runs an executable and uses its exit status as the test result"
    }

    fn configuration_used(&self) -> &'static [&'static str] {
        &[KEEP_TMP, SKIP_EXIT_CODES]
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
        let finished = match supervise(cmd, StdoutHandling::Forward, ctx, sink).await {
            Ok(run) => outcome_from_exit(&run, &skip_exit_codes(runnable)),
            Err(err) => spawn_failure(runnable, err),
        };
        dirs.cleanup();
        finished
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{run_runnable, Interrupt, InterruptTrigger, RunnerRegistry};
    use avocado_test_utils::write_script;
    use avocado_utils::net_protocol::messages::{Message, MessageKind};
    use serde_json::json;
    use std::time::Duration;

    async fn run(
        runnable: Runnable,
        interrupt: Interrupt,
    ) -> (Finished, Vec<Message>) {
        let registry = RunnerRegistry::with_builtin();
        let (sink, mut rx) = MessageSink::channel(None);
        let finished = run_runnable(&registry, &runnable, &RunContext::new(interrupt), &sink).await;
        drop(sink);
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        (finished, messages)
    }

    fn stdout_of(messages: &[Message]) -> String {
        messages
            .iter()
            .filter_map(|m| match &m.kind {
                MessageKind::Stdout { log } => Some(String::from_utf8_lossy(log).into_owned()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn pass_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "env.sh",
            r#"echo "version=$AVOCADO_VERSION"; echo "workdir=$AVOCADO_TEST_WORKDIR"; echo "custom=$CUSTOM""#,
        );
        let runnable = Runnable::new("exec-test", Some(script.display().to_string()))
            .with_kwargs([("CUSTOM".to_string(), "value".to_string())].into());
        let (finished, messages) = run(runnable, Interrupt::never()).await;

        assert_eq!(finished.result, Outcome::Pass);
        assert_eq!(messages.first().unwrap().type_name(), "started");
        assert_eq!(messages.last().unwrap().type_name(), "finished");
        let stdout = stdout_of(&messages);
        assert!(stdout.contains(&format!("version={}", avocado_utils::VERSION)));
        assert!(stdout.contains("workdir=/"));
        assert!(stdout.contains(".avocado-workdir-"));
        assert!(stdout.contains("custom=value"));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn nonzero_exit_fails_unless_configured_skip() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit3.sh", "exit 3");
        let runnable = Runnable::new("exec-test", Some(script.display().to_string()));
        let (finished, _) = run(runnable.clone(), Interrupt::never()).await;
        assert_eq!(finished.result, Outcome::Fail);
        assert_eq!(finished.returncode, Some(3));

        let runnable =
            runnable.with_config([(SKIP_EXIT_CODES.to_string(), json!([3]))].into());
        let (finished, _) = run(runnable, Interrupt::never()).await;
        assert_eq!(finished.result, Outcome::Skip);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn missing_executable_is_an_error() {
        let runnable = Runnable::new("exec-test", Some("/no/such/executable".to_string()));
        let (finished, messages) = run(runnable, Interrupt::never()).await;
        assert_eq!(finished.result, Outcome::Error);
        assert!(finished
            .fail_reason
            .unwrap()
            .starts_with("Failed to execute /no/such/executable"));
        let kinds: Vec<_> = messages.iter().map(Message::type_name).collect();
        assert_eq!(kinds, vec!["started", "finished"]);
    }

    #[test]
    fn relative_uris_are_taken_from_the_invocation_dir() {
        let cwd = Path::new("/jobs/here");
        assert_eq!(
            executable_path("long_sleep.sh", Path::new("/tmp")),
            PathBuf::from("long_sleep.sh")
        );
        assert_eq!(
            executable_path("sub/ok.sh", cwd),
            PathBuf::from("/jobs/here/sub/ok.sh")
        );
        assert_eq!(
            executable_path("./x.sh", cwd),
            PathBuf::from("/jobs/here/./x.sh")
        );
        assert_eq!(executable_path("/bin/true", cwd), PathBuf::from("/bin/true"));

        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "local.sh", "exit 0");
        assert_eq!(
            executable_path("local.sh", dir.path()),
            dir.path().join("local.sh")
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    #[serial_test::serial]
    async fn runs_scripts_relative_to_the_invocation_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "rel.sh", r#"echo "basedir=$AVOCADO_TEST_BASEDIR""#);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_script(&dir.path().join("sub"), "nested.sh", "exit 0");

        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let (bare, messages) = run(
            Runnable::new("exec-test", Some("rel.sh".to_string())),
            Interrupt::never(),
        )
        .await;
        let (nested, _) = run(
            Runnable::new("exec-test", Some("sub/nested.sh".to_string())),
            Interrupt::never(),
        )
        .await;
        std::env::set_current_dir(previous).unwrap();

        assert_eq!(bare.result, Outcome::Pass, "{:?}", bare.fail_reason);
        assert_eq!(nested.result, Outcome::Pass, "{:?}", nested.fail_reason);
        let basedir = std::fs::canonicalize(dir.path()).unwrap();
        let stdout = stdout_of(&messages);
        assert!(
            stdout.contains(&format!("basedir={}\n", basedir.display()))
                || stdout.contains(&format!("basedir={}\n", dir.path().display())),
            "{stdout}"
        );
    }

    #[test]
    fn kept_workdirs_outlive_the_test() {
        let runnable = Runnable::new("exec-test", Some("/bin/true".to_string()));
        let dirs = TestDirs::create(&runnable).unwrap();
        let workdir = dirs.workdir().to_path_buf();
        dirs.cleanup();
        assert!(!workdir.exists());

        let runnable = runnable.with_config([(KEEP_TMP.to_string(), json!(true))].into());
        let dirs = TestDirs::create(&runnable).unwrap();
        let workdir = dirs.workdir().to_path_buf();
        dirs.cleanup();
        assert!(workdir.is_dir());
        std::fs::remove_dir_all(workdir).unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn killed_by_signal() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "suicide.sh", "kill -KILL $$");
        let runnable = Runnable::new("exec-test", Some(script.display().to_string()));
        let (finished, _) = run(runnable, Interrupt::never()).await;
        assert_eq!(finished.result, Outcome::Error);
        assert_eq!(
            finished.fail_reason.as_deref(),
            Some("Test killed by signal SIGKILL")
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn interruption_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep.sh", "exec sleep 30");
        let runnable = Runnable::new("exec-test", Some(script.display().to_string()));
        let (trigger, interrupt): (InterruptTrigger, Interrupt) = Interrupt::pair();
        let fire = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.trigger();
        });
        let (finished, _) = run(runnable, interrupt).await;
        fire.await.unwrap();
        assert_eq!(finished.result, Outcome::Interrupted);
    }
}
