//! Runs tests written against the `avocado.Test` base class.
//!
//! The test executes in a Python child running a small harness. The
//! harness imports the module, instantiates the class and drives
//! `run_avocado()`, speaking the message protocol on its stdout; the
//! test's own stdout and stderr are captured by the harness and arrive
//! as `stdout`/`stderr` messages.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use avocado_utils::net_protocol::messages::{Finished, Outcome};
use avocado_utils::runnable::Runnable;
use parking_lot::Mutex;
use serde_derive::Serialize;
use tokio::process::Command;

use crate::exec_test::{in_invocation_dir, spawn_failure, test_environment, TestDirs, KEEP_TMP};
use crate::process::{signal_name, supervise, StdoutHandling};
use crate::python_unittest::{python_interpreter, split_python_uri, PYTHON};
use crate::{MessageSink, RunContext, Runner};

const HARNESS: &str = include_str!("harness/avocado_harness.py");
const SHIM_INIT: &str = include_str!("harness/avocado/__init__.py");
const SHIM_CORE_INIT: &str = include_str!("harness/avocado/core/__init__.py");
const SHIM_CORE_TEST: &str = include_str!("harness/avocado/core/test.py");

const RECIPE_ENV: &str = "AVOCADO_HARNESS_RECIPE";

pub struct AvocadoInstrumentedRunner;

/// What the harness needs to locate and instantiate the test.
#[derive(Serialize)]
struct HarnessRecipe<'a> {
    module_path: String,
    class: &'a str,
    method: &'a str,
    name: &'a str,
    params: serde_json::Map<String, serde_json::Value>,
    tags: &'a avocado_utils::runnable::Tags,
    config: &'a avocado_utils::runnable::ConfigMap,
    logdir: String,
    outputdir: String,
    workdir: String,
}

/// Lays out the harness and the `avocado` package it provides.
fn install_harness(dir: &Path) -> std::io::Result<()> {
    let core = dir.join("avocado").join("core");
    std::fs::create_dir_all(&core)?;
    std::fs::write(dir.join("avocado_harness.py"), HARNESS)?;
    std::fs::write(dir.join("avocado").join("__init__.py"), SHIM_INIT)?;
    std::fs::write(core.join("__init__.py"), SHIM_CORE_INIT)?;
    std::fs::write(core.join("test.py"), SHIM_CORE_TEST)?;
    Ok(())
}

fn malformed(uri: &str) -> Finished {
    Finished::with_reason(
        Outcome::Error,
        format!("invalid avocado-instrumented uri {uri:?}: expected <module path>:<class>.<method>"),
    )
}

#[async_trait]
impl Runner for AvocadoInstrumentedRunner {
    fn kind(&self) -> &'static str {
        "avocado-instrumented"
    }

    fn description(&self) -> &'static str {
        "Runs a test method of a class inheriting from avocado.Test"
    }

    fn configuration_used(&self) -> &'static [&'static str] {
        &[KEEP_TMP, PYTHON]
    }

    async fn run(&self, runnable: &Runnable, ctx: &RunContext, sink: &MessageSink) -> Finished {
        let uri = runnable.uri.as_deref().unwrap_or_default();
        let Some((module_path, test)) = split_python_uri(uri) else {
            return malformed(uri);
        };
        let Some((class, method)) = test.split_once('.') else {
            return malformed(uri);
        };
        if class.is_empty() || method.is_empty() {
            return malformed(uri);
        }

        let dirs = match TestDirs::create(runnable) {
            Ok(dirs) => dirs,
            Err(err) => return spawn_failure(runnable, err),
        };
        let harness_dir = dirs.workdir().join(".harness");
        if let Err(err) = install_harness(&harness_dir) {
            dirs.cleanup();
            return spawn_failure(runnable, err);
        }

        let module_path = in_invocation_dir(module_path);
        let recipe = HarnessRecipe {
            module_path: module_path.display().to_string(),
            class,
            method,
            name: uri,
            params: runnable.params().into_iter().collect(),
            tags: &runnable.tags,
            config: &runnable.config,
            logdir: dirs.logdir.display().to_string(),
            outputdir: dirs.outputdir.display().to_string(),
            workdir: dirs.workdir().display().to_string(),
        };
        let recipe = match serde_json::to_string(&recipe) {
            Ok(recipe) => recipe,
            Err(err) => {
                dirs.cleanup();
                return Finished::with_reason(Outcome::Error, err.to_string());
            }
        };

        let mut pythonpath = harness_dir.display().to_string();
        if let Some(module_dir) = module_path.parent() {
            pythonpath.push(':');
            pythonpath.push_str(&module_dir.display().to_string());
        }

        let mut cmd = Command::new(python_interpreter(runnable));
        cmd.arg("-u")
            .arg(harness_dir.join("avocado_harness.py"))
            .envs(test_environment(runnable, &dirs))
            .env(RECIPE_ENV, recipe)
            .env("PYTHONPATH", pythonpath)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .current_dir(dirs.workdir());

        let slot = Arc::new(Mutex::new(None));
        let result = supervise(cmd, StdoutHandling::Protocol(slot.clone()), ctx, sink).await;
        dirs.cleanup();
        let run = match result {
            Ok(run) => run,
            Err(err) => return spawn_failure(runnable, err),
        };

        if let Some(finished) = slot.lock().take() {
            return finished;
        }
        if run.interrupted {
            return Finished::with_reason(Outcome::Interrupted, "Test interrupted by SIGTERM");
        }
        let reason = match (run.status.code(), run.status.signal()) {
            (_, Some(signal)) => format!(
                "Test process killed by signal {} before reporting a result",
                signal_name(signal)
            ),
            (Some(code), _) => {
                format!("Test process exited with status {code} before reporting a result")
            }
            _ => "Test process ended before reporting a result".to_string(),
        };
        let mut finished = Finished::with_reason(Outcome::Error, reason);
        finished.returncode = run.status.code();
        finished
    }
}
