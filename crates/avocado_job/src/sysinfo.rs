//! System information collected around a job, under `<logdir>/sysinfo/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use avocado_utils::fs_safe::to_path_component;
use tokio::process::Command;

use crate::settings::SysinfoSettings;

pub const SYSINFO_DIR: &str = "sysinfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    fn dir_name(self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
        }
    }
}

/// `uname -a` is stored as `uname_-a`.
fn command_file_name(command: &str) -> String {
    to_path_component(&command.trim().replace(' ', "_"))
}

/// Runs the configured commands and copies the configured files into
/// `sysinfo/<phase>`. Individual failures are logged and skipped.
pub async fn collect(
    logdir: &Path,
    phase: Phase,
    settings: &SysinfoSettings,
    timeout: Duration,
) -> io::Result<PathBuf> {
    let base = logdir.join(SYSINFO_DIR);
    let dir = base.join(phase.dir_name());
    fs::create_dir_all(&dir)?;
    fs::create_dir_all(base.join("profile"))?;

    for command in &settings.commands {
        match run_command(command, timeout).await {
            Ok(output) => {
                if let Err(error) = fs::write(dir.join(command_file_name(command)), output) {
                    tracing::warn!(%command, %error, "failed to store sysinfo output");
                }
            }
            Err(error) => tracing::warn!(%command, %error, "sysinfo command failed"),
        }
    }

    for file in &settings.files {
        let Some(name) = file.file_name() else {
            continue;
        };
        match fs::read(file) {
            Ok(contents) => {
                if let Err(error) = fs::write(dir.join(name), contents) {
                    tracing::warn!(file = %file.display(), %error, "failed to store sysinfo file");
                }
            }
            Err(error) => tracing::debug!(file = %file.display(), %error, "sysinfo file not readable"),
        }
    }

    tracing::debug!(dir = %dir.display(), "sysinfo collected");
    Ok(dir)
}

async fn run_command(command: &str, timeout: Duration) -> io::Result<Vec<u8>> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?.stdout),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out after {timeout:?}"),
        )),
    }
}
