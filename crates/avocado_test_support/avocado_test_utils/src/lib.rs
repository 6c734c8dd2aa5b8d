use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use regex::Regex;

pub mod color_writer;

/// Writes a `/bin/sh` script with the executable bit set.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}

/// Whether a `python3` interpreter is on the PATH. Python-backed tests skip themselves without one.
pub fn python3_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

/// Replaces the parts of CLI output that vary between runs.
pub fn sanitize_output(s: &str) -> String {
    static JOB_DIR: OnceLock<Regex> = OnceLock::new();
    static UUID: OnceLock<Regex> = OnceLock::new();
    static ELAPSED: OnceLock<Regex> = OnceLock::new();

    let job_dir = JOB_DIR.get_or_init(|| {
        Regex::new(r"job-\d{4}-\d{2}-\d{2}T\d{2}\.\d{2}-\d{2}-[0-9a-f]{7}").unwrap()
    });
    let uuid = UUID.get_or_init(|| {
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
    });
    let elapsed = ELAPSED.get_or_init(|| Regex::new(r"\d+\.\d+ s").unwrap());

    let s = job_dir.replace_all(s, "job-<timestamp>-<shortid>");
    let s = uuid.replace_all(&s, "<uuid>");
    elapsed.replace_all(&s, "<elapsed> s").into_owned()
}
