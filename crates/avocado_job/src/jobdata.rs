//! How a job was invoked, kept under `<logdir>/jobdata/`.

use std::fs;
use std::io;
use std::path::Path;

use avocado_utils::runnable::{ConfigMap, Variant};
use serde_derive::Serialize;

use crate::suite::TestSuite;

pub const JOBDATA_DIR: &str = "jobdata";

#[derive(Serialize, Debug, Clone, Default)]
pub struct JobData {
    pub references: Vec<String>,
    /// The parsed command line arguments.
    pub args: serde_json::Value,
    /// The raw command line.
    pub cmdline: Vec<String>,
}

/// Writes `pwd`, `references`, `args`, `config`, `cmdline` and `variants`.
pub fn write(
    logdir: &Path,
    data: &JobData,
    config: &ConfigMap,
    suites: &[TestSuite],
) -> io::Result<()> {
    let dir = logdir.join(JOBDATA_DIR);
    fs::create_dir_all(&dir)?;

    let pwd = std::env::current_dir()?;
    fs::write(dir.join("pwd"), format!("{}\n", pwd.display()))?;
    fs::write(dir.join("references"), serde_json::to_vec_pretty(&data.references)?)?;
    fs::write(dir.join("args"), serde_json::to_vec_pretty(&data.args)?)?;
    fs::write(dir.join("config"), serde_json::to_vec_pretty(config)?)?;
    fs::write(dir.join("cmdline"), format!("{}\n", data.cmdline.join(" ")))?;

    let mut variants: Vec<&Variant> = Vec::new();
    for variant in suites
        .iter()
        .flat_map(|s| &s.tests)
        .filter_map(|t| t.variant.as_ref())
    {
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    fs::write(dir.join("variants"), serde_json::to_vec_pretty(&variants)?)?;
    Ok(())
}
