use avocado_resolver::{resolve_references, ReferenceResolution, ResolverError, ResolverRegistry};
use avocado_runners::RunnerRegistry;
use avocado_utils::runnable::{ConfigMap, Runnable};
use serde_derive::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuiteStatus {
    ResolutionNotStarted,
    TestsFound,
    TestsNotFound,
    Unknown,
}

/// An ordered, named list of runnables sharing a config.
#[derive(Debug, Clone)]
pub struct TestSuite {
    pub name: String,
    /// Suite-level settings as dotted keys. Once part of a job, the job
    /// settings are merged underneath.
    pub config: ConfigMap,
    pub tests: Vec<Runnable>,
    /// How each reference was resolved, when built from references.
    pub resolutions: Vec<ReferenceResolution>,
    pub status: SuiteStatus,
}

impl TestSuite {
    pub fn new(name: impl Into<String>, config: ConfigMap) -> Self {
        Self {
            name: name.into(),
            config,
            tests: Vec::new(),
            resolutions: Vec::new(),
            status: SuiteStatus::ResolutionNotStarted,
        }
    }

    pub fn with_tests(mut self, tests: Vec<Runnable>) -> Self {
        self.status = if tests.is_empty() {
            SuiteStatus::TestsNotFound
        } else {
            SuiteStatus::TestsFound
        };
        self.tests = tests;
        self
    }

    /// Resolves `references` into the suite's tests.
    pub fn from_references(
        name: impl Into<String>,
        config: ConfigMap,
        references: &[String],
        resolvers: &ResolverRegistry,
        ignore_missing: bool,
    ) -> Result<Self, ResolverError> {
        let resolved = resolve_references(resolvers, references, ignore_missing)?;
        let tests = resolved.runnables().cloned().collect();
        let mut suite = Self::new(name, config).with_tests(tests);
        suite.resolutions = resolved.resolutions;
        tracing::debug!(suite = %suite.name, tests = suite.size(), "suite resolved");
        Ok(suite)
    }

    pub fn size(&self) -> usize {
        self.tests.len()
    }

    /// Lays `base` under the suite's own settings.
    pub(crate) fn merge_config(&mut self, base: &ConfigMap) {
        let mut config = base.clone();
        config.extend(std::mem::take(&mut self.config));
        self.config = config;
    }

    /// Gives every runnable the settings its runner reads. Settings already
    /// carried by a runnable, such as those of a recipe, are kept.
    ///
    /// Returns the first kind no runner handles.
    pub(crate) fn configure_runnables(&mut self, runners: &RunnerRegistry) -> Result<(), String> {
        let config = &self.config;
        for runnable in &mut self.tests {
            *runnable = configured(runnable, config, runners)?;
        }
        Ok(())
    }
}

fn configured(
    runnable: &Runnable,
    config: &ConfigMap,
    runners: &RunnerRegistry,
) -> Result<Runnable, String> {
    let Some(runner) = runners.get(&runnable.kind) else {
        return Err(runnable.kind.clone());
    };
    let mut runnable_config = runnable.config.clone();
    for key in runner.configuration_used() {
        if let Some(value) = config.get(*key) {
            runnable_config
                .entry(key.to_string())
                .or_insert_with(|| value.clone());
        }
    }
    let dependencies = runnable
        .dependencies
        .iter()
        .map(|dependency| configured(dependency, config, runners))
        .collect::<Result<_, _>>()?;

    let mut runnable = runnable.clone().with_config(runnable_config);
    runnable.dependencies = dependencies;
    Ok(runnable)
}
