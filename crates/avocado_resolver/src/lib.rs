//! Turns textual test references into runnables.

mod builtin;
pub mod python;
pub mod reference;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use avocado_utils::runnable::Runnable;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use builtin::{
    AvocadoInstrumentedResolver, ExecTestResolver, PythonUnittestResolver, RecipeResolver,
    TapResolver,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionResult {
    Success,
    NotFound,
    Error,
    /// The resolver recognized the reference but the resource is malformed.
    Corrupt,
}

impl fmt::Display for ResolutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionResult::Success => "SUCCESS",
            ResolutionResult::NotFound => "NOTFOUND",
            ResolutionResult::Error => "ERROR",
            ResolutionResult::Corrupt => "CORRUPT",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReferenceResolution {
    pub reference: String,
    pub result: ResolutionResult,
    pub resolutions: Vec<Runnable>,
    pub origin: Option<String>,
    pub info: Option<String>,
}

impl ReferenceResolution {
    pub fn success(reference: impl Into<String>, resolutions: Vec<Runnable>) -> Self {
        Self {
            reference: reference.into(),
            result: ResolutionResult::Success,
            resolutions,
            origin: None,
            info: None,
        }
    }

    pub fn failure(
        reference: impl Into<String>,
        result: ResolutionResult,
        info: impl Into<String>,
    ) -> Self {
        Self {
            reference: reference.into(),
            result,
            resolutions: Vec::new(),
            origin: None,
            info: Some(info.into()),
        }
    }

    pub fn not_found(reference: impl Into<String>, info: impl Into<String>) -> Self {
        Self::failure(reference, ResolutionResult::NotFound, info)
    }

    pub fn is_success(&self) -> bool {
        self.result == ResolutionResult::Success
    }
}

/// A resolver recognizes references of one test kind.
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn resolve(&self, reference: &str) -> ReferenceResolution;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    VeryLow,
    Low,
    Normal,
    High,
    VeryHigh,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "very_low" => Ok(Priority::VeryLow),
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "very_high" => Ok(Priority::VeryHigh),
            other => Err(format!("unknown resolver priority {other:?}")),
        }
    }
}

struct Registered {
    name: String,
    resolver: Box<dyn Resolver>,
    priority: Priority,
    seq: usize,
}

/// Ordered set of resolvers. Application order is priority descending,
/// then registration order.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: Vec<Registered>,
    next_seq: usize,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in resolver.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("runnable-recipe", Box::new(RecipeResolver), Priority::High);
        registry.register(
            "avocado-instrumented",
            Box::new(AvocadoInstrumentedResolver),
            Priority::Normal,
        );
        registry.register(
            "python-unittest",
            Box::new(PythonUnittestResolver),
            Priority::Normal,
        );
        registry.register("tap", Box::new(TapResolver), Priority::Normal);
        registry.register("exec-test", Box::new(ExecTestResolver), Priority::Normal);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        resolver: Box<dyn Resolver>,
        priority: Priority,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.resolvers.push(Registered {
            name: name.into(),
            resolver,
            priority,
            seq,
        });
        self.sort();
    }

    /// Changes the priority of an already registered resolver.
    /// Returns false if no resolver has that name.
    pub fn set_priority(&mut self, name: &str, priority: Priority) -> bool {
        let Some(registered) = self.resolvers.iter_mut().find(|r| r.name == name) else {
            return false;
        };
        registered.priority = priority;
        self.sort();
        true
    }

    fn sort(&mut self) {
        self.resolvers
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resolvers.iter().map(|r| r.name.as_str())
    }

    /// Runs resolvers in order until one succeeds.
    ///
    /// Without a success, a CORRUPT result wins over an ERROR, which wins
    /// over NOTFOUND. A NOTFOUND result carries every resolver's info.
    pub fn resolve(&self, reference: &str) -> ReferenceResolution {
        let mut corrupt = None;
        let mut error = None;
        let mut not_found_info = Vec::new();

        for registered in &self.resolvers {
            let mut resolution = registered.resolver.resolve(reference);
            resolution.origin.get_or_insert_with(|| registered.name.clone());

            tracing::trace!(
                reference,
                resolver = %registered.name,
                result = %resolution.result,
                "resolver answered"
            );

            match resolution.result {
                ResolutionResult::Success => return resolution,
                ResolutionResult::Corrupt => {
                    corrupt.get_or_insert(resolution);
                }
                ResolutionResult::Error => {
                    error.get_or_insert(resolution);
                }
                ResolutionResult::NotFound => {
                    if let Some(info) = resolution.info {
                        not_found_info.push(format!("{}: {}", registered.name, info));
                    }
                }
            }
        }

        if let Some(resolution) = corrupt.or(error) {
            return resolution;
        }
        ReferenceResolution::not_found(reference, not_found_info.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Unable to resolve reference(s) '{}'", .0.join("', '"))]
    Missing(Vec<String>),
    #[error("Reference {reference:?} is corrupt: {info}")]
    Corrupt { reference: String, info: String },
}

/// Expands a directory into the non-hidden files below it, in sorted
/// walk order. Anything else is returned unchanged.
pub fn expand_directory(reference: &str) -> Vec<String> {
    let path = Path::new(reference);
    if !path.is_dir() {
        return vec![reference.to_string()];
    }

    let walker = walkdir::WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

    let files: Vec<String> = walker
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().display().to_string())
        .collect();

    if files.is_empty() {
        vec![reference.to_string()]
    } else {
        files
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

/// The outcome of resolving all references of a suite.
#[derive(Debug, Default)]
pub struct Resolved {
    pub resolutions: Vec<ReferenceResolution>,
    /// Original references that produced no runnable.
    pub missing: Vec<String>,
}

impl Resolved {
    pub fn runnables(&self) -> impl Iterator<Item = &Runnable> {
        self.resolutions
            .iter()
            .filter(|r| r.is_success())
            .flat_map(|r| r.resolutions.iter())
    }

    pub fn into_runnables(self) -> Vec<Runnable> {
        self.resolutions
            .into_iter()
            .filter(|r| r.is_success())
            .flat_map(|r| r.resolutions)
            .collect()
    }
}

/// Resolves every reference, expanding directories first.
///
/// Corrupt resources are always reported. References that resolve to
/// nothing are an error unless `ignore_missing` is set.
pub fn resolve_references(
    registry: &ResolverRegistry,
    references: &[String],
    ignore_missing: bool,
) -> Result<Resolved, ResolverError> {
    let mut resolved = Resolved::default();

    for reference in references {
        let mut any_success = false;
        for expanded in expand_directory(reference) {
            let resolution = registry.resolve(&expanded);
            match resolution.result {
                ResolutionResult::Success => any_success = true,
                ResolutionResult::Corrupt if !ignore_missing => {
                    return Err(ResolverError::Corrupt {
                        reference: resolution.reference,
                        info: resolution.info.unwrap_or_default(),
                    });
                }
                _ => {}
            }
            resolved.resolutions.push(resolution);
        }
        if !any_success {
            resolved.missing.push(reference.clone());
        }
    }

    if !resolved.missing.is_empty() {
        if ignore_missing {
            tracing::warn!(missing = ?resolved.missing, "ignoring unresolved references");
        } else {
            return Err(ResolverError::Missing(resolved.missing));
        }
    }

    Ok(resolved)
}
