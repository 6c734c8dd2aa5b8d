use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use avocado_utils::fs_safe::to_path_component;
use avocado_utils::net_protocol::task::{TaskCategory, TaskRecipe};
use avocado_utils::runnable::Runnable;

/// Identity of a task within a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id of the `index`th test (1-based) of a job.
    ///
    /// `suite` is given as `(suite index, suite name)` when a job runs
    /// more than one suite, and prefixes the id.
    pub fn for_test(index: usize, runnable: &Runnable, suite: Option<(usize, &str)>) -> Self {
        let mut id = String::new();
        if let Some((suite_index, suite_name)) = suite {
            id.push_str(&format!("{suite_index}-{suite_name}-"));
        }
        id.push_str(&index.to_string());
        id.push('-');
        id.push_str(runnable.uri.as_deref().unwrap_or(&runnable.kind));
        if let Some(variant_id) = runnable.variant.as_ref().and_then(|v| v.variant_id.as_ref()) {
            id.push(';');
            id.push_str(variant_id);
        }
        Self::new(id)
    }

    /// Dependencies are shared between tests, so their id derives from their content.
    pub fn for_dependency(runnable: &Runnable) -> Self {
        let hash = runnable.identity().to_string();
        Self::new(format!("dependency-{}-{}", &hash[..12], runnable.kind))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id in a form usable as a single path component.
    pub fn fs_safe(&self) -> String {
        to_path_component(&self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A runnable bound to an identity and its place in the job's dependency graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub recipe: TaskRecipe,
    /// Tasks that must finish with `pass` before this one may start.
    pub dependencies: Vec<TaskId>,
}

impl Task {
    pub fn new(id: TaskId, runnable: Runnable, category: TaskCategory) -> Self {
        let recipe = TaskRecipe {
            id: id.to_string(),
            job_id: None,
            runnable,
            status_uris: Vec::new(),
            category,
        };
        Self {
            id,
            recipe,
            dependencies: Vec::new(),
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.recipe.job_id = Some(job_id.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn runnable(&self) -> &Runnable {
        &self.recipe.runnable
    }

    pub fn category(&self) -> TaskCategory {
        self.recipe.category
    }

    pub fn is_test(&self) -> bool {
        self.category() == TaskCategory::Test
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use avocado_utils::runnable::Variant;

    #[test]
    fn test_ids() {
        let runnable = Runnable::new("exec-test", Some("/bin/true".to_string()));
        assert_eq!(TaskId::for_test(1, &runnable, None).as_str(), "1-/bin/true");
        assert_eq!(
            TaskId::for_test(3, &runnable, Some((2, "suite"))).as_str(),
            "2-suite-3-/bin/true"
        );
        assert_eq!(TaskId::for_test(1, &runnable, None).fs_safe(), "1-_bin_true");

        let noop = Runnable::new("noop", None);
        assert_eq!(TaskId::for_test(1, &noop, None).as_str(), "1-noop");
    }

    #[test]
    fn variant_suffix() {
        let runnable = Runnable::new("exec-test", Some("t.sh".to_string())).with_variant(Some(
            Variant {
                paths: vec!["/".to_string()],
                variant: Vec::new(),
                variant_id: Some("small-1a2b".to_string()),
            },
        ));
        assert_eq!(
            TaskId::for_test(1, &runnable, None).as_str(),
            "1-t.sh;small-1a2b"
        );
    }

    #[test]
    fn dependency_ids_follow_content() {
        let a = Runnable::new("exec-test", Some("/bin/true".to_string()));
        let b = Runnable::new("exec-test", Some("/bin/false".to_string()));
        assert_eq!(TaskId::for_dependency(&a), TaskId::for_dependency(&a.clone()));
        assert_ne!(TaskId::for_dependency(&a), TaskId::for_dependency(&b));
        assert!(TaskId::for_dependency(&a).as_str().starts_with("dependency-"));
    }
}
