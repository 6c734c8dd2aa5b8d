//! The [Runnable] value type and its JSON recipe form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type Tags = BTreeMap<String, BTreeSet<String>>;

/// Dotted configuration keys (`runner.exectest.exitcodes.skip`) to values.
pub type ConfigMap = BTreeMap<String, Value>;

/// One `(path, key, value)` leaf of a variant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VariantParam(pub String, pub String, pub Value);

/// A node of a variant: the node path and the parameters it contributes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VariantNode(pub String, pub Vec<VariantParam>);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Variant {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub variant: Vec<VariantNode>,
    #[serde(default)]
    pub variant_id: Option<String>,
}

/// Immutable description of one unit of work.
///
/// Runnables are shared between the suite that owns them and the tasks
/// that execute them; modifying one means building a new value through
/// the `with_*` methods.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Runnable {
    pub kind: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, String>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub variant: Option<Variant>,
    /// Runnables that must run and pass before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Runnable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

/// Content hash of a runnable, used to share identical dependency runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunnableHash(pub [u8; 32]);

impl fmt::Display for RunnableHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("recipe is not valid JSON: {0}")]
    Syntax(serde_json::Error),
    #[error("recipe does not describe a runnable: {0}")]
    Schema(serde_json::Error),
    #[error("recipe must be a JSON object or an array of objects")]
    NotAnObject,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Runnable {
    pub fn new(kind: impl Into<String>, uri: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            uri,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            config: ConfigMap::new(),
            tags: Tags::new(),
            variant: None,
            dependencies: Vec::new(),
            output_dir: None,
        }
    }

    pub fn with_args(self, args: Vec<String>) -> Self {
        Self { args, ..self }
    }

    pub fn with_kwargs(self, kwargs: BTreeMap<String, String>) -> Self {
        Self { kwargs, ..self }
    }

    pub fn with_tags(self, tags: Tags) -> Self {
        Self { tags, ..self }
    }

    pub fn with_config(self, config: ConfigMap) -> Self {
        Self { config, ..self }
    }

    pub fn with_variant(self, variant: Option<Variant>) -> Self {
        Self { variant, ..self }
    }

    pub fn with_output_dir(self, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Some(output_dir.into()),
            ..self
        }
    }

    /// Hash over the canonical JSON form. Maps are ordered, so equal
    /// runnables always hash equal.
    pub fn identity(&self) -> RunnableHash {
        // Serializing plain data into a Vec cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        RunnableHash(*blake3::hash(&bytes).as_bytes())
    }

    /// Flattens the variant into `key -> value`; later nodes win.
    pub fn params(&self) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();
        if let Some(variant) = &self.variant {
            for VariantNode(_, leaves) in &variant.variant {
                for VariantParam(_, key, value) in leaves {
                    params.insert(key.clone(), value.clone());
                }
            }
        }
        params
    }

    /// Looks up a dotted config key.
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn config_bool(&self, key: &str) -> bool {
        self.config_value(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn to_recipe(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_recipe_str(recipe: &str) -> Result<Runnable, RecipeError> {
        serde_json::from_str(recipe).map_err(RecipeError::Schema)
    }

    /// Loads either a single runnable or an array of runnables.
    pub fn many_from_recipe_str(recipe: &str) -> Result<Vec<Runnable>, RecipeError> {
        let value: Value = serde_json::from_str(recipe).map_err(RecipeError::Syntax)?;
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(RecipeError::Schema))
                .collect(),
            object @ Value::Object(_) => Ok(vec![
                serde_json::from_value(object).map_err(RecipeError::Schema)?
            ]),
            _ => Err(RecipeError::NotAnObject),
        }
    }

    pub fn many_from_recipe_file(path: &Path) -> Result<Vec<Runnable>, RecipeError> {
        let contents = std::fs::read_to_string(path)?;
        Self::many_from_recipe_str(&contents)
    }
}

impl fmt::Display for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uri {
            Some(uri) => write!(f, "<Runnable kind='{}' uri='{}'>", self.kind, uri),
            None => write!(f, "<Runnable kind='{}'>", self.kind),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{RecipeError, Runnable, Variant, VariantNode, VariantParam};
    use serde_json::json;

    fn sample() -> Runnable {
        Runnable::new("exec-test", Some("/bin/true".to_string()))
            .with_args(vec!["-v".to_string()])
            .with_tags([("fast".to_string(), Default::default())].into())
            .with_config([("run.keep_tmp".to_string(), json!(true))].into())
    }

    #[test]
    fn recipe_round_trip_is_equal() {
        let runnable = sample().with_variant(Some(Variant {
            paths: vec!["/run/*".to_string()],
            variant: vec![VariantNode(
                "/run/a".to_string(),
                vec![VariantParam("/run/a".to_string(), "x".to_string(), json!(1))],
            )],
            variant_id: Some("a-1234".to_string()),
        }));
        let recipe = runnable.to_recipe();
        let back = Runnable::from_recipe_str(&recipe).unwrap();
        assert_eq!(runnable, back);
        assert_eq!(runnable.identity(), back.identity());
    }

    #[test]
    fn identity_changes_with_content() {
        let a = sample();
        let b = sample().with_args(vec!["-q".to_string()]);
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Runnable::many_from_recipe_str(r#"{"kind": "noop", "bogus": 1}"#).unwrap_err();
        assert!(matches!(err, RecipeError::Schema(_)));
    }

    #[test]
    fn array_recipes() {
        let runnables =
            Runnable::many_from_recipe_str(r#"[{"kind": "noop"}, {"kind": "exec-test", "uri": "/bin/true"}]"#)
                .unwrap();
        assert_eq!(runnables.len(), 2);
        assert_eq!(runnables[1].uri.as_deref(), Some("/bin/true"));
    }

    #[test]
    fn scalar_recipe_is_rejected() {
        assert!(matches!(
            Runnable::many_from_recipe_str("3"),
            Err(RecipeError::NotAnObject)
        ));
    }

    #[test]
    fn params_flatten_variant() {
        let runnable = sample().with_variant(Some(Variant {
            paths: vec![],
            variant: vec![
                VariantNode(
                    "/run/a".into(),
                    vec![VariantParam("/run/a".into(), "sleep".into(), json!(1))],
                ),
                VariantNode(
                    "/run/b".into(),
                    vec![VariantParam("/run/b".into(), "sleep".into(), json!(2))],
                ),
            ],
            variant_id: None,
        }));
        assert_eq!(runnable.params()["sleep"], json!(2));
    }
}
