use avocado_utils::runnable::Runnable;
use regex::Regex;

use crate::python::{find_avocado_tests, find_python_unittests, PyModule, TestClass};
use crate::reference::{check_file, split, FileCheck};
use crate::{ReferenceResolution, ResolutionResult, Resolver};

/// JSON recipes holding one runnable or an array of them.
pub struct RecipeResolver;

impl Resolver for RecipeResolver {
    fn name(&self) -> &'static str {
        "runnable-recipe"
    }

    fn description(&self) -> &'static str {
        "Runnables from JSON recipe files"
    }

    fn resolve(&self, reference: &str) -> ReferenceResolution {
        let readable = FileCheck::Readable {
            suffix: Some(".json"),
        };
        if let Err(not_found) = check_file(reference, reference, readable) {
            return not_found;
        }
        match Runnable::many_from_recipe_file(reference.as_ref()) {
            Ok(runnables) if runnables.is_empty() => {
                ReferenceResolution::not_found(reference, "recipe holds no runnables")
            }
            Ok(runnables) => ReferenceResolution::success(reference, runnables),
            Err(err) => ReferenceResolution::failure(
                reference,
                ResolutionResult::Corrupt,
                format!("invalid recipe \"{reference}\": {err}"),
            ),
        }
    }
}

/// Executables whose exit code is the test result.
pub struct ExecTestResolver;

impl Resolver for ExecTestResolver {
    fn name(&self) -> &'static str {
        "exec-test"
    }

    fn description(&self) -> &'static str {
        "Test resolver for executable files to be handled as tests"
    }

    fn resolve(&self, reference: &str) -> ReferenceResolution {
        if let Err(not_found) = check_file(reference, reference, FileCheck::Executable) {
            return not_found;
        }
        ReferenceResolution::success(
            reference,
            vec![Runnable::new("exec-test", Some(reference.to_string()))],
        )
    }
}

/// Executables named `*.t` or `*.tap` whose stdout is TAP.
pub struct TapResolver;

const TAP_SUFFIXES: [&str; 2] = [".t", ".tap"];

impl Resolver for TapResolver {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn description(&self) -> &'static str {
        "Test resolver for executables producing Test Anything Protocol output"
    }

    fn resolve(&self, reference: &str) -> ReferenceResolution {
        if !TAP_SUFFIXES.iter().any(|suffix| reference.ends_with(suffix)) {
            return ReferenceResolution::not_found(
                reference,
                format!("File path \"{reference}\" does not end with \".t\" or \".tap\""),
            );
        }
        if let Err(not_found) = check_file(reference, reference, FileCheck::Executable) {
            return not_found;
        }
        ReferenceResolution::success(
            reference,
            vec![Runnable::new("tap", Some(reference.to_string()))],
        )
    }
}

pub struct AvocadoInstrumentedResolver;

impl Resolver for AvocadoInstrumentedResolver {
    fn name(&self) -> &'static str {
        "avocado-instrumented"
    }

    fn description(&self) -> &'static str {
        "Test resolver for Avocado Instrumented tests"
    }

    fn resolve(&self, reference: &str) -> ReferenceResolution {
        python_resolver(self.name(), reference, find_avocado_tests)
    }
}

pub struct PythonUnittestResolver;

impl Resolver for PythonUnittestResolver {
    fn name(&self) -> &'static str {
        "python-unittest"
    }

    fn description(&self) -> &'static str {
        "Test resolver for Python Unittests"
    }

    fn resolve(&self, reference: &str) -> ReferenceResolution {
        python_resolver(self.name(), reference, find_python_unittests)
    }
}

fn python_resolver(
    kind: &str,
    reference: &str,
    find_tests: fn(&PyModule) -> Vec<TestClass>,
) -> ReferenceResolution {
    let (module_path, filter) = split(reference);
    let filter = match filter.map(Regex::new).transpose() {
        Ok(filter) => filter,
        Err(err) => {
            return ReferenceResolution::failure(
                reference,
                ResolutionResult::Error,
                format!("invalid test filter: {err}"),
            )
        }
    };

    let readable = FileCheck::Readable {
        suffix: Some(".py"),
    };
    if let Err(not_found) = check_file(module_path, reference, readable) {
        return not_found;
    }

    let source = match std::fs::read(module_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            return ReferenceResolution::failure(
                reference,
                ResolutionResult::Error,
                format!("failed to read \"{module_path}\": {err}"),
            )
        }
    };
    let module = PyModule::parse(&source);

    let mut runnables = Vec::new();
    for class in find_tests(&module) {
        for method in class.methods {
            let class_method = format!("{}.{}", class.name, method.name);
            if let Some(filter) = &filter {
                if !filter.is_match(&class_method) {
                    continue;
                }
            }
            let mut runnable =
                Runnable::new(kind, Some(format!("{module_path}:{class_method}")))
                    .with_tags(method.tags);
            runnable.dependencies = method.dependencies;
            runnables.push(runnable);
        }
    }

    if runnables.is_empty() {
        ReferenceResolution::not_found(
            reference,
            format!("no {kind} tests found in \"{module_path}\""),
        )
    } else {
        ReferenceResolution::success(reference, runnables)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ResolverRegistry;
    use avocado_test_utils::write_script;
    use indoc::indoc;

    const PASSTEST: &str = indoc! {r#"
        #!/usr/bin/env python3
        from avocado import Test


        class PassTest(Test):
            def test(self):
                pass

            def test_other(self):
                pass
    "#};

    #[test]
    fn instrumented_with_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passtest.py");
        std::fs::write(&path, PASSTEST).unwrap();
        let path = path.to_str().unwrap();

        let all = AvocadoInstrumentedResolver.resolve(path);
        assert!(all.is_success());
        assert_eq!(all.resolutions.len(), 2);
        assert_eq!(
            all.resolutions[0].uri.as_deref(),
            Some(format!("{path}:PassTest.test").as_str())
        );

        let filtered = AvocadoInstrumentedResolver.resolve(&format!("{path}:other$"));
        assert_eq!(filtered.resolutions.len(), 1);
        assert_eq!(
            filtered.resolutions[0].uri.as_deref(),
            Some(format!("{path}:PassTest.test_other").as_str())
        );

        let nothing = AvocadoInstrumentedResolver.resolve(&format!("{path}:NoSuch"));
        assert_eq!(nothing.result, ResolutionResult::NotFound);
    }

    #[test]
    fn bad_filter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passtest.py");
        std::fs::write(&path, PASSTEST).unwrap();
        let resolution =
            AvocadoInstrumentedResolver.resolve(&format!("{}:(", path.to_str().unwrap()));
        assert_eq!(resolution.result, ResolutionResult::Error);
    }

    #[test]
    fn corrupt_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.json");
        std::fs::write(&path, r#"{"kind": "noop", "unexpected": true}"#).unwrap();
        let resolution = RecipeResolver.resolve(path.to_str().unwrap());
        assert_eq!(resolution.result, ResolutionResult::Corrupt);
        assert!(resolution.info.unwrap().contains("unexpected"));
    }

    #[test]
    fn builtin_registry_picks_kind() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResolverRegistry::with_builtin();

        let script = write_script(dir.path(), "pass.sh", "exit 0");
        let resolution = registry.resolve(script.to_str().unwrap());
        assert_eq!(resolution.origin.as_deref(), Some("exec-test"));
        assert_eq!(resolution.resolutions[0].kind, "exec-test");

        let tap = write_script(dir.path(), "check.t", "echo 1..0");
        let resolution = registry.resolve(tap.to_str().unwrap());
        assert_eq!(resolution.resolutions[0].kind, "tap");

        let py = dir.path().join("passtest.py");
        std::fs::write(&py, PASSTEST).unwrap();
        let resolution = registry.resolve(py.to_str().unwrap());
        assert_eq!(resolution.resolutions[0].kind, "avocado-instrumented");

        let recipe = dir.path().join("noop.json");
        std::fs::write(&recipe, r#"[{"kind": "noop"}, {"kind": "noop", "args": ["x"]}]"#)
            .unwrap();
        let resolution = registry.resolve(recipe.to_str().unwrap());
        assert_eq!(resolution.origin.as_deref(), Some("runnable-recipe"));
        assert_eq!(resolution.resolutions.len(), 2);

        let resolution = registry.resolve("no-such-file");
        assert_eq!(resolution.result, ResolutionResult::NotFound);
    }
}
