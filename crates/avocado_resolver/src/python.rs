//! Static inspection of Python test modules.
//!
//! Nothing here imports or executes the inspected code: the source is
//! split into logical lines (joining bracketed continuations and
//! multi-line strings) and scanned for imports, top-level classes, their
//! docstrings and their `test*` methods.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use avocado_utils::runnable::{Runnable, Tags};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyMethod {
    pub name: String,
    pub docstring: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyClass {
    pub name: String,
    pub bases: Vec<String>,
    pub docstring: Option<String>,
    pub methods: Vec<PyMethod>,
}

#[derive(Debug, Default, Clone)]
pub struct PyModule {
    pub classes: Vec<PyClass>,
    /// Local name -> fully qualified name it was imported as.
    imports: HashMap<String, String>,
}

/// A test class discovered in a module, with its selected methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestClass {
    pub name: String,
    pub methods: Vec<TestMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMethod {
    pub name: String,
    pub tags: Tags,
    pub dependencies: Vec<Runnable>,
}

struct Logical {
    indent: usize,
    text: String,
}

fn logical_lines(source: &str) -> Vec<Logical> {
    let mut lines = Vec::new();
    let mut text = String::new();
    let mut indent = 0;
    let mut depth: i32 = 0;
    let mut string: Option<(char, bool)> = None;

    for physical in source.lines() {
        if text.is_empty() && string.is_none() {
            indent = physical
                .chars()
                .take_while(|c| c.is_whitespace())
                .map(|c| if c == '\t' { 8 } else { 1 })
                .sum();
        }

        let chars: Vec<char> = physical.chars().collect();
        let mut i = 0;
        let mut continued = false;
        while i < chars.len() {
            let c = chars[i];
            match string {
                Some((quote, triple)) => {
                    text.push(c);
                    if c == '\\' && i + 1 < chars.len() {
                        text.push(chars[i + 1]);
                        i += 1;
                    } else if c == quote {
                        if !triple {
                            string = None;
                        } else if chars.get(i + 1) == Some(&quote)
                            && chars.get(i + 2) == Some(&quote)
                        {
                            text.push(quote);
                            text.push(quote);
                            i += 2;
                            string = None;
                        }
                    }
                }
                None => match c {
                    '#' => break,
                    '\'' | '"' => {
                        let triple =
                            chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                        text.push(c);
                        if triple {
                            text.push(c);
                            text.push(c);
                            i += 2;
                        }
                        string = Some((c, triple));
                    }
                    '(' | '[' | '{' => {
                        depth += 1;
                        text.push(c);
                    }
                    ')' | ']' | '}' => {
                        depth = (depth - 1).max(0);
                        text.push(c);
                    }
                    '\\' if i + 1 == chars.len() => continued = true,
                    c => text.push(c),
                },
            }
            i += 1;
        }

        match string {
            Some((_, true)) => {
                text.push('\n');
                continue;
            }
            // An unterminated single-quoted string is a syntax error; drop it.
            Some((_, false)) => string = None,
            None => {}
        }
        if depth > 0 || continued {
            text.push(' ');
            continue;
        }

        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(Logical {
                indent,
                text: trimmed.to_string(),
            });
        }
        text.clear();
    }

    let trimmed = text.trim();
    if !trimmed.is_empty() {
        lines.push(Logical {
            indent,
            text: trimmed.to_string(),
        });
    }
    lines
}

/// The contents of a statement consisting only of a string literal.
fn string_literal(text: &str) -> Option<String> {
    let body = text.trim_start_matches(|c: char| "rRuUbBfF".contains(c));
    if body.len() == text.len() && !text.starts_with(['"', '\'']) {
        return None;
    }
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(rest) = body.strip_prefix(quote) {
            let end = rest.rfind(quote)?;
            return Some(rest[..end].to_string());
        }
    }
    None
}

fn class_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^class\s+([A-Za-z_]\w*)\s*(?:\((.*?)\))?\s*:").expect("valid regex")
    })
}

fn def_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").expect("valid regex")
    })
}

fn split_top_level_commas(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

impl PyModule {
    pub fn parse(source: &str) -> PyModule {
        let lines = logical_lines(source);
        let mut module = PyModule::default();

        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            i += 1;
            if line.indent != 0 {
                continue;
            }

            if let Some(rest) = line.text.strip_prefix("import ") {
                module.parse_import(rest);
                continue;
            }
            if line.text.starts_with("from ") {
                module.parse_from_import(&line.text);
                continue;
            }

            let Some(captures) = class_header().captures(&line.text) else {
                continue;
            };
            let name = captures[1].to_string();
            let bases = captures
                .get(2)
                .map(|b| split_top_level_commas(b.as_str()))
                .unwrap_or_default()
                .into_iter()
                .filter(|b| !b.contains('='))
                .collect();

            let body_start = i;
            while i < lines.len() && lines[i].indent > 0 {
                i += 1;
            }
            let body = &lines[body_start..i];
            module.classes.push(parse_class(name, bases, body));
        }

        module
    }

    fn parse_import(&mut self, rest: &str) {
        for item in split_top_level_commas(rest) {
            let mut words = item.split_whitespace();
            let (Some(target), alias) = (words.next(), words.nth(1)) else {
                continue;
            };
            let local = alias.unwrap_or_else(|| target.split('.').next().unwrap_or(target));
            let full = if alias.is_some() {
                target
            } else {
                target.split('.').next().unwrap_or(target)
            };
            self.imports.insert(local.to_string(), full.to_string());
        }
    }

    fn parse_from_import(&mut self, text: &str) {
        let Some((module, names)) = text
            .strip_prefix("from ")
            .and_then(|rest| rest.split_once(" import "))
        else {
            return;
        };
        let module = module.trim();
        let names = names.trim().trim_start_matches('(').trim_end_matches(')');
        for item in split_top_level_commas(names) {
            let mut words = item.split_whitespace();
            let (Some(name), alias) = (words.next(), words.nth(1)) else {
                continue;
            };
            self.imports.insert(
                alias.unwrap_or(name).to_string(),
                format!("{module}.{name}"),
            );
        }
    }

    /// Resolves a base expression through the module's imports.
    fn qualify(&self, base: &str) -> String {
        let (head, tail) = match base.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (base, None),
        };
        let head = self.imports.get(head).map(String::as_str).unwrap_or(head);
        match tail {
            Some(tail) => format!("{head}.{tail}"),
            None => head.to_string(),
        }
    }

    fn class(&self, name: &str) -> Option<&PyClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Whether `class` derives from one of `roots`, directly or through
    /// other classes of this module.
    fn inherits(&self, class: &PyClass, roots: &[&str], seen: &mut HashSet<String>) -> bool {
        if !seen.insert(class.name.clone()) {
            return false;
        }
        class.bases.iter().any(|base| {
            let qualified = self.qualify(base);
            if roots.contains(&qualified.as_str()) {
                return true;
            }
            match self.class(base) {
                Some(parent) => self.inherits(parent, roots, seen),
                None => false,
            }
        })
    }

    /// Test methods of `class`, including those of in-module parents.
    fn test_methods<'a>(&'a self, class: &'a PyClass, seen: &mut HashSet<String>) -> Vec<&'a PyMethod> {
        if !seen.insert(class.name.clone()) {
            return Vec::new();
        }
        let mut methods: Vec<&PyMethod> = Vec::new();
        for base in &class.bases {
            if let Some(parent) = self.class(base) {
                methods.extend(self.test_methods(parent, seen));
            }
        }
        for method in &class.methods {
            if let Some(pos) = methods.iter().position(|m| m.name == method.name) {
                methods[pos] = method;
            } else {
                methods.push(method);
            }
        }
        methods.retain(|m| m.name.starts_with("test"));
        methods
    }
}

fn parse_class(name: String, bases: Vec<String>, body: &[Logical]) -> PyClass {
    let docstring = body.first().and_then(|l| string_literal(&l.text));
    let body_indent = body.first().map(|l| l.indent).unwrap_or(0);

    let mut methods = Vec::new();
    let mut j = 0;
    while j < body.len() {
        let line = &body[j];
        j += 1;
        if line.indent != body_indent {
            continue;
        }
        let Some(captures) = def_header().captures(&line.text) else {
            continue;
        };
        let docstring = body
            .get(j)
            .filter(|next| next.indent > body_indent)
            .and_then(|next| string_literal(&next.text));
        methods.push(PyMethod {
            name: captures[1].to_string(),
            docstring,
        });
    }

    PyClass {
        name,
        bases,
        docstring,
        methods,
    }
}

/// `:avocado: <directive>` lines of a docstring.
#[derive(Debug, Default)]
struct Directives {
    enable: bool,
    disable: bool,
    tags: Tags,
    dependencies: Vec<Runnable>,
}

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*:avocado:\s*(.+?)\s*$").expect("valid regex"))
}

fn directives(docstring: Option<&str>) -> Directives {
    let mut directives = Directives::default();
    let Some(docstring) = docstring else {
        return directives;
    };
    for line in docstring.lines() {
        let Some(captures) = directive_re().captures(line) else {
            continue;
        };
        let directive = &captures[1];
        if directive == "enable" {
            directives.enable = true;
        } else if directive == "disable" {
            directives.disable = true;
        } else if let Some(tags) = directive.strip_prefix("tags=") {
            for tag in tags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                match tag.split_once(':') {
                    Some((key, value)) => {
                        directives
                            .tags
                            .entry(key.to_string())
                            .or_default()
                            .insert(value.to_string());
                    }
                    None => {
                        directives.tags.entry(tag.to_string()).or_default();
                    }
                }
            }
        } else if let Some(json) = directive.strip_prefix("dependency=") {
            match parse_dependency(json) {
                Some(dependency) => directives.dependencies.push(dependency),
                None => tracing::warn!(directive, "ignoring malformed dependency directive"),
            }
        }
    }
    directives
}

/// Dependencies are runnable recipes; `type` is accepted for `kind`.
fn parse_dependency(json: &str) -> Option<Runnable> {
    let mut value: serde_json::Value = serde_json::from_str(json).ok()?;
    let object = value.as_object_mut()?;
    if !object.contains_key("kind") {
        let kind = object.remove("type")?;
        object.insert("kind".to_string(), kind);
    }
    serde_json::from_value(value).ok()
}

const AVOCADO_ROOTS: &[&str] = &["avocado.Test", "avocado.core.test.Test"];
const UNITTEST_ROOTS: &[&str] = &[
    "unittest.TestCase",
    "unittest.case.TestCase",
    "unittest.IsolatedAsyncioTestCase",
];

fn collect(module: &PyModule, class: &PyClass, class_directives: &Directives) -> TestClass {
    let methods = module
        .test_methods(class, &mut HashSet::new())
        .into_iter()
        .map(|method| {
            let method_directives = directives(method.docstring.as_deref());
            let mut tags = method_directives.tags;
            for (key, values) in &class_directives.tags {
                tags.entry(key.clone()).or_default().extend(values.iter().cloned());
            }
            let mut dependencies = class_directives.dependencies.clone();
            dependencies.extend(method_directives.dependencies);
            TestMethod {
                name: method.name.clone(),
                tags,
                dependencies,
            }
        })
        .collect();
    TestClass {
        name: class.name.clone(),
        methods,
    }
}

/// Classes deriving from the framework's `Test` (or forced with
/// `:avocado: enable`), minus the ones marked `:avocado: disable`.
pub fn find_avocado_tests(module: &PyModule) -> Vec<TestClass> {
    module
        .classes
        .iter()
        .filter_map(|class| {
            let class_directives = directives(class.docstring.as_deref());
            if class_directives.disable {
                return None;
            }
            let is_test = class_directives.enable
                || module.inherits(class, AVOCADO_ROOTS, &mut HashSet::new());
            is_test.then(|| collect(module, class, &class_directives))
        })
        .filter(|class| !class.methods.is_empty())
        .collect()
}

/// Classes deriving from `unittest.TestCase` that are not framework tests.
pub fn find_python_unittests(module: &PyModule) -> Vec<TestClass> {
    module
        .classes
        .iter()
        .filter(|class| {
            module.inherits(class, UNITTEST_ROOTS, &mut HashSet::new())
                && !module.inherits(class, AVOCADO_ROOTS, &mut HashSet::new())
        })
        .map(|class| collect(module, class, &Directives::default()))
        .filter(|class| !class.methods.is_empty())
        .collect()
}
