//! Parser for Test Anything Protocol output (versions 12 and 13).

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapResult {
    Pass,
    Skip,
    Fail,
    /// `not ok` marked TODO.
    XFail,
    /// `ok` marked TODO.
    XPass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapEvent {
    Version(u32),
    Plan {
        count: usize,
        late: bool,
        skipped: bool,
        explanation: Option<String>,
    },
    Test {
        number: usize,
        name: String,
        result: TapResult,
        explanation: Option<String>,
    },
    Bailout(String),
    Error(String),
}

struct Patterns {
    bailout: Regex,
    plan: Regex,
    test: Regex,
    version: Regex,
    yaml_start: Regex,
    yaml_end: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        const DIRECTIVE: &str = r"(?:\s*\#\s*([Ss][Kk][Ii][Pp]\S*|[Tt][Oo][Dd][Oo])\b\s*(.*))?";
        let re = |pattern: &str| Regex::new(pattern).expect("valid TAP regex");
        Patterns {
            bailout: re(r"^Bail out!\s*(.*)"),
            plan: re(&format!(r"^1\.\.([0-9]+){DIRECTIVE}")),
            test: re(&format!(r"^((?:not )?ok)\s*(?:([0-9]+)\s*)?([^#]*){DIRECTIVE}")),
            version: re(r"^TAP version ([0-9]+)"),
            yaml_start: re(r"^(\s+)---.*"),
            yaml_end: re(r"^\s+\.\.\.\s*$"),
        }
    })
}

enum State {
    Main,
    AfterTest,
    Yaml { start_line: usize, indent: String },
}

fn test_event(
    ok: bool,
    number: usize,
    name: &str,
    directive: Option<&str>,
    explanation: Option<&str>,
) -> Vec<TapEvent> {
    let name = name.trim().to_string();
    let explanation = explanation
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string);
    let mut events = Vec::new();

    let result = match directive.map(str::to_ascii_uppercase) {
        Some(directive) if directive.starts_with("SKIP") => {
            if ok {
                TapResult::Skip
            } else {
                TapResult::Fail
            }
        }
        Some(directive) if directive == "TODO" => {
            if ok {
                TapResult::XPass
            } else {
                TapResult::XFail
            }
        }
        Some(directive) => {
            events.push(TapEvent::Error(format!("invalid directive \"{directive}\"")));
            if ok {
                TapResult::Pass
            } else {
                TapResult::Fail
            }
        }
        None if ok => TapResult::Pass,
        None => TapResult::Fail,
    };
    events.push(TapEvent::Test {
        number,
        name,
        result,
        explanation,
    });
    events
}

/// Parses a complete TAP stream into events, in input order.
pub fn parse(input: &str) -> Vec<TapEvent> {
    let p = patterns();
    let mut events = Vec::new();
    let mut state = State::Main;
    let mut plan: Option<(usize, bool)> = None;
    let mut found_late_test = false;
    let mut bailed_out = false;
    let mut num_tests = 0;
    let mut version = 12;

    for (index, raw) in input.lines().enumerate() {
        let lineno = index + 1;
        let line = raw.trim_end();

        match &state {
            State::AfterTest => {
                if version >= 13 {
                    if let Some(captures) = p.yaml_start.captures(line) {
                        state = State::Yaml {
                            start_line: lineno,
                            indent: captures[1].to_string(),
                        };
                        continue;
                    }
                }
                state = State::Main;
            }
            State::Yaml { start_line, indent } => {
                if p.yaml_end.is_match(line) {
                    state = State::Main;
                    continue;
                }
                if line.starts_with(indent.as_str()) {
                    continue;
                }
                events.push(TapEvent::Error(format!(
                    "YAML block not terminated (started on line {start_line})"
                )));
                state = State::Main;
            }
            State::Main => {}
        }

        if line.starts_with('#') {
            continue;
        }

        if let Some(captures) = p.test.captures(line) {
            if let Some((_, true)) = plan {
                if !found_late_test {
                    events.push(TapEvent::Error("unexpected test after late plan".into()));
                    found_late_test = true;
                }
            }
            num_tests += 1;
            let number = captures
                .get(2)
                .and_then(|n| n.as_str().parse().ok())
                .unwrap_or(num_tests);
            if number != num_tests {
                events.push(TapEvent::Error("out of order test numbers".into()));
            }
            events.extend(test_event(
                &captures[1] == "ok",
                number,
                captures.get(3).map(|m| m.as_str()).unwrap_or_default(),
                captures.get(4).map(|m| m.as_str()),
                captures.get(5).map(|m| m.as_str()),
            ));
            state = State::AfterTest;
            continue;
        }

        if let Some(captures) = p.plan.captures(line) {
            if plan.is_some() {
                events.push(TapEvent::Error("more than one plan found".into()));
                continue;
            }
            let count: usize = captures[1].parse().unwrap_or(0);
            let mut skipped = count == 0;
            if let Some(directive) = captures.get(2) {
                if directive.as_str().to_ascii_uppercase().starts_with("SKIP") {
                    if count > 0 {
                        events.push(TapEvent::Error("invalid SKIP directive for plan".into()));
                    }
                    skipped = true;
                } else {
                    events.push(TapEvent::Error("invalid directive for plan".into()));
                }
            }
            let late = num_tests > 0;
            plan = Some((count, late));
            events.push(TapEvent::Plan {
                count,
                late,
                skipped,
                explanation: captures
                    .get(3)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|e| !e.is_empty()),
            });
            continue;
        }

        if let Some(captures) = p.bailout.captures(line) {
            events.push(TapEvent::Bailout(captures[1].to_string()));
            bailed_out = true;
            continue;
        }

        if let Some(captures) = p.version.captures(line) {
            if lineno != 1 {
                events.push(TapEvent::Error(
                    "version number must be on the first line".into(),
                ));
                continue;
            }
            version = captures[1].parse().unwrap_or(0);
            if version < 13 {
                events.push(TapEvent::Error(
                    "version number should be at least 13".into(),
                ));
            } else {
                events.push(TapEvent::Version(version));
            }
            continue;
        }

        if line.is_empty() {
            continue;
        }

        events.push(TapEvent::Error(format!("unexpected input at line {lineno}")));
    }

    if let State::Yaml { start_line, .. } = state {
        events.push(TapEvent::Error(format!(
            "YAML block not terminated (started on line {start_line})"
        )));
    }

    if let Some((count, _)) = plan {
        if !bailed_out && num_tests != count {
            let message = if num_tests < count {
                format!("Too few tests run (expected {count}, got {num_tests})")
            } else {
                format!("Too many tests run (expected {count}, got {num_tests})")
            };
            events.push(TapEvent::Error(message));
        }
    }

    events
}

#[cfg(test)]
mod test {
    use super::{parse, TapEvent, TapResult};
    use indoc::indoc;

    fn results(events: &[TapEvent]) -> Vec<(usize, TapResult)> {
        events
            .iter()
            .filter_map(|e| match e {
                TapEvent::Test { number, result, .. } => Some((*number, *result)),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[TapEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                TapEvent::Error(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn basic_stream() {
        let events = parse(indoc! {"
            TAP version 13
            1..4
            ok 1 - first
            not ok 2 - second
              ---
              message: boom
              ...
            ok 3 # SKIP not on this platform
            not ok 4 # TODO later
        "});
        assert_eq!(events[0], TapEvent::Version(13));
        assert_eq!(
            results(&events),
            vec![
                (1, TapResult::Pass),
                (2, TapResult::Fail),
                (3, TapResult::Skip),
                (4, TapResult::XFail)
            ]
        );
        assert!(errors(&events).is_empty());
        assert!(matches!(
            &events[2],
            TapEvent::Test { name, .. } if name == "- first"
        ));
    }

    #[test]
    fn plan_mismatch() {
        let events = parse("1..3\nok\nok\n");
        assert_eq!(
            errors(&events),
            vec!["Too few tests run (expected 3, got 2)"]
        );
        let events = parse("ok\nok\n1..1\n");
        assert_eq!(
            errors(&events),
            vec!["Too many tests run (expected 1, got 2)"]
        );
    }

    #[test]
    fn out_of_order_and_garbage() {
        let events = parse("1..2\nok 2\nok 1\nwhat is this\n");
        let errors = errors(&events);
        assert!(errors.contains(&"out of order test numbers".to_string()));
        assert!(errors.contains(&"unexpected input at line 4".to_string()));
    }

    #[test]
    fn bailout_suppresses_count_check() {
        let events = parse("1..5\nok 1\nBail out! database down\n");
        assert!(events.contains(&TapEvent::Bailout("database down".to_string())));
        assert!(errors(&events).is_empty());
    }

    #[test]
    fn late_version_line() {
        let events = parse("1..1\nTAP version 13\nok 1\n");
        assert_eq!(
            errors(&events),
            vec!["version number must be on the first line"]
        );
    }

    #[test]
    fn skipped_plan() {
        let events = parse("1..0 # SKIP no network\n");
        assert!(matches!(
            &events[0],
            TapEvent::Plan { count: 0, skipped: true, explanation: Some(e), .. } if e == "no network"
        ));
    }

    #[test]
    fn unterminated_yaml() {
        let events = parse("TAP version 13\n1..1\nnot ok 1\n  ---\n  a: b\n");
        assert_eq!(
            errors(&events),
            vec!["YAML block not terminated (started on line 4)"]
        );
    }
}
