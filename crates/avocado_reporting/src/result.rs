use std::path::PathBuf;

use avocado_utils::net_protocol::messages::Outcome;
use avocado_utils::runnable::Tags;
use serde_derive::Serialize;

/// The terminal record of one test, as written to `results.json`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TestResult {
    pub id: String,
    pub name: String,
    pub status: &'static str,
    pub fail_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    pub logfile: PathBuf,
    pub logdir: PathBuf,
    pub whiteboard: String,
    pub time_start: f64,
    pub time_end: f64,
    pub time_elapsed: f64,
    pub tags: Tags,
    #[serde(skip)]
    pub outcome: Outcome,
}

impl TestResult {
    /// A result with plausible values, for tests.
    #[cfg(any(test, feature = "fake"))]
    pub fn fake(id: &str, outcome: Outcome) -> Self {
        let name = id.split_once('-').map_or(id, |(_, name)| name);
        let logdir = PathBuf::from("/results/job-1/test-results").join(id);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: outcome.status(),
            fail_reason: None,
            fail_class: None,
            traceback: None,
            logfile: logdir.join("debug.log"),
            logdir,
            whiteboard: String::new(),
            time_start: 1_700_000_000.0,
            time_end: 1_700_000_001.5,
            time_elapsed: 1.5,
            tags: Default::default(),
            outcome,
        }
    }

    /// Class part of a `path:Class.method` name, used to group test cases.
    pub fn class_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, qualified)) => qualified
                .split_once('.')
                .map_or(qualified, |(class, _)| class),
            None => "<unknown>",
        }
    }
}

/// Tally of terminal statuses. `total` always equals the sum of the others.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub pass: u64,
    pub fail: u64,
    pub error: u64,
    pub skip: u64,
    pub cancel: u64,
    pub warn: u64,
    pub interrupted: u64,
    pub total: u64,
}

impl Counters {
    pub fn record(&mut self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Pass => &mut self.pass,
            Outcome::Fail => &mut self.fail,
            Outcome::Error => &mut self.error,
            Outcome::Skip => &mut self.skip,
            Outcome::Cancel => &mut self.cancel,
            Outcome::Warn => &mut self.warn,
            Outcome::Interrupted => &mut self.interrupted,
        };
        *counter += 1;
        self.total += 1;
    }

    pub fn get(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Pass => self.pass,
            Outcome::Fail => self.fail,
            Outcome::Error => self.error,
            Outcome::Skip => self.skip,
            Outcome::Cancel => self.cancel,
            Outcome::Warn => self.warn,
            Outcome::Interrupted => self.interrupted,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.fail + self.error > 0
    }
}

#[cfg(test)]
mod test {
    use avocado_utils::net_protocol::messages::Outcome;

    use super::{Counters, TestResult};

    #[test]
    fn total_is_the_sum() {
        let mut counters = Counters::default();
        for outcome in Outcome::ALL.into_iter().chain([Outcome::Pass, Outcome::Fail]) {
            counters.record(outcome);
        }
        let sum: u64 = Outcome::ALL.into_iter().map(|o| counters.get(o)).sum();
        assert_eq!(counters.total, sum);
        assert_eq!(counters.total, 9);
        assert_eq!(counters.pass, 2);
        assert!(counters.has_failures());
    }

    #[test]
    fn class_names() {
        let mut result = TestResult::fake("1-a.py:Suite.test_x", Outcome::Pass);
        assert_eq!(result.class_name(), "Suite");
        result.name = "/bin/true".to_string();
        assert_eq!(result.class_name(), "<unknown>");
    }
}
