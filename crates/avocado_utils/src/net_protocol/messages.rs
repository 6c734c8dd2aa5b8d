//! Status messages sent by runners while executing a runnable.

use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::time::EpochSeconds;

/// Terminal outcome of a runnable as reported in a `finished` message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
    Skip,
    Cancel,
    Warn,
    Interrupted,
}

impl Outcome {
    pub const ALL: [Outcome; 7] = [
        Outcome::Pass,
        Outcome::Fail,
        Outcome::Error,
        Outcome::Skip,
        Outcome::Cancel,
        Outcome::Warn,
        Outcome::Interrupted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Error => "error",
            Outcome::Skip => "skip",
            Outcome::Cancel => "cancel",
            Outcome::Warn => "warn",
            Outcome::Interrupted => "interrupted",
        }
    }

    /// Upper-case form used for result records and on-disk names.
    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Error => "ERROR",
            Outcome::Skip => "SKIP",
            Outcome::Cancel => "CANCEL",
            Outcome::Warn => "WARN",
            Outcome::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Fail | Outcome::Error)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Outcome::ALL
            .into_iter()
            .find(|outcome| outcome.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown test status {s:?}"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
}

impl Finished {
    pub fn new(result: Outcome) -> Self {
        Self {
            result,
            fail_reason: None,
            fail_class: None,
            traceback: None,
            returncode: None,
        }
    }

    pub fn with_reason(result: Outcome, reason: impl Into<String>) -> Self {
        Self {
            fail_reason: Some(reason.into()),
            ..Self::new(result)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageKind {
    Started {
        /// Timeout the runnable asked for, in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
    },
    Running,
    Stdout {
        #[serde(with = "base64_bytes")]
        log: Vec<u8>,
    },
    Stderr {
        #[serde(with = "base64_bytes")]
        log: Vec<u8>,
    },
    Log {
        #[serde(with = "base64_bytes")]
        log: Vec<u8>,
        #[serde(default = "default_encoding")]
        encoding: String,
        #[serde(default)]
        level: i32,
    },
    Whiteboard {
        #[serde(with = "base64_bytes")]
        log: Vec<u8>,
    },
    Finished(Finished),
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

/// A status message with its envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub time: EpochSeconds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            time: EpochSeconds::now(),
            task_id: None,
            kind,
        }
    }

    pub fn started() -> Self {
        Self::new(MessageKind::Started { timeout: None })
    }

    pub fn running() -> Self {
        Self::new(MessageKind::Running)
    }

    pub fn stdout(log: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Stdout { log: log.into() })
    }

    pub fn stderr(log: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Stderr { log: log.into() })
    }

    pub fn log(log: impl Into<Vec<u8>>, level: i32) -> Self {
        Self::new(MessageKind::Log {
            log: log.into(),
            encoding: default_encoding(),
            level,
        })
    }

    pub fn whiteboard(log: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Whiteboard { log: log.into() })
    }

    pub fn finished(finished: Finished) -> Self {
        Self::new(MessageKind::Finished(finished))
    }

    pub fn with_task_id(self, task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..self
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            MessageKind::Started { .. } => "started",
            MessageKind::Running => "running",
            MessageKind::Stdout { .. } => "stdout",
            MessageKind::Stderr { .. } => "stderr",
            MessageKind::Log { .. } => "log",
            MessageKind::Whiteboard { .. } => "whiteboard",
            MessageKind::Finished(_) => "finished",
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self.kind, MessageKind::Started { .. })
    }

    pub fn as_finished(&self) -> Option<&Finished> {
        match &self.kind {
            MessageKind::Finished(finished) => Some(finished),
            _ => None,
        }
    }
}

/// Python-style logging levels, as carried by `log` messages.
pub mod level {
    pub const DEBUG: i32 = 10;
    pub const INFO: i32 = 20;
    pub const WARNING: i32 = 30;
    pub const ERROR: i32 = 40;

    pub fn name(level: i32) -> &'static str {
        match level {
            l if l >= ERROR => "ERROR",
            l if l >= WARNING => "WARNING",
            l if l >= INFO => "INFO",
            _ => "DEBUG",
        }
    }
}

/// Byte payloads travel as base64 strings.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
