use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::ids::Sequence;

/// Classification of an ingested line, fixed at ingestion time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The line parses as a JSON value (objects, arrays and primitives).
    Structured,
    Plain,
}

impl RecordKind {
    pub fn classify(line: &[u8]) -> Self {
        if serde_json::from_slice::<serde::de::IgnoredAny>(line).is_ok() {
            Self::Structured
        } else {
            Self::Plain
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structured" => Ok(Self::Structured),
            "plain" => Ok(Self::Plain),
            other => Err(CoreError::UnknownKind(other.to_owned())),
        }
    }
}

/// One persisted line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub sequence: Sequence,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// `"<sequence>:<payload>"`, the per-entry form viewers receive.
    pub fn wire_entry(&self) -> String {
        format!("{}:{}", self.sequence, self.payload_text())
    }
}

/// Serialize a window as a JSON array of wire entries, preserving order.
pub fn encode_window(records: &[LogRecord]) -> Result<String, serde_json::Error> {
    let entries: Vec<String> = records.iter().map(LogRecord::wire_entry).collect();
    serde_json::to_string(&entries)
}
