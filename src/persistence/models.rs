use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 持久化实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Classification,
    Failure,
    Escalation,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Classification,
        RecordKind::Failure,
        RecordKind::Escalation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Classification => "classification",
            RecordKind::Failure => "failure",
            RecordKind::Escalation => "escalation",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row waiting to be written in bulk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub kind: RecordKind,
    pub payload: BTreeMap<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl PersistenceRecord {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            payload: BTreeMap::new(),
            enqueued_at: Utc::now(),
        }
    }

    /// Builder-style payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// 持久化统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub records_added: u64,
    pub records_flushed: u64,
    pub records_requeued: u64,
    pub records_rejected: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub buffered: BTreeMap<RecordKind, usize>,
    pub last_flush: Option<DateTime<Utc>>,
}

impl PersistenceStats {
    pub fn total_buffered(&self) -> usize {
        self.buffered.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = PersistenceRecord::new(RecordKind::Escalation)
            .with_field("task_id", "t-1")
            .with_field("confidence", 0.42);

        assert_eq!(record.kind, RecordKind::Escalation);
        assert_eq!(record.field("task_id"), Some(&Value::from("t-1")));
        assert_eq!(record.field("confidence"), Some(&Value::from(0.42)));
        assert!(record.field("missing").is_none());
    }

    #[test]
    fn test_record_kind_serialization() {
        assert_eq!(RecordKind::Failure.to_string(), "failure");
        let json = serde_json::to_string(&RecordKind::Classification).unwrap();
        assert_eq!(json, "\"classification\"");
    }
}
