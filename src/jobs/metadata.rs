//! Open metadata envelope persisted on job definitions and job instances.
//!
//! Processors keep resumable state here. The envelope knows about a single
//! well-known field (`checkpoint`); everything else round-trips untouched
//! through `extra`, so read-modify-write cycles never drop fields written by
//! another processor version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Key under which the scheduler records the start of the last full run.
pub const LAST_FULL_ITERATION_TS: &str = "last_full_iteration_ts";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default)]
    pub checkpoint: Map<String, JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl JobMetadata {
    /// Parse a stored JSON column, treating null, non-objects and malformed
    /// checkpoints as empty.
    pub fn from_json(value: Option<&JsonValue>) -> Self {
        match value {
            Some(JsonValue::Object(map)) => {
                let mut extra = map.clone();
                let checkpoint = match extra.remove("checkpoint") {
                    Some(JsonValue::Object(checkpoint)) => checkpoint,
                    _ => Map::new(),
                };
                Self { checkpoint, extra }
            }
            _ => Self::default(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = self.extra.clone();
        map.insert(
            "checkpoint".to_string(),
            JsonValue::Object(self.checkpoint.clone()),
        );
        JsonValue::Object(map)
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoint.is_empty() && self.extra.is_empty()
    }

    /// Merge `other` into `self`: new keys are added, existing keys are
    /// overwritten, keys absent from `other` are preserved. Checkpoints merge
    /// key by key.
    pub fn merge(&mut self, other: &JobMetadata) {
        for (key, value) in &other.checkpoint {
            self.checkpoint.insert(key.clone(), value.clone());
        }
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    pub fn merged(mut self, other: &JobMetadata) -> Self {
        self.merge(other);
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.extra.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) {
        self.extra.insert(key.into(), value);
    }

    pub fn last_full_iteration_ts(&self) -> Option<DateTime<Utc>> {
        self.extra
            .get(LAST_FULL_ITERATION_TS)
            .and_then(JsonValue::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn set_last_full_iteration_ts(&mut self, ts: DateTime<Utc>) {
        self.extra.insert(
            LAST_FULL_ITERATION_TS.to_string(),
            JsonValue::String(ts.to_rfc3339()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: JsonValue) -> JobMetadata {
        JobMetadata::from_json(Some(&value))
    }

    #[test]
    fn dynamic_fields_survive_round_trip() {
        let stored = json!({
            "checkpoint": {"cursor": "abc"},
            "last_sync_user": "u-1",
            "nested": {"a": [1, 2, 3]}
        });
        let parsed = metadata(stored.clone());
        assert_eq!(parsed.checkpoint.get("cursor"), Some(&json!("abc")));
        assert_eq!(parsed.get("last_sync_user"), Some(&json!("u-1")));
        assert_eq!(parsed.to_json(), stored);
    }

    #[test]
    fn missing_or_malformed_columns_are_empty() {
        assert!(JobMetadata::from_json(None).is_empty());
        assert!(JobMetadata::from_json(Some(&json!("text"))).is_empty());
        let parsed = metadata(json!({"checkpoint": 5, "k": 1}));
        assert!(parsed.checkpoint.is_empty());
        assert_eq!(parsed.get("k"), Some(&json!(1)));
    }

    #[test]
    fn merge_adds_overwrites_and_preserves() {
        let mut base = metadata(json!({"a": "b", "keep": true, "checkpoint": {"x": 1}}));
        base.merge(&metadata(json!({"a": "z", "c": "d", "checkpoint": {"y": 2}})));
        assert_eq!(
            base.to_json(),
            json!({"a": "z", "c": "d", "keep": true, "checkpoint": {"x": 1, "y": 2}})
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let patch = metadata(json!({"a": "b", "checkpoint": {"page": 7}}));
        let once = JobMetadata::default().merged(&patch);
        let twice = once.clone().merged(&patch);
        assert_eq!(once, twice);
    }

    #[test]
    fn sequential_merges_accumulate() {
        let merged = JobMetadata::default()
            .merged(&metadata(json!({"a": "b"})))
            .merged(&metadata(json!({"c": "d"})));
        assert_eq!(merged.get("a"), Some(&json!("b")));
        assert_eq!(merged.get("c"), Some(&json!("d")));
    }

    #[test]
    fn last_full_iteration_ts_round_trips() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut meta = JobMetadata::default();
        assert!(meta.last_full_iteration_ts().is_none());
        meta.set_last_full_iteration_ts(ts);
        assert_eq!(meta.last_full_iteration_ts(), Some(ts));
    }
}
