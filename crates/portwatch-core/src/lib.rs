//! Core domain model for portwatch: raw upstream rows, canonical vessel records,
//! keyword match results and the persisted record shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "portwatch-core";

/// Placeholder token for categorical fields the upstream left empty.
pub const UNKNOWN_TOKEN: &str = "unknown";

/// One upstream row exactly as received. Read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, JsonValue>);

impl RawRecord {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON value if it is an object.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Scalar field rendered as trimmed text; `None` for null, blank or structured values.
    pub fn text(&self, key: &str) -> Option<String> {
        let rendered = match self.0.get(key)? {
            JsonValue::String(s) => s.trim().to_string(),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            _ => return None,
        };
        if rendered.is_empty() {
            None
        } else {
            Some(rendered)
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Categorical dimensions exposed to filters, facets and charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryField {
    VesselType,
    Operator,
    Port,
    Status,
}

impl CategoryField {
    pub const ALL: [CategoryField; 4] = [
        CategoryField::VesselType,
        CategoryField::Operator,
        CategoryField::Port,
        CategoryField::Status,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CategoryField::VesselType => "vessel_type",
            CategoryField::Operator => "operator",
            CategoryField::Port => "port",
            CategoryField::Status => "status",
        }
    }
}

/// Canonical vessel movement record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub name: Option<String>,
    pub sequence_number: Option<String>,
    pub secondary_id: Option<String>,
    pub vessel_type: Vec<String>,
    pub operator: Vec<String>,
    pub port: Vec<String>,
    pub status: Vec<String>,
    pub consignee: Option<String>,
    /// `None` when the upstream date was absent or unparsable.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NormalizedRecord {
    pub fn category(&self, field: CategoryField) -> &[String] {
        match field {
            CategoryField::VesselType => &self.vessel_type,
            CategoryField::Operator => &self.operator,
            CategoryField::Port => &self.port,
            CategoryField::Status => &self.status,
        }
    }

    /// Text the keyword matcher scans: name, type, operator, port, status, consignee.
    ///
    /// Placeholder `unknown` tokens are left out so they can never produce a hit.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(name) = self.name.as_deref() {
            parts.push(name);
        }
        for field in CategoryField::ALL {
            parts.extend(
                self.category(field)
                    .iter()
                    .map(String::as_str)
                    .filter(|t| *t != UNKNOWN_TOKEN),
            );
        }
        if let Some(consignee) = self.consignee.as_deref() {
            parts.push(consignee);
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Outcome of running the three keyword groups over one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub vessel_type_keywords: Vec<String>,
    pub operator_keywords: Vec<String>,
    pub port_location_keywords: Vec<String>,
    pub groups_matched: u8,
    pub total_groups: u8,
    pub match_score: u32,
    pub verdict: Verdict,
    #[serde(default)]
    pub snippets: Vec<String>,
}

/// Persisted unit: a record that passed matching, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub fingerprint: String,
    pub scraped_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub record: NormalizedRecord,
    pub match_result: MatchResult,
}

/// Where an update run currently is. `Failed` sticks until the next run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Fetching,
    Normalizing,
    Matching,
    Persisting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UpstreamUnavailable,
    StorageIo,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Skipped { reason: String },
    Failed { kind: FailureKind, message: String },
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// Outcome of one update run. On failure the counters hold what was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub fetched: usize,
    pub normalized_ok: usize,
    pub matched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub record_errors: usize,
    pub total_records: usize,
    pub status: RunStatus,
}

impl RunSummary {
    pub fn started(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            elapsed_ms: 0,
            fetched: 0,
            normalized_ok: 0,
            matched: 0,
            inserted: 0,
            duplicates: 0,
            record_errors: 0,
            total_records: 0,
            status: RunStatus::Completed,
        }
    }

    pub fn finish(mut self, finished_at: DateTime<Utc>, status: RunStatus) -> Self {
        self.finished_at = finished_at;
        self.elapsed_ms = (finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.status = status;
        self
    }
}

/// Record-level failures. These are counted by a run, never fatal to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("unidentifiable record: {0}")]
    Unidentifiable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> NormalizedRecord {
        NormalizedRecord {
            name: Some("EPIPHANIA".into()),
            sequence_number: Some("2025-118".into()),
            secondary_id: None,
            vessel_type: vec!["VRAQUIER".into()],
            operator: vec![UNKNOWN_TOKEN.into()],
            port: vec!["VANCOUVER".into()],
            status: vec!["EN RADE".into()],
            consignee: Some("MASS CEREALES".into()),
            timestamp: None,
        }
    }

    #[test]
    fn raw_text_renders_scalars_and_drops_blanks() {
        let raw = RawRecord::from_value(json!({
            "name": "  EPIPHANIA ",
            "escale": 4471,
            "blank": "   ",
            "nothing": null,
            "nested": {"a": 1}
        }))
        .unwrap();
        assert_eq!(raw.text("name").as_deref(), Some("EPIPHANIA"));
        assert_eq!(raw.text("escale").as_deref(), Some("4471"));
        assert_eq!(raw.text("blank"), None);
        assert_eq!(raw.text("nothing"), None);
        assert_eq!(raw.text("nested"), None);
        assert_eq!(raw.text("missing"), None);
    }

    #[test]
    fn non_objects_are_not_raw_records() {
        assert!(RawRecord::from_value(json!([1, 2])).is_none());
        assert!(RawRecord::from_value(json!("x")).is_none());
    }

    #[test]
    fn searchable_text_skips_unknown_placeholders() {
        let text = record().searchable_text();
        assert_eq!(text, "EPIPHANIA VRAQUIER VANCOUVER EN RADE MASS CEREALES");
    }

    #[test]
    fn category_field_serializes_snake_case() {
        let v = serde_json::to_value(CategoryField::VesselType).unwrap();
        assert_eq!(v, json!("vessel_type"));
        assert_eq!(CategoryField::Port.as_str(), "port");
    }

    #[test]
    fn failed_summary_keeps_counts_and_tags_status() {
        let start = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 8, 22, 10, 0, 0)
            .single()
            .unwrap();
        let mut summary = RunSummary::started(Uuid::nil(), start);
        summary.fetched = 12;
        let summary = summary.finish(
            start + chrono::Duration::milliseconds(1500),
            RunStatus::Failed {
                kind: FailureKind::UpstreamUnavailable,
                message: "timed out".into(),
            },
        );
        assert_eq!(summary.elapsed_ms, 1500);
        assert_eq!(summary.fetched, 12);

        let v = serde_json::to_value(&summary.status).unwrap();
        assert_eq!(
            v,
            json!({"state": "failed", "kind": "upstream_unavailable", "message": "timed out"})
        );
    }
}
