//! Raw upstream rows -> canonical records, through an explicit field mapping
//! table keyed by upstream schema version.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use portwatch_core::{NormalizedRecord, RawRecord, RecordError, UNKNOWN_TOKEN};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const ANP_SCHEMA_V1: &str = "anp-mvmnv-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalField {
    Name,
    SequenceNumber,
    SecondaryId,
    VesselType,
    Operator,
    Port,
    Status,
    Consignee,
    Timestamp,
}

const ANP_V1_MAPPING: &[(&str, CanonicalField)] = &[
    ("nOM_NAVIREField", CanonicalField::Name),
    ("nUMERO_ESCALEField", CanonicalField::SequenceNumber),
    ("nUMERO_LLOYDField", CanonicalField::SecondaryId),
    ("tYP_NAVIREField", CanonicalField::VesselType),
    ("oPERATEURField", CanonicalField::Operator),
    ("pROVField", CanonicalField::Port),
    ("sITUATIONField", CanonicalField::Status),
    ("cONSIGNATAIREField", CanonicalField::Consignee),
    ("dATE_SITUATIONField", CanonicalField::Timestamp),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unsupported upstream schema version {0:?}")]
    UnsupportedSchema(String),
}

/// Source key -> canonical field table for one upstream schema version.
#[derive(Debug, Clone)]
pub struct FieldMap {
    schema_version: String,
    entries: Vec<(String, CanonicalField)>,
}

impl FieldMap {
    pub fn for_schema(version: &str) -> Result<Self, NormalizeError> {
        let table = match version {
            ANP_SCHEMA_V1 => ANP_V1_MAPPING,
            other => return Err(NormalizeError::UnsupportedSchema(other.to_string())),
        };
        Ok(Self {
            schema_version: version.to_string(),
            entries: table
                .iter()
                .map(|(key, field)| (key.to_string(), *field))
                .collect(),
        })
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    fn source_keys(&self, field: CanonicalField) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |(_, f)| *f == field)
            .map(|(key, _)| key.as_str())
    }

    fn text(&self, raw: &RawRecord, field: CanonicalField) -> Option<String> {
        self.source_keys(field).find_map(|key| raw.text(key))
    }

    /// Mapped source keys that no record in the batch carries. Logged as schema
    /// drift; never fatal.
    pub fn check_batch(&self, records: &[RawRecord]) -> Vec<String> {
        if records.is_empty() {
            return Vec::new();
        }
        let seen = records
            .iter()
            .flat_map(|r| r.keys())
            .collect::<BTreeSet<_>>();
        let missing = self
            .entries
            .iter()
            .map(|(key, _)| key.as_str())
            .filter(|key| !seen.contains(key))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            warn!(
                schema = %self.schema_version,
                missing = ?missing,
                "upstream batch lacks mapped fields"
            );
        }
        missing
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, RecordError> {
        let name = self.text(raw, CanonicalField::Name);
        let sequence_number = self.text(raw, CanonicalField::SequenceNumber);
        let secondary_id = self.text(raw, CanonicalField::SecondaryId);

        if name.is_none() && sequence_number.is_none() && secondary_id.is_none() {
            return Err(RecordError::Malformed(
                "no vessel name, escale number or lloyd number".to_string(),
            ));
        }

        let timestamp = self
            .source_keys(CanonicalField::Timestamp)
            .filter_map(|key| raw.get(key))
            .find_map(parse_upstream_timestamp);

        Ok(NormalizedRecord {
            name,
            sequence_number,
            secondary_id,
            vessel_type: split_tokens(self.text(raw, CanonicalField::VesselType).as_deref()),
            operator: split_tokens(self.text(raw, CanonicalField::Operator).as_deref()),
            port: split_tokens(self.text(raw, CanonicalField::Port).as_deref()),
            status: split_tokens(self.text(raw, CanonicalField::Status).as_deref()),
            consignee: self.text(raw, CanonicalField::Consignee),
            timestamp,
        })
    }
}

/// Accepts `/Date(1755817200000+0100)/`, a bare millisecond epoch (number or
/// digit string) or RFC 3339. Anything else is unknown.
pub fn parse_upstream_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(from_millis),
        JsonValue::String(s) => parse_timestamp_text(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    if let Some(inner) = text
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
    {
        // The epoch is already UTC; the trailing +HHMM only describes the sender.
        let end = inner
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '+' || *c == '-')
            .map(|(i, _)| i)
            .unwrap_or(inner.len());
        return inner[..end].parse::<i64>().ok().and_then(from_millis);
    }
    if let Ok(millis) = text.parse::<i64>() {
        return from_millis(millis);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Comma-separated categorical value -> trimmed, non-empty tokens in order.
pub fn split_tokens(value: Option<&str>) -> Vec<String> {
    let tokens = value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    if tokens.is_empty() {
        vec![UNKNOWN_TOKEN.to_string()]
    } else {
        tokens
    }
}
