//! Read-side projections over stored records: filters, facet counts, statistics
//! and the flat export shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use portwatch_core::{CategoryField, StoredRecord};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOP_N: usize = 10;

/// AND-combination of optional filters. Empty strings count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub vessel_type: Option<String>,
    pub operator: Option<String>,
    pub port: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn category(&self, field: CategoryField) -> Option<&str> {
        let value = match field {
            CategoryField::VesselType => self.vessel_type.as_deref(),
            CategoryField::Operator => self.operator.as_deref(),
            CategoryField::Port => self.port.as_deref(),
            CategoryField::Status => self.status.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn matches(&self, stored: &StoredRecord) -> bool {
        let record = &stored.record;

        if self.start.is_some() || self.end.is_some() {
            let Some(ts) = record.timestamp else {
                return false;
            };
            if self.start.is_some_and(|start| ts < start) {
                return false;
            }
            if self.end.is_some_and(|end| ts > end) {
                return false;
            }
        }

        for field in CategoryField::ALL {
            if let Some(wanted) = self.category(field) {
                let wanted = wanted.to_lowercase();
                let hit = record
                    .category(field)
                    .iter()
                    .any(|token| token.to_lowercase() == wanted);
                if !hit {
                    return false;
                }
            }
        }

        if let Some(needle) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = needle.to_lowercase();
            let mut haystack = vec![
                record.name.clone().unwrap_or_default(),
                record.consignee.clone().unwrap_or_default(),
            ];
            haystack.extend(record.vessel_type.iter().cloned());
            haystack.extend(record.operator.iter().cloned());
            haystack.extend(record.port.iter().cloned());
            if !haystack.join(" ").to_lowercase().contains(&needle) {
                return false;
            }
        }

        true
    }

    /// Filtered copy ordered for display, truncated to `limit`.
    pub fn apply(&self, records: &[StoredRecord]) -> Vec<StoredRecord> {
        let mut out = records
            .iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        sort_for_display(&mut out);
        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            out.truncate(limit);
        }
        out
    }
}

/// Newest first; unknown timestamps sink to the end.
pub fn sort_for_display(records: &mut [StoredRecord]) {
    records.sort_by(|a, b| {
        b.record
            .timestamp
            .cmp(&a.record.timestamp)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
}

/// Token counts per categorical field, used for filter pickers and charts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Facets(pub BTreeMap<CategoryField, BTreeMap<String, usize>>);

impl Facets {
    pub fn count(&self, field: CategoryField, token: &str) -> usize {
        self.0
            .get(&field)
            .and_then(|m| m.get(token))
            .copied()
            .unwrap_or(0)
    }
}

pub fn facets(records: &[StoredRecord]) -> Facets {
    let mut out = BTreeMap::new();
    for field in CategoryField::ALL {
        let mut counts = BTreeMap::<String, usize>::new();
        for stored in records {
            for token in stored.record.category(field) {
                *counts.entry(token.clone()).or_default() += 1;
            }
        }
        out.insert(field, counts);
    }
    Facets(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub total_records: usize,
    pub top: BTreeMap<CategoryField, Vec<FacetCount>>,
}

pub fn statistics(records: &[StoredRecord], top_n: usize) -> StoreStatistics {
    let top = facets(records)
        .0
        .into_iter()
        .map(|(field, counts)| {
            let mut rows = counts
                .into_iter()
                .map(|(value, count)| FacetCount { value, count })
                .collect::<Vec<_>>();
            rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
            rows.truncate(top_n);
            (field, rows)
        })
        .collect();
    StoreStatistics {
        total_records: records.len(),
        top,
    }
}

/// Flat, string-only projection of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub fingerprint: String,
    pub name: String,
    pub sequence_number: String,
    pub secondary_id: String,
    pub vessel_type: String,
    pub operator: String,
    pub port: String,
    pub status: String,
    pub consignee: String,
    pub timestamp: String,
    pub scraped_at: String,
    pub run_id: String,
    pub groups_matched: String,
    pub match_score: String,
    pub vessel_type_keywords: String,
    pub operator_keywords: String,
    pub port_location_keywords: String,
}

pub fn export_rows(records: &[StoredRecord]) -> Vec<ExportRow> {
    records
        .iter()
        .map(|s| ExportRow {
            fingerprint: s.fingerprint.clone(),
            name: s.record.name.clone().unwrap_or_default(),
            sequence_number: s.record.sequence_number.clone().unwrap_or_default(),
            secondary_id: s.record.secondary_id.clone().unwrap_or_default(),
            vessel_type: s.record.vessel_type.join(", "),
            operator: s.record.operator.join(", "),
            port: s.record.port.join(", "),
            status: s.record.status.join(", "),
            consignee: s.record.consignee.clone().unwrap_or_default(),
            timestamp: s
                .record
                .timestamp
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            scraped_at: s.scraped_at.to_rfc3339(),
            run_id: s.run_id.to_string(),
            groups_matched: s.match_result.groups_matched.to_string(),
            match_score: s.match_result.match_score.to_string(),
            vessel_type_keywords: s.match_result.vessel_type_keywords.join(", "),
            operator_keywords: s.match_result.operator_keywords.join(", "),
            port_location_keywords: s.match_result.port_location_keywords.join(", "),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use portwatch_core::{MatchResult, NormalizedRecord, Verdict, UNKNOWN_TOKEN};
    use uuid::Uuid;

    fn stored(name: &str, port: &str, vessel_type: &str, ts: Option<i64>) -> StoredRecord {
        StoredRecord {
            fingerprint: format!("ns:{name}"),
            scraped_at: Utc.with_ymd_and_hms(2025, 8, 22, 9, 0, 0).single().unwrap(),
            run_id: Uuid::nil(),
            record: NormalizedRecord {
                name: Some(name.into()),
                sequence_number: Some("1".into()),
                secondary_id: None,
                vessel_type: vec![vessel_type.into()],
                operator: vec![UNKNOWN_TOKEN.into()],
                port: vec![port.into()],
                status: vec!["A QUAI".into()],
                consignee: Some("MARSA MAROC".into()),
                timestamp: ts.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            },
            match_result: MatchResult {
                vessel_type_keywords: vec![vessel_type.into()],
                operator_keywords: vec![],
                port_location_keywords: vec![port.into()],
                groups_matched: 2,
                total_groups: 3,
                match_score: 2,
                verdict: Verdict::Pass,
                snippets: vec![],
            },
        }
    }

    fn sample() -> Vec<StoredRecord> {
        vec![
            stored("EPIPHANIA", "VANCOUVER", "VRAQUIER", Some(1_755_817_200_000)),
            stored("ATLANTIC STAR", "CASABLANCA", "TANKER", Some(1_755_900_000_000)),
            stored("NORD PRIDE", "CASABLANCA", "VRAQUIER", None),
        ]
    }

    #[test]
    fn empty_query_orders_newest_first_with_unknown_last() {
        let out = RecordQuery::default().apply(&sample());
        let names = out
            .iter()
            .map(|r| r.record.name.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["ATLANTIC STAR", "EPIPHANIA", "NORD PRIDE"]);
    }

    #[test]
    fn category_filters_combine_with_and() {
        let query = RecordQuery {
            port: Some("casablanca".into()),
            vessel_type: Some("VRAQUIER".into()),
            ..Default::default()
        };
        let out = query.apply(&sample());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record.name.as_deref(), Some("NORD PRIDE"));
    }

    #[test]
    fn date_bounds_exclude_unknown_timestamps() {
        let query = RecordQuery {
            start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single(),
            ..Default::default()
        };
        let out = query.apply(&sample());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.record.timestamp.is_some()));
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let query = RecordQuery {
            search: Some("star".into()),
            ..Default::default()
        };
        assert_eq!(query.apply(&sample()).len(), 1);

        let consignee = RecordQuery {
            search: Some("marsa".into()),
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(consignee.apply(&sample()).len(), 2);
    }

    #[test]
    fn facets_and_statistics_count_tokens() {
        let records = sample();
        let f = facets(&records);
        assert_eq!(f.count(CategoryField::Port, "CASABLANCA"), 2);
        assert_eq!(f.count(CategoryField::Operator, UNKNOWN_TOKEN), 3);

        let stats = statistics(&records, 1);
        assert_eq!(stats.total_records, 3);
        let ports = &stats.top[&CategoryField::Port];
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].value, "CASABLANCA");
        assert_eq!(ports[0].count, 2);
    }

    #[test]
    fn export_rows_flatten_every_field() {
        let rows = export_rows(&sample()[..1]);
        let row = &rows[0];
        assert_eq!(row.name, "EPIPHANIA");
        assert_eq!(row.port, "VANCOUVER");
        assert_eq!(row.timestamp, "2025-08-21T23:00:00+00:00");
        assert_eq!(row.match_score, "2");
        assert_eq!(row.port_location_keywords, "VANCOUVER");
    }
}
