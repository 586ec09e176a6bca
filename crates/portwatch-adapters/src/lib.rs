//! Upstream client contracts, the ANP vessel-movement client, the fixture
//! fallback, record normalization and report section parsing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use portwatch_core::RawRecord;
use portwatch_storage::{FetchError, HttpFetcher};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod normalize;
pub mod sections;

pub use normalize::{
    parse_upstream_timestamp, split_tokens, CanonicalField, FieldMap, NormalizeError,
    ANP_SCHEMA_V1,
};
pub use sections::{html_to_text, parse_report, parse_sections, ReportSections, SectionKind};

pub const CRATE_NAME: &str = "portwatch-adapters";

pub const ANP_VESSELS_URL: &str = "https://www.anp.org.ma/_vti_bin/WS/Service.svc/mvmnv/all";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected upstream payload: {0}")]
    UnexpectedPayload(String),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can hand the orchestrator a batch of raw upstream rows.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, run_id: Uuid) -> Result<Vec<RawRecord>, UpstreamError>;
}

/// Decodes a JSON array of objects. Non-object entries are dropped.
pub fn parse_records_payload(bytes: &[u8]) -> Result<Vec<RawRecord>, UpstreamError> {
    let value: JsonValue = serde_json::from_slice(bytes)
        .map_err(|e| UpstreamError::UnexpectedPayload(format!("invalid JSON: {e}")))?;
    let JsonValue::Array(items) = value else {
        return Err(UpstreamError::UnexpectedPayload(
            "expected a JSON array of records".to_string(),
        ));
    };
    let total = items.len();
    let records = items
        .into_iter()
        .filter_map(RawRecord::from_value)
        .collect::<Vec<_>>();
    if records.len() < total {
        warn!(dropped = total - records.len(), "skipping non-object upstream entries");
    }
    Ok(records)
}

/// REST/JSON client for the ANP vessel movement feed.
#[derive(Debug, Clone)]
pub struct AnpApiClient {
    source_id: String,
    url: String,
    http: Arc<HttpFetcher>,
}

impl AnpApiClient {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpstreamClient for AnpApiClient {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, run_id: Uuid) -> Result<Vec<RawRecord>, UpstreamError> {
        let response = self
            .http
            .fetch_bytes(run_id, &self.source_id, &self.url)
            .await?;
        let records = parse_records_payload(&response.body)?;
        info!(%run_id, records = records.len(), url = %response.final_url, "received upstream batch");
        Ok(records)
    }
}

/// Offline fallback that serves a captured JSON payload from disk.
#[derive(Debug, Clone)]
pub struct FixtureUpstream {
    source_id: String,
    path: PathBuf,
}

impl FixtureUpstream {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UpstreamClient for FixtureUpstream {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, run_id: Uuid) -> Result<Vec<RawRecord>, UpstreamError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| UpstreamError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        let records = parse_records_payload(&bytes)?;
        info!(%run_id, records = records.len(), path = %self.path.display(), "loaded fixture batch");
        Ok(records)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub source_id: String,
    pub ok: bool,
    pub record_count: usize,
    pub response_time_ms: u128,
    pub message: String,
}

/// One fetch, timed. Never fails; the outcome is in the report.
pub async fn test_connection(client: &dyn UpstreamClient) -> ConnectionReport {
    let started = Instant::now();
    let outcome = client.fetch(Uuid::new_v4()).await;
    let response_time_ms = started.elapsed().as_millis();
    match outcome {
        Ok(records) => ConnectionReport {
            source_id: client.source_id().to_string(),
            ok: true,
            record_count: records.len(),
            response_time_ms,
            message: format!("fetched {} records", records.len()),
        },
        Err(err) => ConnectionReport {
            source_id: client.source_id().to_string(),
            ok: false,
            record_count: 0,
            response_time_ms,
            message: err.to_string(),
        },
    }
}
