use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use portwatch_adapters::{ANP_SCHEMA_V1, ANP_VESSELS_URL};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub source_id: String,
    pub upstream_url: String,
    /// When set, runs read this JSON file instead of calling the upstream.
    pub fixture_path: Option<PathBuf>,
    pub keywords_path: PathBuf,
    pub schema_version: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_update_interval_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup("PORTWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            source_id: lookup("PORTWATCH_SOURCE_ID").unwrap_or_else(|| "anp".to_string()),
            upstream_url: lookup("PORTWATCH_UPSTREAM_URL")
                .unwrap_or_else(|| ANP_VESSELS_URL.to_string()),
            fixture_path: lookup("PORTWATCH_FIXTURE_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            keywords_path: lookup("PORTWATCH_KEYWORDS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/keywords.yaml")),
            schema_version: lookup("PORTWATCH_SCHEMA_VERSION")
                .unwrap_or_else(|| ANP_SCHEMA_V1.to_string()),
            user_agent: lookup("PORTWATCH_USER_AGENT")
                .unwrap_or_else(|| "portwatch-bot/0.1".to_string()),
            http_timeout_secs: parsed(&lookup, "PORTWATCH_HTTP_TIMEOUT_SECS").unwrap_or(30),
            min_update_interval_secs: parsed(&lookup, "PORTWATCH_MIN_UPDATE_INTERVAL_SECS")
                .unwrap_or(300),
            scheduler_enabled: lookup("PORTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("PORTWATCH_SYNC_CRON")
                .unwrap_or_else(|| "0 */30 * * * *".to_string()),
            web_port: parsed(&lookup, "PORTWATCH_WEB_PORT").unwrap_or(8000),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn min_update_interval(&self) -> Duration {
        Duration::from_secs(self.min_update_interval_secs)
    }

    pub fn source_dir(&self) -> PathBuf {
        self.data_dir.join(&self.source_id)
    }
}

/// Unparsable values fall back to the default like missing ones.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
