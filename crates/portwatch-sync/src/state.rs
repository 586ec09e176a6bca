//! Per-source run bookkeeping persisted next to the record store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portwatch_storage::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub last_update: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub total_records: usize,
    pub update_count: u64,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn path_in(source_dir: &Path) -> PathBuf {
        source_dir.join(STATE_FILE)
    }

    /// Missing or unreadable state reads as a fresh default.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable run state");
                Self::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read run state");
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes).await
    }

    /// True when the last successful update is younger than `interval`.
    pub fn is_fresh(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        let Some(last) = self.last_success else {
            return false;
        };
        let age = now - last;
        age >= chrono::Duration::zero()
            && age.to_std().map(|age| age < interval).unwrap_or(false)
    }

    pub fn record_success(&mut self, at: DateTime<Utc>, total_records: usize) {
        self.last_update = Some(at);
        self.last_success = Some(at);
        self.total_records = total_records;
        self.update_count += 1;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.last_update = Some(at);
        self.last_error = Some(message.into());
    }
}
