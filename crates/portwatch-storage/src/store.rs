//! Append-only, fingerprint-keyed record store backed by a JSON-lines file.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use portwatch_core::{MatchResult, NormalizedRecord, RecordError, StoredRecord};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::write_atomic;
use crate::fingerprint::{FingerprintPolicy, NameSequencePolicy};
use crate::lock::{peek_generation, DirLock, STORE_LOCK_FILE};
use crate::query::{self, RecordQuery, StoreStatistics};

pub const RECORDS_FILE: &str = "records.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("storage io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding stored record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Record-level failures are counted by a run; everything else aborts it.
    pub fn is_record_level(&self) -> bool {
        matches!(self, StoreError::Record(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// What readers see: committed records only.
#[derive(Debug, Default)]
struct StoreState {
    records: Vec<StoredRecord>,
    index: HashMap<String, usize>,
}

impl StoreState {
    fn from_records(records: Vec<StoredRecord>) -> Self {
        let mut state = Self::default();
        for record in records {
            state.push(record);
        }
        state
    }

    fn push(&mut self, record: StoredRecord) {
        let idx = self.records.len();
        self.index.entry(record.fingerprint.clone()).or_insert(idx);
        self.records.push(record);
    }

    fn contains(&self, fingerprint: &str) -> bool {
        self.index.contains_key(fingerprint)
    }
}

/// How far into the file this handle has read, and which rewrite it read.
#[derive(Debug)]
struct WriterState {
    committed_len: u64,
    generation: u64,
}

/// One store per upstream data source.
///
/// Writers serialize on an in-process mutex and then on an advisory lock file,
/// so handles in other processes see each other's appends before deciding
/// whether a fingerprint is new. Readers only touch the published view, which
/// is updated after the append is durable.
pub struct RecordStore {
    dir: PathBuf,
    path: PathBuf,
    lock_path: PathBuf,
    policy: Arc<dyn FingerprintPolicy>,
    state: RwLock<StoreState>,
    writer: Mutex<WriterState>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    pub async fn open(data_dir: impl AsRef<Path>, source_id: &str) -> Result<Self, StoreError> {
        Self::open_with_policy(data_dir, source_id, Arc::new(NameSequencePolicy)).await
    }

    pub async fn open_with_policy(
        data_dir: impl AsRef<Path>,
        source_id: &str,
        policy: Arc<dyn FingerprintPolicy>,
    ) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref().join(source_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(RECORDS_FILE);
        let lock_path = dir.join(STORE_LOCK_FILE);

        let mut lock = DirLock::acquire(&lock_path)
            .await
            .map_err(|e| StoreError::io(&lock_path, e))?;
        let generation = lock.generation().map_err(|e| StoreError::io(&lock_path, e))?;
        let (records, committed_len) = read_committed(&path, 0).await?;
        drop(lock);

        info!(path = %path.display(), records = records.len(), "opened record store");
        Ok(Self {
            dir,
            path,
            lock_path,
            policy,
            state: RwLock::new(StoreState::from_records(records)),
            writer: Mutex::new(WriterState {
                committed_len,
                generation,
            }),
        })
    }

    /// `<data_dir>/<source_id>`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self, record: &NormalizedRecord) -> Result<String, RecordError> {
        self.policy.fingerprint(record)
    }

    /// Appends a record unless its fingerprint is already present.
    pub async fn insert(
        &self,
        record: NormalizedRecord,
        match_result: MatchResult,
        run_id: Uuid,
        scraped_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let fingerprint = self.policy.fingerprint(&record)?;
        if self.state.read().await.contains(&fingerprint) {
            debug!(%fingerprint, "duplicate record discarded");
            return Ok(InsertOutcome::Duplicate);
        }

        let mut writer = self.writer.lock().await;
        let mut lock = self.lock_store().await?;
        self.catch_up(&mut writer, &mut lock).await?;
        if self.state.read().await.contains(&fingerprint) {
            debug!(%fingerprint, "duplicate record discarded");
            return Ok(InsertOutcome::Duplicate);
        }

        let stored = StoredRecord {
            fingerprint,
            scraped_at,
            run_id,
            record,
            match_result,
        };
        let mut line = serde_json::to_vec(&stored)?;
        line.push(b'\n');

        append_line(&self.path, writer.committed_len, &line).await?;
        writer.committed_len += line.len() as u64;
        self.state.write().await.push(stored);
        Ok(InsertOutcome::Inserted)
    }

    /// Drops every record whose fingerprint repeats, keeping the earliest scrape
    /// of each group, and rewrites the file atomically. Returns how many went.
    ///
    /// Fingerprints are recomputed with the current policy where possible so a
    /// policy change can be repaired after the fact.
    pub async fn bulk_merge_and_cleanup(&self) -> Result<usize, StoreError> {
        let mut writer = self.writer.lock().await;
        let mut lock = self.lock_store().await?;
        self.catch_up(&mut writer, &mut lock).await?;

        let state = self.state.read().await;
        let keys = state
            .records
            .iter()
            .map(|r| {
                self.policy
                    .fingerprint(&r.record)
                    .unwrap_or_else(|_| r.fingerprint.clone())
            })
            .collect::<Vec<_>>();

        let mut winners: HashMap<&str, usize> = HashMap::new();
        for (idx, key) in keys.iter().enumerate() {
            match winners.entry(key.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(idx);
                }
                Entry::Occupied(mut slot) => {
                    if state.records[idx].scraped_at < state.records[*slot.get()].scraped_at {
                        slot.insert(idx);
                    }
                }
            }
        }

        let removed = state.records.len() - winners.len();
        let rekeyed = keys
            .iter()
            .zip(&state.records)
            .any(|(key, r)| *key != r.fingerprint);
        if removed == 0 && !rekeyed {
            info!("dedup cleanup found nothing to remove");
            return Ok(0);
        }

        let kept = state
            .records
            .iter()
            .enumerate()
            .filter(|(idx, _)| winners.get(keys[*idx].as_str()) == Some(idx))
            .map(|(idx, r)| StoredRecord {
                fingerprint: keys[idx].clone(),
                ..r.clone()
            })
            .collect::<Vec<_>>();
        drop(state);

        let mut bytes = Vec::new();
        for record in &kept {
            serde_json::to_writer(&mut bytes, record)?;
            bytes.push(b'\n');
        }

        // Bumped before the rename so no handle can miss the rewrite.
        let generation = writer.generation + 1;
        lock.set_generation(generation)
            .map_err(|e| StoreError::io(&self.lock_path, e))?;
        writer.generation = generation;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        writer.committed_len = bytes.len() as u64;

        info!(removed, remaining = kept.len(), "dedup cleanup rewrote store");
        *self.state.write().await = StoreState::from_records(kept);
        Ok(removed)
    }

    /// Picks up appends and rewrites made through other handles on the same
    /// directory. Returns whether the visible records changed.
    pub async fn refresh(&self) -> Result<bool, StoreError> {
        // A local write in flight catches up on its own.
        let Ok(mut writer) = self.writer.try_lock() else {
            return Ok(false);
        };
        let on_disk = file_len(&self.path).await?;
        if on_disk == writer.committed_len
            && peek_generation(&self.lock_path).await == writer.generation
        {
            return Ok(false);
        }

        let before = (writer.committed_len, writer.generation);
        let mut lock = self.lock_store().await?;
        self.catch_up(&mut writer, &mut lock).await?;
        Ok((writer.committed_len, writer.generation) != before)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, fingerprint: &str) -> Option<StoredRecord> {
        let state = self.state.read().await;
        state
            .index
            .get(fingerprint)
            .and_then(|idx| state.records.get(*idx))
            .cloned()
    }

    pub async fn all(&self) -> Vec<StoredRecord> {
        self.state.read().await.records.clone()
    }

    pub async fn query(&self, filters: &RecordQuery) -> Vec<StoredRecord> {
        filters.apply(&self.state.read().await.records)
    }

    pub async fn statistics(&self) -> StoreStatistics {
        query::statistics(&self.state.read().await.records, query::DEFAULT_TOP_N)
    }

    async fn lock_store(&self) -> Result<DirLock, StoreError> {
        DirLock::acquire(&self.lock_path)
            .await
            .map_err(|e| StoreError::io(&self.lock_path, e))
    }

    /// Brings the published view up to the file on disk. Needs the store lock.
    async fn catch_up(
        &self,
        writer: &mut WriterState,
        lock: &mut DirLock,
    ) -> Result<(), StoreError> {
        let generation = lock
            .generation()
            .map_err(|e| StoreError::io(&self.lock_path, e))?;
        let on_disk = file_len(&self.path).await?;

        if generation != writer.generation || on_disk < writer.committed_len {
            let (records, committed_len) = read_committed(&self.path, 0).await?;
            info!(
                path = %self.path.display(),
                records = records.len(),
                "reloaded record store after a rewrite elsewhere"
            );
            *self.state.write().await = StoreState::from_records(records);
            writer.committed_len = committed_len;
            writer.generation = generation;
        } else if on_disk > writer.committed_len {
            let (fresh, committed_len) = read_committed(&self.path, writer.committed_len).await?;
            if !fresh.is_empty() {
                debug!(count = fresh.len(), "picked up records appended elsewhere");
                let mut state = self.state.write().await;
                for record in fresh {
                    state.push(record);
                }
            }
            writer.committed_len = committed_len;
        }
        Ok(())
    }
}

async fn file_len(path: &Path) -> Result<u64, StoreError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

async fn append_line(path: &Path, committed_len: u64, line: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    let written = async {
        file.write_all(line).await?;
        file.flush().await?;
        file.sync_data().await
    }
    .await;

    if let Err(err) = written {
        // A torn tail would glue the next append onto a broken line.
        if let Err(trunc_err) = file.set_len(committed_len).await {
            warn!(path = %path.display(), error = %trunc_err, "could not roll back partial append");
        }
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

/// Reads whole lines from `offset` to the end of the file. A torn trailing
/// line is cut off. Returns the records and the new committed length.
async fn read_committed(path: &Path, offset: u64) -> Result<(Vec<StoredRecord>, u64), StoreError> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let mut bytes = Vec::new();
    async {
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_to_end(&mut bytes).await
    }
    .await
    .map_err(|e| StoreError::io(path, e))?;

    let committed = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    if committed < bytes.len() {
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - committed,
            "truncating torn trailing record"
        );
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.set_len(offset + committed as u64)
            .await
            .map_err(|e| StoreError::io(path, e))?;
    }

    let mut records = Vec::new();
    let mut line_start = offset;
    for line in bytes[..committed].split(|b| *b == b'\n') {
        let at = line_start;
        line_start += line.len() as u64 + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<StoredRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(
                path = %path.display(),
                byte_offset = at,
                error = %err,
                "skipping unreadable stored record"
            ),
        }
    }
    Ok((records, offset + committed as u64))
}
