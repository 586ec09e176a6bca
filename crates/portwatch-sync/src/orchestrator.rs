//! One update run: fetch, normalize, match, persist, and report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use portwatch_adapters::{
    test_connection, AnpApiClient, ConnectionReport, FieldMap, FixtureUpstream, UpstreamClient,
};
use portwatch_core::{
    FailureKind, MatchResult, NormalizedRecord, RawRecord, RunPhase, RunStatus, RunSummary,
};
use portwatch_storage::{
    DirLock, HttpClientConfig, HttpFetcher, InsertOutcome, RecordStore, StoreError, RUN_LOCK_FILE,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::matcher::Matcher;
use crate::state::RunState;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("an update run is already in progress")]
    RunInProgress,
    #[error("run lock at {path}: {source}")]
    RunLock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("update task failed: {0}")]
    Task(#[from] JoinError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub fetch_timeout: Duration,
    pub min_update_interval: Duration,
    pub state_path: PathBuf,
}

/// A run-level failure; the run stops where it is.
struct Abort {
    kind: FailureKind,
    message: String,
}

impl Abort {
    fn upstream(err: impl std::fmt::Display) -> Self {
        Self {
            kind: FailureKind::UpstreamUnavailable,
            message: err.to_string(),
        }
    }
}

/// Proof that this caller owns the source for a run or a cleanup, both
/// within this process and against other processes on the same directory.
struct RunClaim {
    _local: OwnedMutexGuard<()>,
    _shared: DirLock,
}

/// Marks the phase `Failed` if a run ends without reaching a final phase.
struct PhaseReset<'a>(&'a watch::Sender<RunPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|phase| match phase {
            RunPhase::Idle | RunPhase::Failed => false,
            _ => {
                *phase = RunPhase::Failed;
                true
            }
        });
    }
}

/// Drives runs for one data source. At most one run is in flight at a time.
pub struct UpdateOrchestrator {
    upstream: Arc<dyn UpstreamClient>,
    field_map: Arc<FieldMap>,
    matcher: Arc<Matcher>,
    store: Arc<RecordStore>,
    options: OrchestratorOptions,
    run_lock: Arc<Mutex<()>>,
    phase: watch::Sender<RunPhase>,
}

impl UpdateOrchestrator {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        field_map: FieldMap,
        matcher: Matcher,
        store: Arc<RecordStore>,
        options: OrchestratorOptions,
    ) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            upstream,
            field_map: Arc::new(field_map),
            matcher: Arc::new(matcher),
            store,
            options,
            run_lock: Arc::new(Mutex::new(())),
            phase,
        }
    }

    /// Wires the configured upstream, keyword groups, field map and store.
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let field_map = FieldMap::for_schema(&config.schema_version)
            .context("checking upstream field mapping")?;
        let matcher = Matcher::load(&config.keywords_path)
            .await
            .context("loading keyword groups")?;
        let store = RecordStore::open(&config.data_dir, &config.source_id)
            .await
            .context("opening record store")?;

        let upstream: Arc<dyn UpstreamClient> = match &config.fixture_path {
            Some(path) => {
                info!(path = %path.display(), "using fixture upstream");
                Arc::new(FixtureUpstream::new(&config.source_id, path))
            }
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: config.fetch_timeout(),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                Arc::new(AnpApiClient::new(
                    &config.source_id,
                    &config.upstream_url,
                    Arc::new(http),
                ))
            }
        };

        Ok(Self::new(
            upstream,
            field_map,
            matcher,
            Arc::new(store),
            OrchestratorOptions {
                fetch_timeout: config.fetch_timeout(),
                min_update_interval: config.min_update_interval(),
                state_path: RunState::path_in(&config.source_dir()),
            },
        ))
    }

    pub fn store(&self) -> Arc<RecordStore> {
        self.store.clone()
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn source_id(&self) -> &str {
        self.upstream.source_id()
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Only sees runs started through this orchestrator.
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub async fn state(&self) -> RunState {
        RunState::load(&self.options.state_path).await
    }

    /// Runs one update unless another is in flight here or in another
    /// process. Run-level failures are reported in the summary, not as errors.
    ///
    /// The run executes on its own task and completes even if the caller stops
    /// waiting for it.
    pub async fn run_update(self: &Arc<Self>, force: bool) -> Result<RunSummary, SyncError> {
        let claim = self.claim_run().await?;
        let run_id = Uuid::new_v4();
        let span = info_span!("update_run", %run_id, source_id = self.upstream.source_id(), force);

        let this = Arc::clone(self);
        let task = tokio::spawn(
            async move {
                let _claim = claim;
                let _reset = PhaseReset(&this.phase);
                this.run_locked(run_id, force).await
            }
            .instrument(span),
        );
        task.await?
    }

    async fn claim_run(&self) -> Result<RunClaim, SyncError> {
        let local = self
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SyncError::RunInProgress)?;
        let path = self.store.dir().join(RUN_LOCK_FILE);
        match DirLock::try_acquire(&path).await {
            Ok(Some(shared)) => Ok(RunClaim {
                _local: local,
                _shared: shared,
            }),
            Ok(None) => {
                debug!(path = %path.display(), "run lock held by another process");
                Err(SyncError::RunInProgress)
            }
            Err(source) => Err(SyncError::RunLock { path, source }),
        }
    }

    async fn run_locked(&self, run_id: Uuid, force: bool) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::started(run_id, Utc::now());
        let mut state = self.state().await;

        if !force && state.is_fresh(summary.started_at, self.options.min_update_interval) {
            summary.total_records = self.store.len().await;
            self.phase.send_replace(RunPhase::Idle);
            info!("store updated recently; skipping run");
            return Ok(summary.finish(
                Utc::now(),
                RunStatus::Skipped {
                    reason: "last successful update is within the minimum interval".to_string(),
                },
            ));
        }

        let outcome = self.pipeline(run_id, &mut summary).await;
        summary.total_records = self.store.len().await;
        let finished_at = Utc::now();

        let status = match outcome {
            Ok(()) => {
                self.phase.send_replace(RunPhase::Idle);
                state.record_success(finished_at, summary.total_records);
                info!(
                    fetched = summary.fetched,
                    matched = summary.matched,
                    inserted = summary.inserted,
                    duplicates = summary.duplicates,
                    record_errors = summary.record_errors,
                    "update run completed"
                );
                RunStatus::Completed
            }
            Err(abort) => {
                self.phase.send_replace(RunPhase::Failed);
                state.record_failure(finished_at, &abort.message);
                warn!(kind = ?abort.kind, error = %abort.message, "update run failed");
                RunStatus::Failed {
                    kind: abort.kind,
                    message: abort.message,
                }
            }
        };

        if let Err(err) = state.save(&self.options.state_path).await {
            warn!(error = %err, path = %self.options.state_path.display(), "could not persist run state");
        }
        Ok(summary.finish(finished_at, status))
    }

    async fn pipeline(&self, run_id: Uuid, summary: &mut RunSummary) -> Result<(), Abort> {
        self.phase.send_replace(RunPhase::Fetching);
        let raws = match tokio::time::timeout(self.options.fetch_timeout, self.upstream.fetch(run_id))
            .await
        {
            Ok(Ok(raws)) => raws,
            Ok(Err(err)) => return Err(Abort::upstream(err)),
            Err(_) => {
                return Err(Abort::upstream(format!(
                    "upstream fetch timed out after {:?}",
                    self.options.fetch_timeout
                )))
            }
        };
        summary.fetched = raws.len();
        if raws.is_empty() {
            return Err(Abort::upstream("upstream returned no vessel records"));
        }
        self.field_map.check_batch(&raws);

        self.phase.send_replace(RunPhase::Normalizing);
        let field_map = self.field_map.clone();
        let normalized = fan_out(raws, move |raw: RawRecord| field_map.normalize(&raw)).await?;
        let mut records = Vec::with_capacity(normalized.len());
        for result in normalized {
            match result {
                Ok(record) => records.push(record),
                Err(err) => {
                    debug!(error = %err, "skipping record");
                    summary.record_errors += 1;
                }
            }
        }
        summary.normalized_ok = records.len();

        self.phase.send_replace(RunPhase::Matching);
        let matcher = self.matcher.clone();
        let evaluated = fan_out(records, move |record: NormalizedRecord| {
            let result = matcher.evaluate(&record);
            (record, result)
        })
        .await?;
        let passing = evaluated
            .into_iter()
            .filter(|(_, result)| result.verdict.is_pass())
            .collect::<Vec<(NormalizedRecord, MatchResult)>>();
        summary.matched = passing.len();

        self.phase.send_replace(RunPhase::Persisting);
        for (record, result) in passing {
            match self.store.insert(record, result, run_id, Utc::now()).await {
                Ok(InsertOutcome::Inserted) => summary.inserted += 1,
                Ok(InsertOutcome::Duplicate) => summary.duplicates += 1,
                Err(err) if err.is_record_level() => {
                    debug!(error = %err, "rejecting record");
                    summary.record_errors += 1;
                }
                Err(err) => {
                    return Err(Abort {
                        kind: FailureKind::StorageIo,
                        message: err.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Collapses duplicate fingerprints in the store. Refused while a run is in flight.
    pub async fn clean_duplicates(&self) -> Result<usize, SyncError> {
        let _claim = self.claim_run().await?;
        Ok(self.store.bulk_merge_and_cleanup().await?)
    }

    pub async fn test_connection(&self) -> ConnectionReport {
        match tokio::time::timeout(
            self.options.fetch_timeout,
            test_connection(self.upstream.as_ref()),
        )
        .await
        {
            Ok(report) => report,
            Err(_) => ConnectionReport {
                source_id: self.upstream.source_id().to_string(),
                ok: false,
                record_count: 0,
                response_time_ms: self.options.fetch_timeout.as_millis(),
                message: format!("no response within {:?}", self.options.fetch_timeout),
            },
        }
    }
}

/// Maps `f` over `items` on blocking worker tasks, one chunk per worker,
/// preserving input order.
async fn fan_out<T, R, F>(items: Vec<T>, f: F) -> Result<Vec<R>, Abort>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let chunk_size = items.len().div_ceil(workers);

    let f = Arc::new(f);
    let mut set = JoinSet::new();
    let mut items = items.into_iter().peekable();
    let mut chunk_count = 0;
    while items.peek().is_some() {
        let chunk = items.by_ref().take(chunk_size).collect::<Vec<_>>();
        let f = f.clone();
        let idx = chunk_count;
        set.spawn_blocking(move || (idx, chunk.into_iter().map(|item| f(item)).collect::<Vec<_>>()));
        chunk_count += 1;
    }

    let mut chunks: Vec<Option<Vec<R>>> = (0..chunk_count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (idx, out) = joined.map_err(|err| Abort {
            kind: FailureKind::Internal,
            message: format!("worker task failed: {err}"),
        })?;
        chunks[idx] = Some(out);
    }
    Ok(chunks.into_iter().flatten().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use portwatch_adapters::{UpstreamError, ANP_SCHEMA_V1};
    use serde_json::{json, Value as JsonValue};

    struct StaticUpstream {
        rows: Vec<JsonValue>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl StaticUpstream {
        fn new(rows: Vec<JsonValue>) -> Self {
            Self {
                rows,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(rows: Vec<JsonValue>, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(rows)
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for StaticUpstream {
        fn source_id(&self) -> &str {
            "anp"
        }

        async fn fetch(&self, _run_id: Uuid) -> Result<Vec<RawRecord>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self
                .rows
                .iter()
                .cloned()
                .filter_map(RawRecord::from_value)
                .collect())
        }
    }

    fn row(name: &str, escale: u64, kind: &str, port: &str) -> JsonValue {
        json!({
            "nOM_NAVIREField": name,
            "nUMERO_ESCALEField": escale,
            "nUMERO_LLOYDField": null,
            "tYP_NAVIREField": kind,
            "oPERATEURField": null,
            "pROVField": port,
            "sITUATIONField": "EN RADE",
            "cONSIGNATAIREField": null,
            "dATE_SITUATIONField": "/Date(1755817200000+0100)/"
        })
    }

    fn batch() -> Vec<JsonValue> {
        vec![
            row("EPIPHANIA", 2025118, "VRAQUIER", "VANCOUVER"),
            row("NORD PRIDE", 2025119, "TANKER", "CASABLANCA"),
            row("LOCAL TUG", 2025120, "REMORQUEUR", "CASABLANCA"),
            row("LOST", 2025121, "VRAQUIER", "ROTTERDAM"),
            json!({"tYP_NAVIREField": "VRAQUIER", "pROVField": "SAFI"}),
        ]
    }

    fn matcher() -> Matcher {
        let w = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Matcher::new(
            &w(&["VRAQUIER", "TANKER"]),
            &w(&["OCP"]),
            &w(&["VANCOUVER", "CASABLANCA", "SAFI"]),
        )
        .unwrap()
    }

    async fn orchestrator(
        dir: &std::path::Path,
        upstream: Arc<dyn UpstreamClient>,
        fetch_timeout: Duration,
        min_update_interval: Duration,
    ) -> Arc<UpdateOrchestrator> {
        let store = RecordStore::open(dir, "anp").await.expect("open store");
        Arc::new(UpdateOrchestrator::new(
            upstream,
            FieldMap::for_schema(ANP_SCHEMA_V1).unwrap(),
            matcher(),
            Arc::new(store),
            OrchestratorOptions {
                fetch_timeout,
                min_update_interval,
                state_path: RunState::path_in(&dir.join("anp")),
            },
        ))
    }

    #[tokio::test]
    async fn full_run_counts_every_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::new(batch())),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;

        let summary = orch.run_update(false).await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.fetched, 5);
        assert_eq!(summary.normalized_ok, 4);
        assert_eq!(summary.record_errors, 1);
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.duplicates, 0);
        assert_eq!(summary.total_records, 2);
        assert_eq!(orch.phase(), RunPhase::Idle);

        let state = orch.state().await;
        assert_eq!(state.update_count, 1);
        assert_eq!(state.total_records, 2);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn second_run_sees_only_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::new(batch())),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;

        orch.run_update(false).await.expect("first run");
        let second = orch.run_update(false).await.expect("second run");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.total_records, 2);
    }

    #[tokio::test]
    async fn fetch_timeout_leaves_store_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::slow(batch(), Duration::from_secs(5))),
            Duration::from_millis(50),
            Duration::ZERO,
        )
        .await;

        let summary = orch.run_update(false).await.expect("run");
        match &summary.status {
            RunStatus::Failed { kind, .. } => assert_eq!(*kind, FailureKind::UpstreamUnavailable),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.total_records, 0);
        assert_eq!(orch.phase(), RunPhase::Failed);
        assert!(orch.store().is_empty().await);

        let state = orch.state().await;
        assert_eq!(state.update_count, 0);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn storage_failure_aborts_with_counts_so_far() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::new(batch())),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;
        // a directory where the records file should be makes every append fail
        std::fs::create_dir_all(orch.store().path()).unwrap();

        let summary = orch.run_update(false).await.expect("run");
        match &summary.status {
            RunStatus::Failed { kind, .. } => assert_eq!(*kind, FailureKind::StorageIo),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(summary.fetched, 5);
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.inserted, 0);
        assert!(orch.store().is_empty().await);
    }

    #[tokio::test]
    async fn recent_success_skips_unless_forced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let upstream = Arc::new(StaticUpstream::new(batch()));
        let orch = orchestrator(
            dir.path(),
            upstream.clone(),
            Duration::from_secs(5),
            Duration::from_secs(300),
        )
        .await;

        orch.run_update(false).await.expect("first run");
        let skipped = orch.run_update(false).await.expect("second run");
        assert!(matches!(skipped.status, RunStatus::Skipped { .. }));
        assert_eq!(skipped.total_records, 2);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let forced = orch.run_update(true).await.expect("forced run");
        assert!(forced.status.is_completed());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::slow(batch(), Duration::from_millis(300))),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;

        let mut phases = orch.subscribe_phase();
        let running = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_update(true).await })
        };
        phases
            .wait_for(|phase| *phase == RunPhase::Fetching)
            .await
            .expect("phase channel open");

        assert!(orch.is_running());
        assert!(matches!(
            orch.run_update(true).await,
            Err(SyncError::RunInProgress)
        ));
        assert!(matches!(
            orch.clean_duplicates().await,
            Err(SyncError::RunInProgress)
        ));

        let summary = running.await.unwrap().expect("first run");
        assert_eq!(summary.inserted, 2);
    }

    #[tokio::test]
    async fn run_lock_covers_every_handle_on_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let serving = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::slow(batch(), Duration::from_millis(300))),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;
        let other = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::new(batch())),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;

        let mut phases = serving.subscribe_phase();
        let running = {
            let serving = serving.clone();
            tokio::spawn(async move { serving.run_update(true).await })
        };
        phases
            .wait_for(|phase| *phase == RunPhase::Fetching)
            .await
            .expect("phase channel open");

        assert!(!other.is_running());
        assert!(matches!(
            other.run_update(true).await,
            Err(SyncError::RunInProgress)
        ));
        assert!(matches!(
            other.clean_duplicates().await,
            Err(SyncError::RunInProgress)
        ));

        running.await.unwrap().expect("first run");
        let after = other.run_update(true).await.expect("second handle runs");
        assert_eq!(after.inserted, 0);
        assert_eq!(after.duplicates, 2);
    }

    #[tokio::test]
    async fn run_finishes_after_the_caller_gives_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::slow(batch(), Duration::from_millis(300))),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;

        let gave_up = tokio::time::timeout(Duration::from_millis(100), orch.run_update(true)).await;
        assert!(gave_up.is_err());

        assert!(orch.is_running());
        tokio::time::timeout(Duration::from_secs(5), async {
            while orch.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run released its lock");

        assert_eq!(orch.phase(), RunPhase::Idle);
        assert_eq!(orch.store().len().await, 2);
        let state = orch.state().await;
        assert_eq!(state.update_count, 1);
        assert!(state.last_update.is_some());
    }

    struct PanickingUpstream;

    #[async_trait]
    impl UpstreamClient for PanickingUpstream {
        fn source_id(&self) -> &str {
            "anp"
        }

        async fn fetch(&self, _run_id: Uuid) -> Result<Vec<RawRecord>, UpstreamError> {
            panic!("upstream client bug");
        }
    }

    #[tokio::test]
    async fn crashed_run_marks_phase_failed_and_releases_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(PanickingUpstream),
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .await;

        assert!(matches!(orch.run_update(true).await, Err(SyncError::Task(_))));
        assert_eq!(orch.phase(), RunPhase::Failed);
        assert!(!orch.is_running());
        assert!(matches!(orch.clean_duplicates().await, Ok(0)));
    }

    #[tokio::test]
    async fn empty_batch_is_reported_as_upstream_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::new(Vec::new())),
            Duration::from_secs(5),
            Duration::from_secs(300),
        )
        .await;

        let summary = orch.run_update(false).await.expect("run");
        match &summary.status {
            RunStatus::Failed { kind, .. } => assert_eq!(*kind, FailureKind::UpstreamUnavailable),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(summary.fetched, 0);

        let state = orch.state().await;
        assert_eq!(state.update_count, 0);
        assert!(state.last_success.is_none());
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn skipped_run_returns_phase_to_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::new(batch())),
            Duration::from_secs(5),
            Duration::from_secs(300),
        )
        .await;
        good.run_update(false).await.expect("seed run");

        let flaky = orchestrator(
            dir.path(),
            Arc::new(StaticUpstream::new(Vec::new())),
            Duration::from_secs(5),
            Duration::from_secs(300),
        )
        .await;
        let failed = flaky.run_update(true).await.expect("forced run");
        assert!(matches!(failed.status, RunStatus::Failed { .. }));
        assert_eq!(flaky.phase(), RunPhase::Failed);

        let skipped = flaky.run_update(false).await.expect("gated run");
        assert!(matches!(skipped.status, RunStatus::Skipped { .. }));
        assert_eq!(flaky.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn fan_out_preserves_order() {
        let out = fan_out((0..1000).collect::<Vec<u32>>(), |n| n * 2)
            .await
            .ok()
            .expect("fan out");
        assert_eq!(out, (0..1000).map(|n| n * 2).collect::<Vec<u32>>());
    }
}
