//! Axum JSON API over the record store and the update orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use portwatch_core::{CategoryField, RunPhase, StoredRecord};
use portwatch_storage::{export_rows, facets, Facets, RecordQuery, RecordStore, StoreStatistics};
use portwatch_sync::{
    filter_options, maybe_build_scheduler, RunState, SyncConfig, SyncError, UpdateOrchestrator,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "portwatch-web";

/// Handles shared by every request. Filters travel per request, never here.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub store: Arc<RecordStore>,
}

impl AppState {
    pub fn new(orchestrator: Arc<UpdateOrchestrator>) -> Self {
        let store = orchestrator.store();
        Self {
            orchestrator,
            store,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    source_id: String,
    phase: RunPhase,
    running: bool,
    records: usize,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct RecordsResponse {
    total: usize,
    records: Vec<StoredRecord>,
    facets: Facets,
}

#[derive(Debug, Serialize)]
struct StatisticsResponse {
    statistics: StoreStatistics,
    run_state: RunState,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    removed: usize,
    remaining: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/update", post(update_handler))
        .route("/api/records", get(records_handler))
        .route("/api/records/{fingerprint}", get(record_detail_handler))
        .route("/api/statistics", get(statistics_handler))
        .route("/api/filter-options", get(filter_options_handler))
        .route("/api/export", get(export_handler))
        .route("/api/clean-duplicates", post(clean_duplicates_handler))
        .route("/api/test-connection", get(test_connection_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let orchestrator = Arc::new(UpdateOrchestrator::from_config(&config).await?);
    let scheduler = maybe_build_scheduler(&config, orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, source_id = %config.source_id, "serving portwatch api");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()).await
}

/// Pulls in writes made through other handles, such as a CLI update, before
/// serving from the in-memory view.
async fn current_store(state: &AppState) -> &RecordStore {
    if let Err(err) = state.store.refresh().await {
        warn!(error = %err, "serving cached records; store refresh failed");
    }
    &state.store
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        source_id: state.orchestrator.source_id().to_string(),
        phase: state.orchestrator.phase(),
        running: state.orchestrator.is_running(),
        records: current_store(&state).await.len().await,
    })
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UpdateParams>,
) -> Response {
    match state.orchestrator.run_update(params.force).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
) -> Json<RecordsResponse> {
    let unbounded = RecordQuery {
        limit: None,
        ..query.clone()
    };
    let mut records = current_store(&state).await.query(&unbounded).await;
    let total = records.len();
    let facets = facets(&records);
    if let Some(limit) = query.limit.filter(|l| *l > 0) {
        records.truncate(limit);
    }
    Json(RecordsResponse {
        total,
        records,
        facets,
    })
}

async fn record_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(fingerprint): AxumPath<String>,
) -> Response {
    match current_store(&state).await.get(&fingerprint).await {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "record not found"),
    }
}

async fn statistics_handler(State(state): State<Arc<AppState>>) -> Json<StatisticsResponse> {
    Json(StatisticsResponse {
        statistics: current_store(&state).await.statistics().await,
        run_state: state.orchestrator.state().await,
    })
}

async fn filter_options_handler(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<CategoryField, Vec<String>>> {
    Json(filter_options(&current_store(&state).await.all().await))
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
) -> Response {
    let rows = export_rows(&current_store(&state).await.query(&query).await);
    Json(rows).into_response()
}

async fn clean_duplicates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.clean_duplicates().await {
        Ok(removed) => Json(CleanupResponse {
            removed,
            remaining: state.store.len().await,
        })
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn test_connection_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.test_connection().await).into_response()
}

fn sync_error(err: SyncError) -> Response {
    match err {
        SyncError::RunInProgress => error_response(StatusCode::CONFLICT, &err.to_string()),
        other => {
            error!(error = %other, "request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
