//! Keyword matching, update orchestration, run state and scheduling for portwatch.

pub mod config;
pub mod matcher;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

pub use config::SyncConfig;
pub use matcher::{
    filter_options, EntityHits, ExtractedEntities, GroupId, KeywordConfigError, KeywordGroup,
    Matcher,
};
pub use orchestrator::{OrchestratorOptions, SyncError, UpdateOrchestrator};
pub use scheduler::maybe_build_scheduler;
pub use state::{RunState, STATE_FILE};

pub const CRATE_NAME: &str = "portwatch-sync";

/// One update run with configuration taken from the environment.
pub async fn run_update_from_env(force: bool) -> anyhow::Result<portwatch_core::RunSummary> {
    let config = SyncConfig::from_env();
    let orchestrator = std::sync::Arc::new(UpdateOrchestrator::from_config(&config).await?);
    Ok(orchestrator.run_update(force).await?)
}
