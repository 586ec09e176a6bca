use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use portwatch_core::RunStatus;
use portwatch_storage::{export_rows, RecordQuery, RecordStore};
use portwatch_sync::{SyncConfig, UpdateOrchestrator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "portwatch")]
#[command(about = "Port vessel movement watch: fetch, filter and deduplicate ANP movements")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, match and store one batch of vessel movements.
    Update {
        /// Run even if the last successful update is recent.
        #[arg(long)]
        force: bool,
    },
    /// Serve the JSON API (and the cron scheduler when enabled).
    Serve,
    /// Collapse stored records that share a fingerprint.
    Cleanup,
    /// Print stored records as flat rows (JSON).
    Export(ExportArgs),
    /// Print totals and top-10 counts per category.
    Stats,
    /// Split a weekly market report (HTML or text) into vessel-class sections.
    Sections { file: PathBuf },
    /// Fetch once from the upstream and report what came back.
    CheckConnection,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    vessel_type: Option<String>,
    #[arg(long)]
    operator: Option<String>,
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    search: Option<String>,
    /// Write to this file instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl ExportArgs {
    fn query(&self) -> RecordQuery {
        RecordQuery {
            vessel_type: self.vessel_type.clone(),
            operator: self.operator.clone(),
            port: self.port.clone(),
            status: self.status.clone(),
            search: self.search.clone(),
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<RecordStore> {
    RecordStore::open(&config.data_dir, &config.source_id)
        .await
        .context("opening record store")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Update { force: false }) {
        Commands::Update { force } => {
            let orchestrator = Arc::new(UpdateOrchestrator::from_config(&config).await?);
            let summary = orchestrator.run_update(force).await?;
            println!(
                "update {}: run_id={} fetched={} matched={} inserted={} duplicates={} record_errors={} total={}",
                match &summary.status {
                    RunStatus::Completed => "completed".to_string(),
                    RunStatus::Skipped { reason } => format!("skipped ({reason})"),
                    RunStatus::Failed { kind, message } => format!("failed ({kind:?}: {message})"),
                },
                summary.run_id,
                summary.fetched,
                summary.matched,
                summary.inserted,
                summary.duplicates,
                summary.record_errors,
                summary.total_records
            );
            if let RunStatus::Failed { message, .. } = summary.status {
                anyhow::bail!("update failed: {message}");
            }
        }
        Commands::Serve => {
            portwatch_web::serve(config).await?;
        }
        Commands::Cleanup => {
            let orchestrator = UpdateOrchestrator::from_config(&config).await?;
            let removed = orchestrator.clean_duplicates().await?;
            println!(
                "cleanup removed {removed} duplicates; {} records remain",
                orchestrator.store().len().await
            );
        }
        Commands::Export(args) => {
            let store = open_store(&config).await?;
            let rows = export_rows(&store.query(&args.query()).await);
            let text = serde_json::to_string_pretty(&rows)?;
            match &args.output {
                Some(path) => {
                    tokio::fs::write(path, text)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(rows = rows.len(), path = %path.display(), "export written");
                }
                None => println!("{text}"),
            }
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            print_json(&store.statistics().await)?;
        }
        Commands::Sections { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            print_json(&portwatch_adapters::parse_report(&content))?;
        }
        Commands::CheckConnection => {
            let orchestrator = UpdateOrchestrator::from_config(&config).await?;
            let report = orchestrator.test_connection().await;
            print_json(&report)?;
            if !report.ok {
                anyhow::bail!("upstream check failed: {}", report.message);
            }
        }
    }

    Ok(())
}
