use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finished_builds_sync::analytics::{AnalyticsDestination, ClickHouseDestination};
use finished_builds_sync::background_jobs::jobs::{AuditLogCleanupJob, FinishedBuildsSyncJob};
use finished_builds_sync::background_jobs::{BackgroundJob, JobContext, JobScheduler};
use finished_builds_sync::config::{
    self, AppConfig, DestinationKind, DestinationSettings, FileConfig,
};
use finished_builds_sync::metrics;
use finished_builds_sync::source_store::{demo, ShardSpec, SqliteSourceStore};
use finished_builds_sync::state_store::SqliteStateStore;
use finished_builds_sync::sync::{SyncOrchestrator, SystemClock};
use finished_builds_sync::SqliteAnalyticsStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing database files (source.db, state.db, analytics.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 0)]
    pub metrics_port: u16,

    /// Where enriched rows are written.
    #[clap(long, default_value = "sqlite")]
    pub destination: DestinationKind,

    /// ClickHouse HTTP endpoint, required with `--destination clickhouse`.
    #[clap(long)]
    pub clickhouse_url: Option<String>,

    /// Number of cooperating workers the event log is partitioned for.
    #[clap(long)]
    pub shard_count: Option<u32>,

    /// Events per page.
    #[clap(long)]
    pub batch_size: Option<usize>,

    /// Pages accumulated before one write to the destination.
    #[clap(long)]
    pub batch_count: Option<usize>,

    /// Time budget of one run, in seconds.
    #[clap(long)]
    pub max_runtime_secs: Option<u64>,

    /// Seconds between runs of a shard in worker mode.
    #[clap(long)]
    pub interval_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync pass for a shard and print the result as JSON.
    Run {
        #[clap(long, default_value_t = 0)]
        shard_id: u32,
    },
    /// Sync every shard on an interval until Ctrl+C.
    Worker,
    /// Create a demo source database with finished builds.
    SeedDemo {
        #[clap(long, default_value_t = 50)]
        builds: usize,
    },
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            metrics_port: args.metrics_port,
            destination: args.destination,
            shard_count: args.shard_count,
            batch_size: args.batch_size,
            batch_count: args.batch_count,
            max_runtime_secs: args.max_runtime_secs,
            interval_secs: args.interval_secs,
            clickhouse_url: args.clickhouse_url.clone(),
        }
    }
}

/// Opens the stores and wires the sync job.
///
/// Must run outside the async runtime: the ClickHouse destination owns a
/// blocking HTTP client.
fn build_sync_job(config: &AppConfig) -> Result<(Arc<FinishedBuildsSyncJob>, Arc<SqliteStateStore>)> {
    info!("Opening state database at {:?}...", config.state_db_path());
    let state_store = Arc::new(SqliteStateStore::new(config.state_db_path())?);

    let destination: Option<Arc<dyn AnalyticsDestination>> = match &config.destination {
        DestinationSettings::Sqlite => {
            info!(
                "Writing to local analytics database at {:?}",
                config.analytics_db_path()
            );
            Some(Arc::new(SqliteAnalyticsStore::new(
                config.analytics_db_path(),
            )?))
        }
        DestinationSettings::ClickHouse(settings) => {
            info!(
                "Writing to ClickHouse table {} at {}",
                settings.table, settings.url
            );
            Some(Arc::new(ClickHouseDestination::new(
                &settings.url,
                &settings.table,
                settings.user.clone(),
                settings.password.clone(),
                settings.timeout,
            )?))
        }
        DestinationSettings::NotConfigured => None,
    };

    let orchestrator = match destination {
        Some(destination) => {
            info!("Opening source database at {:?}...", config.source_db_path());
            let source = Arc::new(SqliteSourceStore::new(config.source_db_path())?);
            Some(Arc::new(SyncOrchestrator::new(
                source.clone(),
                source,
                destination,
                state_store.clone(),
                Arc::new(SystemClock),
                config.sync.clone(),
            )))
        }
        None => None,
    };

    let job = FinishedBuildsSyncJob::new(orchestrator, config.shard_count, config.interval);
    Ok((Arc::new(job), state_store))
}

async fn run_worker(
    config: &AppConfig,
    sync_job: Arc<FinishedBuildsSyncJob>,
    state_store: Arc<SqliteStateStore>,
) -> Result<()> {
    let shutdown_token = CancellationToken::new();
    let job_context = JobContext::new(shutdown_token.child_token(), state_store);
    let mut scheduler = JobScheduler::new(shutdown_token.clone(), job_context);

    for shard in ShardSpec::all(config.shard_count) {
        scheduler.register_job(
            format!("{}[{}]", sync_job.id(), shard),
            sync_job.clone(),
            Some(serde_json::json!({
                "shard_id": shard.shard_id,
                "shard_count": shard.shard_count,
            })),
        );
    }
    let cleanup = AuditLogCleanupJob::new(config.audit_log_retention_days);
    scheduler.register_job(cleanup.id(), Arc::new(cleanup), None);

    if config.metrics_port != 0 {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.metrics_port))
            .await
            .with_context(|| format!("Failed to bind metrics port {}", config.metrics_port))?;
        info!("Metrics available at port {}!", config.metrics_port);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics::metrics_router()).await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        signal_token.cancel();
    });

    scheduler.run().await;
    Ok(())
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&config::CliConfig::from(&cli_args), file_config)?;

    metrics::init_metrics();

    match cli_args.command {
        Command::SeedDemo { builds } => {
            let store = SqliteSourceStore::new(app_config.source_db_path())?;
            let seeded = demo::seed_demo(&store, builds)?;
            info!(
                "Demo source database ready at {:?} with {} pending events",
                app_config.source_db_path(),
                seeded
            );
        }
        Command::Run { shard_id } => {
            let (sync_job, _state_store) = build_sync_job(&app_config)?;
            let result = sync_job.invoke(shard_id, app_config.shard_count)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Worker => {
            let (sync_job, state_store) = build_sync_job(&app_config)?;
            info!(
                "Starting worker for {} shards every {:?}",
                app_config.shard_count, app_config.interval
            );
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            let result = runtime.block_on(run_worker(&app_config, sync_job.clone(), state_store));
            runtime.shutdown_timeout(std::time::Duration::from_secs(5));
            // Dropped here, outside the runtime, together with its HTTP client.
            drop(sync_job);
            result?;
        }
    }

    Ok(())
}
