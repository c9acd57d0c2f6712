//! Opera API daemon (opera-apid)
//!
//! Serves chain data from a SQLite store backed by a chain node, and keeps
//! the store current with the block and log ingestion services.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file
//! opera-apid run --config config.yaml
//!
//! # Override the configured log level
//! opera-apid run --config config.yaml --log-level debug
//!
//! # Validate a config file and exit
//! opera-apid check-config --config config.yaml
//! ```

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use opera_chain_index::{JsonRpcNodeClient, PersistentStore, Repository, SqliteStore};
use opera_operations::shutdown::FnComponent;
use opera_operations::{
    init_logging_from_config, load_config, run_startup_sequence, ApiConfig, MetricsRegistry,
    ServiceManager, ShutdownCoordinator, SignalHandler,
};
use opera_svc::{register_ingestion, TopicTable};

type DaemonResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "opera-apid")]
#[command(about = "Opera chain data API daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingestion until SIGINT/SIGTERM
    Run(RunArgs),
    /// Validate a configuration file and exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: String,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    common: ConfigArgs,

    /// Log level overriding `observability.log_level`
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::CheckConfig(args) => check_config(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "opera-apid failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(args: &ConfigArgs) -> DaemonResult<()> {
    let config = load_config(&args.config)?;
    println!(
        "{}: ok (node {}, store {})",
        args.config, config.node.url, config.store.path
    );
    Ok(())
}

fn run(args: RunArgs) -> DaemonResult<()> {
    let mut config = load_config(&args.common.config)?;
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }

    let _levels = init_logging_from_config(
        &config.observability.log_level,
        &config.observability.log_format,
    );
    tracing::info!(config = %args.common.config, "=== Opera API daemon ===");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_daemon(config))
}

fn open_store(config: &ApiConfig) -> DaemonResult<SqliteStore> {
    let mut opened = None;
    run_startup_sequence(
        config,
        Some(|| {
            let store = SqliteStore::open(&config.store.path, config.store.read_pool_size)?;
            store.last_known_block()?;
            opened = Some(store);
            Ok::<_, opera_chain_index::RepositoryError>(())
        }),
    )?;

    // startup checks may be disabled, in which case nothing was opened yet
    match opened {
        Some(store) => Ok(store),
        None => Ok(SqliteStore::open(
            &config.store.path,
            config.store.read_pool_size,
        )?),
    }
}

async fn run_daemon(config: ApiConfig) -> DaemonResult<()> {
    let metrics = Arc::new(MetricsRegistry::new());

    let store = Arc::new(open_store(&config)?);
    let resume = store.last_known_block()?;
    tracing::info!(path = %config.store.path, last_known_block = ?resume, "store opened");

    let node = Arc::new(JsonRpcNodeClient::connect(
        &config.node.url,
        config.node.request_timeout(),
    )?);
    let repo = Arc::new(Repository::new(
        store,
        node,
        config.to_repository_config(),
    ));

    let manager = Arc::new(ServiceManager::new());
    if config.indexer.enabled {
        register_ingestion(
            &manager,
            Arc::clone(&repo),
            Arc::clone(&metrics.indexer),
            TopicTable::standard(),
            &config.indexer,
        )?;
    } else {
        tracing::info!("ingestion disabled via configuration");
    }
    manager.run_all().await?;
    tracing::info!(services = manager.running(), "services started");

    let signals = SignalHandler::new();
    signals.start();
    signals.wait().await;
    tracing::info!("shutdown requested");

    let coordinator = ShutdownCoordinator::new(config.operations.shutdown_timeout());
    if config.observability.metrics_enabled {
        let registry = Arc::clone(&metrics);
        coordinator
            .register(Arc::new(FnComponent::new("metrics", move || {
                tracing::info!(metrics = %registry.encode_prometheus(), "final metrics");
            })))
            .await;
    }
    // registered last, stopped first
    coordinator.register(manager).await;
    coordinator.shutdown().await?;

    tracing::info!("opera-apid stopped");
    Ok(())
}
