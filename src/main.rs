use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use catalog_sync::catalog::CatalogWriter;
use catalog_sync::config::{Config, LoggingConfig};
use catalog_sync::dsn;
use catalog_sync::logging::init_logging;
use catalog_sync::parsers::text::RussianTextNormalizer;
use catalog_sync::parsers::ParserRegistry;
use catalog_sync::queue::{JobQueue, Worker};
use catalog_sync::receiver::ReceiverReader;
use catalog_sync::server::{build_router, AppState};
use catalog_sync::storage::StorageClient;
use catalog_sync::sync::SyncEngine;

#[derive(Parser)]
#[command(name = "catalog_sync")]
#[command(about = "Incremental catalog sync engine and job queue daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Console log format, overrides [logging] in the config file.
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Log level, overrides [logging] in the config file and RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run migrations, then start the HTTP server and worker; blocks until shutdown.
    Daemon {
        #[arg(long, default_value = "config.toml")]
        config: String,
    },
    /// Run one SyncEngine pass to completion and print the outcome as JSON.
    Sync {
        #[arg(long, default_value = "config.toml")]
        config: String,
        #[arg(long)]
        parser: String,
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        max_batches: Option<u32>,
    },
    /// Run the catalog schema check/creation only.
    Migrate {
        #[arg(long, default_value = "config.toml")]
        config: String,
    },
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Daemon { config } => run_daemon(&config, cli.log_format, cli.log_level).await,
        Commands::Sync { config, parser, batch_size, max_batches } => {
            run_sync(&config, &parser, batch_size, max_batches, cli.log_format, cli.log_level).await
        }
        Commands::Migrate { config } => run_migrate(&config, cli.log_format, cli.log_level).await,
    }
}

fn effective_logging(config: &Config, log_format: Option<String>, log_level: Option<String>) -> LoggingConfig {
    LoggingConfig {
        format: log_format.unwrap_or_else(|| config.logging.format.clone()),
        level: log_level.unwrap_or_else(|| config.logging.level.clone()),
        directory: config.logging.directory.clone(),
    }
}

async fn run_daemon(config_path: &str, log_format: Option<String>, log_level: Option<String>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    init_logging(&effective_logging(&config, log_format, log_level));
    let prometheus_handle = catalog_sync::metrics::install();

    ensure_catalog_schema(config.catalog_db()?)?;

    let registry = Arc::new(ParserRegistry::with_default_handlers());
    let normalizer: Arc<dyn catalog_sync::parsers::text::TextNormalizer> = Arc::new(RussianTextNormalizer::new());
    let storage = match &config.storage {
        Some(storage_config) => Some(Arc::new(StorageClient::new(storage_config)?)),
        None => None,
    };

    let queue = Arc::new(JobQueue::new(config.queue.max_queue_size));
    let worker = Worker::spawn(queue.clone(), registry, normalizer, storage);

    let state = AppState { queue, config: Arc::new(config.http.clone()), metrics: Some(prometheus_handle) };
    let router = build_router(state);
    let addr: std::net::SocketAddr = config.http.bind_address.parse()?;

    info!(%addr, "starting HTTP trigger server");
    let server = axum::Server::bind(&addr).serve(router.into_make_service());

    tokio::select! {
        result = server => { result?; }
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }

    worker.stop(Duration::from_secs(10)).await;
    Ok(())
}

async fn run_sync(
    config_path: &str,
    parser: &str,
    batch_size: Option<u32>,
    max_batches: Option<u32>,
    log_format: Option<String>,
    log_level: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    init_logging(&effective_logging(&config, log_format, log_level));

    let receiver_backend = dsn::classify(config.receiver_db()?)?;
    let catalog_backend = dsn::classify(config.catalog_db()?)?;
    let (catalog_sync::dsn::Backend::Sqlite { path: receiver_path }, catalog_sync::dsn::Backend::Sqlite { path: catalog_path }) =
        (receiver_backend, catalog_backend)
    else {
        anyhow::bail!("only sqlite-backed receiver/catalog stores are implemented");
    };

    let receiver = ReceiverReader::open(&receiver_path)?;
    let mut catalog = CatalogWriter::open(&catalog_path)?;
    let registry = ParserRegistry::with_default_handlers();
    let normalizer = RussianTextNormalizer::new();
    let storage = match &config.storage {
        Some(storage_config) => Some(StorageClient::new(storage_config)?),
        None => None,
    };

    let mut engine = SyncEngine::new(
        &receiver,
        &mut catalog,
        &registry,
        &normalizer,
        storage.as_ref(),
        parser.to_string(),
    );

    let outcome = engine
        .run(batch_size.unwrap_or(config.sync.batch_size), max_batches.unwrap_or(config.sync.max_batches), None)
        .await?;

    println!(
        "{}",
        serde_json::json!({
            "batches": outcome.batches,
            "records": outcome.records,
            "wm_ingested_at": outcome.wm_ingested_at,
            "wm_product_id": outcome.wm_product_id,
        })
    );
    Ok(())
}

async fn run_migrate(config_path: &str, log_format: Option<String>, log_level: Option<String>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    init_logging(&effective_logging(&config, log_format, log_level));
    ensure_catalog_schema(config.catalog_db()?)?;
    println!("{}", serde_json::json!({"status": "ok"}));
    Ok(())
}

fn ensure_catalog_schema(catalog_db: &str) -> anyhow::Result<()> {
    let backend = dsn::classify(catalog_db)?;
    let catalog_sync::dsn::Backend::Sqlite { path } = backend else {
        anyhow::bail!("only sqlite-backed catalog stores are implemented");
    };
    CatalogWriter::open(&path)?;
    Ok(())
}
