use anyhow::Result;
use clap::{Parser, Subcommand};
use repo_migrator::{
    migration::{create_pool, DynamicConfig, ManagerOptions, MemStore, MigrationManager, PgStore, Store},
    forge::mock::{MockForge, MockForgeFactory},
    Config, RestForgeFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "repo-migrator")]
#[command(about = "Repository migration engine - moves repositories into a destination GitHub organization")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the migration engine
    Serve {
        /// Use the in-memory store and mock forge (no external services)
        #[arg(long)]
        mock: bool,
    },
    /// Create the database schema
    InitSchema,
    /// Check database connectivity and settings validity
    Health,
    /// Print the effective configuration (credentials masked)
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { mock: false }) {
        Commands::Serve { mock } => serve(mock).await,
        Commands::InitSchema => init_schema().await,
        Commands::Health => health().await,
        Commands::ShowConfig => show_config(),
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(mock: bool) -> Result<()> {
    let mut config = Config::from_env()?;
    config.mock_mode = config.mock_mode || mock;
    config.validate()?;
    init_logging(&config);

    let (store, factory): (Arc<dyn Store>, _) = if config.mock_mode {
        info!("Starting in mock mode: in-memory store, scripted forge");
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let factory: Arc<dyn repo_migrator::ForgeFactory> =
            Arc::new(MockForgeFactory::new(MockForge::new()));
        (store, factory)
    } else {
        info!("Connecting to {}", config.safe_database_url());
        let pool = create_pool(&config.database_url, config.max_db_connections).await?;
        let store = PgStore::new(pool);
        store.init_schema().await?;
        let store: Arc<dyn Store> = Arc::new(store);
        let factory: Arc<dyn repo_migrator::ForgeFactory> = Arc::new(RestForgeFactory);
        (store, factory)
    };

    let dynamic = DynamicConfig::load(store.clone()).await?;
    let options = ManagerOptions {
        shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
        ..ManagerOptions::default()
    };
    let manager = MigrationManager::new(store, dynamic, factory, options).await?;
    manager.start().await?;

    info!("Migration engine running; press Ctrl-C to stop");
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    manager.stop().await;
    Ok(())
}

async fn init_schema() -> Result<()> {
    let config = Config::from_env()?;
    config.validate()?;
    init_logging(&config);
    let pool = create_pool(&config.database_url, config.max_db_connections).await?;
    PgStore::new(pool).init_schema().await?;
    info!("Schema created");
    Ok(())
}

async fn health() -> Result<()> {
    let config = Config::from_env()?;
    config.validate()?;
    let pool = create_pool(&config.database_url, config.max_db_connections).await?;
    let store = PgStore::new(pool);
    let settings = store.get_settings().await?;
    match settings.validate() {
        Ok(()) => println!("OK: database reachable, settings valid"),
        Err(e) => println!("WARN: database reachable, settings invalid: {e}"),
    }
    if !settings.credentials.is_configured() {
        println!("WARN: destination credentials are not configured; the pool will quiesce");
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::from_env()?;
    println!("database_url: {}", config.safe_database_url());
    println!("max_db_connections: {}", config.max_db_connections);
    println!("shutdown_grace_seconds: {}", config.shutdown_grace_seconds);
    println!("log_level: {}", config.log_level);
    println!("mock_mode: {}", config.mock_mode);
    Ok(())
}
