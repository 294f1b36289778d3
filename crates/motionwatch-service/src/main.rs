//! motionwatch service - device registry, check-in sweeper and HTTP API.
//!
//! Run with: `cargo run -p motionwatch-service`

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use motionwatch_core::{DeviceRegistry, EventLogStore};
use motionwatch_service::{AppState, Config, api};
use motionwatch_store::Store;

/// motionwatch service - tracks a fleet of motion sensors over HTTP.
#[derive(Parser, Debug)]
#[command(name = "motionwatch-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Directory for device logs and archived sets (overrides config).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run,

    /// Delete the database and every device log and archived set.
    Wipe {
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("motionwatch_service=info".parse()?)
                .add_directive("motionwatch_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Wipe { yes }) => wipe(&config, yes),
        Some(Command::Run) | None => run_server(config).await,
    }
}

/// Load the config file and apply CLI overrides.
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.storage.log_root = data_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.storage.path)
        .with_context(|| format!("opening database {}", config.storage.path.display()))?;
    let logs = Arc::new(EventLogStore::new(&config.storage.log_root));
    info!("Device logs under {}", logs.root().display());

    let registry = DeviceRegistry::load(store, logs)?;
    let addr: SocketAddr = config.server.bind.parse()?;
    if !config.security.is_enabled() {
        warn!("No password configured; mutating endpoints are open");
    }

    let state = AppState::new(registry, config);

    let sweeper = Arc::clone(&state.sweeper);
    let sweeper_task = Arc::clone(&sweeper).start();

    let app = api::app(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop();
    sweeper_task.await?;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Remove the database and the log root.
fn wipe(config: &Config, yes: bool) -> anyhow::Result<()> {
    let db = &config.storage.path;
    let log_root = &config.storage.log_root;

    if !yes {
        println!("This permanently deletes:");
        println!("  {}", db.display());
        println!("  {}", log_root.display());
        print!("Type 'yes' to continue: ");
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if answer.trim() != "yes" {
            println!("Aborted");
            return Ok(());
        }
    }

    if log_root.exists() {
        std::fs::remove_dir_all(log_root)
            .with_context(|| format!("removing {}", log_root.display()))?;
        info!("Removed {}", log_root.display());
    }

    for path in database_files(db) {
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
            info!("Removed {}", path.display());
        }
    }

    println!("Wiped all device data");
    Ok(())
}

/// The database file and its WAL sidecars.
fn database_files(db: &Path) -> Vec<PathBuf> {
    let mut files = vec![db.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = db.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}
