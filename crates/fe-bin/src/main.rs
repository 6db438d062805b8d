use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use fe_core::config::ServerConfig;
use fe_core::connection;
use fe_core::session::SessionBinder;

mod server;

#[derive(Parser, Debug)]
#[command(name = "fe-server")]
#[command(about = "Web file manager over SSH/SFTP or local disk")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(long, env = "FE_CONFIG_PATH", global = true)]
    config_path: Option<String>,

    /// Listen address, overrides the config file
    #[arg(long, env = "FE_BIND")]
    bind: Option<String>,

    /// Directory served under /static, overrides the config file
    #[arg(long, env = "FE_STATIC_DIR")]
    static_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FE_LOG_LEVEL", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config file and exit
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        "fe-server v{} starting (os={}, arch={})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    );

    let config_path = cli
        .config_path
        .map(PathBuf::from)
        .unwrap_or_else(ServerConfig::default_path);

    if let Some(Commands::InitConfig { force }) = cli.command {
        if config_path.exists() && !force {
            anyhow::bail!(
                "{} already exists, pass --force to overwrite",
                config_path.display()
            );
        }
        ServerConfig::default().save(&config_path)?;
        info!("default config written to {}", config_path.display());
        return Ok(());
    }

    let mut config = if config_path.exists() {
        info!("loading config from {}", config_path.display());
        ServerConfig::load(&config_path)?
    } else {
        info!("no config at {}, using defaults", config_path.display());
        ServerConfig::default()
    };

    // CLI args override config file
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(dir) = cli.static_dir {
        config.static_dir = Some(PathBuf::from(dir));
    }
    config.validate()?;

    run_server(config).await
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let connector = connection::connector_from_config(&config.backend)?;
    info!("backend: {}", connector.describe());

    let binder = Arc::new(SessionBinder::new(
        connector,
        Duration::from_secs(config.session_ttl_secs),
    ));
    let reaper = binder.spawn_reaper(Duration::from_secs(config.reaper_interval_secs));

    let app = server::router(
        server::AppState {
            binder: binder.clone(),
        },
        config.static_dir.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("listening on {}, press Ctrl+C to stop", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    reaper.abort();
    binder.close_all().await;
    info!("all sessions closed, bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("received Ctrl+C, shutting down");
}
