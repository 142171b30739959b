mod service;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tailcast_core::config::AppConfig;
use tailcast_gateway::{AppState, GatewayServer};
use tailcast_index::{refresh, SearchIndex};

use crate::service::Service;

#[derive(Parser)]
#[command(name = "tailcast", version, about = "Relay coding-agent session transcripts to SSE, Telegram, and Slack")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tailcast.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay service with the HTTP gateway
    Serve {
        /// Address for the HTTP surface
        #[arg(long, default_value = "127.0.0.1:8787")]
        bind: String,
    },
    /// Show the effective configuration after migration and env overrides
    Config,
    /// Operate the search index without the HTTP surface
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Incremental refresh of new and changed transcripts
    Refresh,
    /// Drop the database and rebuild from scratch
    Rebuild,
    /// Print index statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        bind: "127.0.0.1:8787".to_string(),
    }) {
        Commands::Serve { bind } => serve(cli.config, bind).await,
        Commands::Config => show_config(cli.config),
        Commands::Index { action } => run_index(cli.config, action),
    }
}

async fn serve(config_path: PathBuf, bind: String) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(&config_path)?;
    info!(
        config = %config_path.display(),
        sessions = config.sessions.len(),
        "Starting tailcast"
    );

    let cancel = CancellationToken::new();
    let (service, watch_rx) = Service::new(config, config_path, cancel.clone())?;
    service.clone().start(watch_rx).await?;

    let state = Arc::new(AppState::new(
        service.clone(),
        service.broker(),
        service.manager(),
        service.index(),
        service.search_config(),
    ));
    let server = GatewayServer::new(bind, state);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move { server.run(server_cancel).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    service.stop().await;

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Gateway exited with error"),
        Err(e) => error!(error = %e, "Gateway task panicked"),
    }
    Ok(())
}

fn show_config(config_path: PathBuf) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(&config_path)?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn run_index(config_path: PathBuf, action: IndexAction) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(&config_path)?;
    let db_path = config.search_db_path();

    match action {
        IndexAction::Refresh => {
            let index = SearchIndex::safe_initialize(&db_path)?;
            let stats = refresh(&index, &config.index)?;
            println!(
                "scanned {} indexed {} skipped {} removed {}",
                stats.scanned, stats.indexed, stats.skipped, stats.removed
            );
        }
        IndexAction::Rebuild => {
            if db_path.exists() {
                std::fs::remove_file(&db_path)?;
                for suffix in ["-wal", "-shm"] {
                    let side = PathBuf::from(format!("{}{}", db_path.display(), suffix));
                    if side.exists() {
                        std::fs::remove_file(side)?;
                    }
                }
            }
            let index = SearchIndex::safe_initialize(&db_path)?;
            let stats = refresh(&index, &config.index)?;
            println!("rebuilt: {} sessions indexed", stats.indexed);
        }
        IndexAction::Stats => {
            let index = SearchIndex::safe_initialize(&db_path)?;
            println!("sessions: {}", index.session_count()?);
            println!("projects: {}", index.project_stats()?.len());
            println!("fts_enabled: {}", index.fts_enabled());
            println!(
                "last_refresh: {}",
                index
                    .metadata("last_refresh")?
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }
    Ok(())
}
