//! CoachCall Server - signaling relay and recording store
//!
//! This server handles:
//! - User socket registration and call invitations
//! - Per-session relay of offers, answers and ICE candidates
//! - Recording uploads at the end of each call

use clap::{Parser, Subcommand};
use coachcall_server::{config::Config, router, AppState};
use std::path::Path;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CoachCall Server CLI
#[derive(Parser)]
#[command(name = "coachcall-server")]
#[command(about = "Signaling relay and recording store for coaching calls")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "coachcall_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::InitConfig { force } => {
            init_config(&cli.config, force).await?;
        }
        Commands::Run => {
            let config = Config::load(&cli.config).await?;
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn init_config(path: &str, force: bool) -> anyhow::Result<()> {
    if Path::new(path).exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path);
    }

    Config::default().write(path).await?;
    println!("Wrote default config to {}", path);

    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting CoachCall Server v{}", env!("CARGO_PKG_VERSION"));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Recordings stored in {}", config.storage.recordings_path);

    let app = router(AppState::new(config));

    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
