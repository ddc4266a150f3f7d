//! `chatd` — CLI entry point: `init-db` provisions the SQLite schema, `start` runs the server
//! until a shutdown signal arrives. Grounded on the teacher's `tracing_subscriber::fmt().json()`
//! init idiom, generalized from a hardcoded log level to `Config::from_env`'s value.

use clap::{Parser, Subcommand};

use chat_core::config::Config;
use chat_core::repo::Repository;
use chat_core::Server;

#[derive(Parser)]
#[command(name = "chatd", about = "Secure group-chat backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the SQLite schema if it doesn't exist yet, then exit.
    InitDb,
    /// Run the server until SIGINT/SIGTERM.
    Start,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::InitDb => init_db(&config),
        Command::Start => start(config).await,
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .try_init();
}

fn init_db(config: &Config) -> anyhow::Result<()> {
    Repository::open(&config.db_url)?;
    tracing::info!(db_url = %config.db_url, "database schema ready");
    Ok(())
}

async fn start(config: Config) -> anyhow::Result<()> {
    let server = Server::bind(config).await?;

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.request_shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
