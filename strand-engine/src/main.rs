//! strand daemon and utility CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strand_blobs::{ingest_file, BlobStore};
use strand_engine::{Engine, EngineConfig, MemoryDht};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strand", about = "Peer-to-peer content distribution engine")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "strand.toml")]
    config: PathBuf,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an author identity and store it under the data directory.
    GenKey,
    /// Chunk, encrypt, and store a file; prints the file entry JSON.
    Ingest {
        /// File to ingest.
        file: PathBuf,
    },
    /// Run the engine: blob server, subscription polling, downloads.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(&cli.config);
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Command::GenKey => {
            let key = strand_engine::keys::generate();
            strand_engine::keys::save_key(&config.data_dir.join("keys"), &key)
                .context("failed to save key")?;
            let output = serde_json::json!({
                "publicKey": strand_engine::keys::public_hex(&key),
                "secretKey": strand_engine::keys::secret_hex(&key),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Ingest { file } => {
            let store = BlobStore::open(
                config.data_dir.join("blobs"),
                config.store_capacity_bytes,
            )
            .context("failed to open blob store")?;
            let outcome = ingest_file(&store, &file)
                .await
                .context("failed to ingest file")?;
            tracing::info!(blobs = outcome.blob_count, "ingest complete");
            println!("{}", serde_json::to_string_pretty(&outcome.entry)?);
        }
        Command::Serve => {
            // The DHT routing table is an external collaborator; the bundled
            // in-memory implementation serves single-node and test setups.
            let dht = Arc::new(MemoryDht::new());
            let (engine, mut events) = Engine::start(config, dht)
                .await
                .context("failed to start engine")?;
            tracing::info!(listen_addr = %engine.listen_addr(), "serving");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutting down");
                        break;
                    }
                    Some(event) = events.recv() => {
                        tracing::info!(?event, "engine event");
                    }
                }
            }
        }
    }
    Ok(())
}
