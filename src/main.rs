//! PeerLink node binary
//!
//! `--mode bootstrap` runs the seed: it starts a fresh node, publishes the
//! payload and writes the bootstrap and CID files. `--mode client` joins
//! through the seed's bootstrap file and fetches what it published.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use peerlink_core::artifacts::{BOOTSTRAP_FILE, CID_FILE};
use peerlink_core::role::{self, ClientConfig, NetworkMode, NodeRole, Outcome, SeedConfig};
use peerlink_core::{NodeConfig, SwarmKey};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Start the overlay and publish
    Bootstrap,
    /// Join through the bootstrap node and fetch
    Client,
}

#[derive(Debug, Parser)]
#[command(name = "peerlink", version, about)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Bootstrap)]
    mode: Mode,

    /// Where the bootstrap node's address info is exchanged
    #[arg(long, default_value = BOOTSTRAP_FILE)]
    bootstrap_file: PathBuf,

    /// Join a private network
    #[arg(long)]
    private: bool,

    /// Pre-shared key file for --private
    #[arg(long, env = "PEERLINK_SWARM_KEY_FILE", default_value = "swarm.key")]
    swarm_key_file: PathBuf,

    /// Where the published CID is exchanged
    #[arg(long, default_value = CID_FILE)]
    cid_file: PathBuf,

    /// Directory resolved content is written to
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Payload the bootstrap node publishes
    #[arg(long)]
    payload: Option<String>,

    /// Disable mDNS local discovery
    #[arg(long)]
    no_mdns: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let network = if args.private {
        NetworkMode::Private(load_swarm_key(&args.swarm_key_file, args.mode).await?)
    } else {
        NetworkMode::Public
    };

    let node_role = match args.mode {
        Mode::Bootstrap => NodeRole::Seed(SeedConfig {
            bootstrap_file: args.bootstrap_file.clone(),
            cid_file: args.cid_file.clone(),
            payload: args
                .payload
                .clone()
                .map(String::into_bytes)
                .unwrap_or_else(|| role::DEFAULT_PAYLOAD.to_vec()),
        }),
        Mode::Client => NodeRole::Client(ClientConfig {
            bootstrap_file: args.bootstrap_file.clone(),
            cid_file: args.cid_file.clone(),
        }),
    };

    let config = NodeConfig {
        enable_mdns: !args.no_mdns,
        output_dir: args.output_dir.clone(),
        ..Default::default()
    };

    let ctx = CancellationToken::new();
    let session = role::run(&ctx, network, node_role, config)
        .await
        .context("failed to start node")?;

    if session.node.config().enable_mdns {
        if let Err(e) = peerlink_core::p2p::start_discovery(&session.node) {
            tracing::warn!("Local discovery unavailable: {}", e);
        }
    }

    match &session.outcome {
        Outcome::Published(cid) => println!("Published {}", cid),
        Outcome::Retrieved(handle) => println!(
            "Retrieved {} ({} bytes) into {}",
            handle.id,
            handle.data.len(),
            handle.path.display()
        ),
        Outcome::NotRetrieved(e) => eprintln!("Content not retrieved: {}", e),
    }

    println!("Node {} running, press Enter to exit", session.node.peer_id());
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    tokio::select! {
        result = stdin.read_line(&mut line) => {
            result.context("failed to read stdin")?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
        }
    }

    session.shutdown();
    ctx.cancel();
    Ok(())
}

/// The seed creates the key file on first use; a client must be handed one
async fn load_swarm_key(path: &Path, mode: Mode) -> anyhow::Result<SwarmKey> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return SwarmKey::read_file(path)
            .await
            .with_context(|| format!("invalid swarm key file {}", path.display()));
    }

    if mode == Mode::Client {
        bail!(
            "private mode needs the seed's swarm key at {} (set --swarm-key-file)",
            path.display()
        );
    }

    let key = SwarmKey::generate();
    key.write_file(path)
        .await
        .with_context(|| format!("failed to write swarm key {}", path.display()))?;
    tracing::info!(
        "Generated swarm key {} at {}",
        key.fingerprint(),
        path.display()
    );
    Ok(key)
}
