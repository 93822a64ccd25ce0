use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use cachet::{CacheClient, DhtNode, DEFAULT_BOOTSTRAP};

#[derive(Parser, Debug)]
#[command(name = "cachet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the cache store and recency index.
    #[arg(long, default_value = "./repo")]
    repo_root: PathBuf,

    /// UDP endpoint for the DHT; the same port serves peers over TCP.
    #[arg(long, default_value = "0.0.0.0:28729")]
    listen_endpoint: SocketAddr,

    /// Hex-encoded Ed25519 public key cached responses must verify against.
    #[arg(long)]
    cache_http_public_key: String,

    /// Drop stored entries older than this many seconds; -1 keeps them forever.
    #[arg(long, default_value_t = -1)]
    max_cached_age: i64,

    /// Bound on the cache recency index, in entries.
    #[arg(long, default_value_t = 10_000)]
    index_capacity: usize,

    /// Bootstrap nodes (host:port). Well-known routers when empty.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<String>,
}

fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key).context("public key is not valid hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).context("not a valid Ed25519 public key")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let pk = parse_public_key(&args.cache_http_public_key)?;

    let seeds: Vec<String> = if args.bootstrap.is_empty() {
        DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect()
    } else {
        args.bootstrap.clone()
    };
    let node = DhtNode::bootstrap(args.listen_endpoint, &seeds)
        .await
        .context("DHT bootstrap failed")?;
    info!(id = %node.id(), endpoint = %node.wan_endpoint(), "dht ready");

    let max_cached_age = if args.max_cached_age >= 0 {
        Some(Duration::from_secs(args.max_cached_age as u64))
    } else {
        None
    };
    let client = CacheClient::new(
        node.clone(),
        args.repo_root,
        pk,
        max_cached_age,
        args.index_capacity,
    )
    .await
    .context("cannot open cache repository")?;

    let listener = TcpListener::bind(args.listen_endpoint)
        .await
        .context("cannot bind cache listener")?;
    info!(endpoint = %args.listen_endpoint, "serving cached content");
    let server = {
        let client = client.clone();
        tokio::spawn(async move { client.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    server.abort();
    node.shutdown().await;
    Ok(())
}
