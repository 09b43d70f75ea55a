//! strata-store node binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use strata_store::Server;

#[derive(Parser, Debug)]
#[command(name = "strata-store")]
struct NodeArgs {
    /// RESP listen address.
    #[arg(long, default_value = "127.0.0.1:6380")]
    listen: SocketAddr,

    /// Data directory (catalog + per-shard stores).
    #[arg(long, default_value = "./strata-data")]
    data_dir: PathBuf,

    /// Number of shards this node owns.
    #[arg(long, default_value_t = 2)]
    shards: usize,

    /// Replication source as `host:port`. Shard `i` syncs from the
    /// source's shard `i`.
    #[arg(long)]
    sync_from: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    tracing::info!(?args, "starting strata-store");

    let server = Server::open(&args.data_dir, args.shards)?;
    server.start_repl().await?;

    if let Some(source) = &args.sync_from {
        let (host, port) = source
            .rsplit_once(':')
            .context("--sync-from expects host:port")?;
        let port: u16 = port.parse().context("--sync-from port")?;
        server.repl.set_source(host, port).await?;
        tracing::info!(host, port, "replicating from source");
    }

    let listener = server.spawn_redis(args.listen);

    tokio::select! {
        result = listener => {
            result.context("redis listener task")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    Ok(())
}
