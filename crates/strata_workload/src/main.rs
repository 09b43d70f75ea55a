//! Workload generator for exercising strata-store via the Redis protocol.
//!
//! This binary issues SET/GET/INCR operations against one or more nodes
//! from concurrent clients and reports throughput and error counts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "strata-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Comma-separated RESP endpoints, e.g. `127.0.0.1:6380,127.0.0.1:6381`
    #[arg(long)]
    nodes: String,

    /// Number of concurrent clients (one TCP connection each).
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Number of hot keys used by the workload.
    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Key prefix/namespace.
    #[arg(long, default_value = "strata_")]
    key_prefix: String,

    /// Percent of operations that are SET; half the rest are INCR, the
    /// remainder GET.
    #[arg(long, default_value_t = 40)]
    set_pct: u8,

    /// Total runtime for the workload.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Default)]
struct Counters {
    ops: AtomicU64,
    errors: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Run(run) => run_workload(run).await,
    }
}

async fn run_workload(args: RunArgs) -> anyhow::Result<()> {
    let nodes: Vec<SocketAddr> = args
        .nodes
        .split(',')
        .map(|s| s.trim().parse().with_context(|| format!("bad node addr {s}")))
        .collect::<anyhow::Result<_>>()?;
    anyhow::ensure!(!nodes.is_empty(), "at least one node required");
    anyhow::ensure!(args.set_pct <= 100, "--set-pct must be <= 100");

    let seed = if args.seed == 0 {
        rand::random::<u64>().max(1)
    } else {
        args.seed
    };
    let counters = Arc::new(Counters::default());
    let start = Instant::now();
    let deadline = start + *args.duration;

    let mut handles = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let node = nodes[client_id % nodes.len()];
        let args = args.clone();
        let counters = counters.clone();
        handles.push(tokio::spawn(async move {
            client_loop(client_id, node, seed, args, counters, deadline).await
        }));
    }
    for handle in handles {
        if let Err(err) = handle.await? {
            eprintln!("client failed: {err:#}");
        }
    }

    let elapsed = start.elapsed().as_secs_f64().max(0.001);
    let ops = counters.ops.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);
    println!(
        "ops={ops} errors={errors} elapsed={elapsed:.2}s rate={:.0}/s",
        ops as f64 / elapsed
    );
    Ok(())
}

async fn client_loop(
    client_id: usize,
    node: SocketAddr,
    seed: u64,
    args: RunArgs,
    counters: Arc<Counters>,
    deadline: Instant,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(node)
        .await
        .with_context(|| format!("connect {node}"))?;
    let mut framed = Framed::new(stream, Resp2::default());
    let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(client_id as u64));

    while Instant::now() < deadline {
        let key = format!(
            "{}{}_k{}",
            args.key_prefix,
            seed,
            rng.gen_range(0..args.keys.max(1))
        );
        let roll: u8 = rng.gen_range(0..100);
        let request = if roll < args.set_pct {
            let value = format!("v{}", rng.gen::<u32>());
            cmd_frame(&[b"SET", key.as_bytes(), value.as_bytes()])
        } else if roll < args.set_pct + (100 - args.set_pct) / 2 {
            // INCR targets a disjoint key range so SET values never break
            // integer parsing.
            let counter_key = format!("{}{}_n{}", args.key_prefix, seed, roll % 4);
            cmd_frame(&[b"INCR", counter_key.as_bytes()])
        } else {
            cmd_frame(&[b"GET", key.as_bytes()])
        };

        framed.send(request).await?;
        match framed.next().await {
            Some(Ok(BytesFrame::Error(_))) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            Some(Ok(_)) => {
                counters.ops.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(err)) => return Err(err.into()),
            None => anyhow::bail!("connection closed by server"),
        }
    }
    Ok(())
}

fn cmd_frame(parts: &[&[u8]]) -> BytesFrame {
    BytesFrame::Array(
        parts
            .iter()
            .map(|p| BytesFrame::BulkString(bytes::Bytes::copy_from_slice(p)))
            .collect(),
    )
}
