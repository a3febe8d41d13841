use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use shard_ledger::{Coordinator, CoordinatorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!("usage: coordinator [clientPort] [workerPort] [dataDir]");
    process::exit(2);
}

fn parse_port(arg: &str) -> u16 {
    arg.parse().unwrap_or_else(|_| usage())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let mut cfg = CoordinatorConfig::default();
    if let Some(port) = args.first() {
        cfg.client_port = parse_port(port);
    }
    if let Some(port) = args.get(1) {
        cfg.worker_port = parse_port(port);
    }
    if let Some(dir) = args.get(2) {
        cfg.data_dir = PathBuf::from(dir);
    }

    let coordinator = Coordinator::new(cfg).context("coordinator failed to start")?;
    let handle = coordinator.start().await?;
    info!(
        clients = %handle.client_addr,
        workers = %handle.worker_addr,
        "coordinator listening"
    );
    handle.wait().await;
    Ok(())
}
