use std::env;
use std::process;

use anyhow::Context;
use shard_ledger::{WorkerConfig, WorkerNode};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!("usage: worker <workerId> <coordinatorHost> <coordinatorPort> <taskListenPort>");
    process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [worker_id, host, coordinator_port, task_port] = args.as_slice() else {
        usage();
    };
    let coordinator_port: u16 = coordinator_port.parse().unwrap_or_else(|_| usage());
    let task_port: u16 = task_port.parse().unwrap_or_else(|_| usage());

    let cfg = WorkerConfig::new(worker_id.clone(), host.clone(), coordinator_port, task_port);
    let node = WorkerNode::new(cfg).context("failed to open partition store")?;
    let handle = node.start().await.context("worker failed to start")?;
    info!(addr = %handle.task_addr, "worker serving tasks");
    handle.wait().await;
    Ok(())
}
