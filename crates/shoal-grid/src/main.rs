#![warn(missing_docs)]

//! shoal-node: runs an in-process Shoal grid and exercises replication and migration.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use shoal_grid::{
    CounterOp, GridConfig, LocalCluster, MapOp, ObjectId, Operation, PartitionId, QueueOp,
    Response,
};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "shoal-node")]
#[command(about = "Shoal in-memory grid demo cluster", long_about = None)]
struct Cli {
    /// Grid config file (.toml or .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of nodes to start.
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Operations in the demo workload.
    #[arg(short, long, default_value = "1000")]
    operations: usize,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let config = match &cli.config {
        Some(path) => GridConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GridConfig::default(),
    };

    tracing::info!("Shoal grid starting with {} node(s)...", cli.nodes);
    let cluster = LocalCluster::start(cli.nodes, config).context("starting cluster")?;

    run_workload(&cluster, cli.operations).await?;

    let joined = cluster.add_node().context("adding node")?;
    let partition = PartitionId::new(0);
    let owner = cluster.owner_of(partition)?.id();
    let migration = cluster
        .move_replica(partition, owner, joined.id())
        .await
        .context("migrating partition 0")?;
    tracing::info!("partition 0 moved from {} to {} ({})", owner, joined.id(), migration);

    run_workload(&cluster, cli.operations).await?;

    let report: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            json!({
                "node": node.id().to_string(),
                "owned_partitions": cluster.partition_table().partitions_owned_by(node.id()).len(),
                "metrics": node.metrics(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Runs the demo workload and returns how many leader elections succeeded.
async fn run_workload(cluster: &LocalCluster, operations: usize) -> Result<usize> {
    let counter = ObjectId::counter("requests");
    let leader = ObjectId::counter("leader-epoch");
    let map = ObjectId::map("sessions");
    let queue = ObjectId::queue("jobs");
    let start_epoch = match cluster
        .invoke(leader.clone(), Operation::Counter(CounterOp::Get))
        .await?
    {
        Response::Long(epoch) => epoch,
        other => anyhow::bail!("unexpected leader epoch response: {:?}", other),
    };
    let mut elections = 0;
    for i in 0..operations {
        cluster
            .invoke(counter.clone(), Operation::Counter(CounterOp::AddAndGet(1)))
            .await?;
        let epoch = start_epoch + i as i64;
        let elected = cluster
            .invoke(
                leader.clone(),
                Operation::Counter(CounterOp::CompareAndSet {
                    expect: epoch,
                    update: epoch + 1,
                }),
            )
            .await?;
        if elected == Response::Bool(true) {
            elections += 1;
        }
        let key = format!("session-{}", i % 64).into_bytes();
        let value = i.to_le_bytes().to_vec();
        cluster
            .invoke(map.clone(), Operation::Map(MapOp::Put { key, value }))
            .await?;
        cluster
            .invoke(queue.clone(), Operation::Queue(QueueOp::Offer(value_bytes(i))))
            .await?;
        if i % 2 == 1 {
            cluster
                .invoke(queue.clone(), Operation::Queue(QueueOp::Poll))
                .await?;
        }
    }
    let total = cluster
        .invoke(counter, Operation::Counter(CounterOp::Get))
        .await?;
    let backlog = cluster
        .invoke(queue, Operation::Queue(QueueOp::Size))
        .await?;
    tracing::info!(
        elections,
        "workload done, counter = {:?}, queue = {:?}",
        total,
        backlog
    );
    if elections != operations {
        tracing::warn!(elections, operations, "leader epoch moved concurrently");
    }
    Ok(elections)
}

fn value_bytes(i: usize) -> Vec<u8> {
    format!("job-{}", i).into_bytes()
}
