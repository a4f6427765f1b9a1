// Stratum node binary entry point.
//
// Runs an in-process cluster (one data storage broker plus N resource
// managers on a mesh transport) and drives a random workload through it,
// printing throughput and latency at the end. The network surface is a trait
// in the core; this binary exists to exercise the concurrency machinery end
// to end.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use stratum_node::node::{
    run_workload, seed_rows, start_cluster, ClusterConfig, WorkloadConfig,
};
use stratum_node::wal_file::SyncMode;
use stratum_txn::txn::ExecutionModel;

#[derive(Parser, Debug)]
#[command(name = "stratum-node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-process cluster and push a workload through it.
    Workload(WorkloadArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelArg {
    ShareNothing,
    GeoReplicated,
    Deterministic,
}

impl From<ModelArg> for ExecutionModel {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::ShareNothing => ExecutionModel::ShareNothing,
            ModelArg::GeoReplicated => ExecutionModel::GeoReplicated,
            ModelArg::Deterministic => ExecutionModel::Deterministic,
        }
    }
}

impl std::fmt::Display for ModelArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelArg::ShareNothing => "share-nothing",
            ModelArg::GeoReplicated => "geo-replicated",
            ModelArg::Deterministic => "deterministic",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SyncModeArg {
    None,
    Data,
    All,
}

impl From<SyncModeArg> for SyncMode {
    fn from(arg: SyncModeArg) -> Self {
        match arg {
            SyncModeArg::None => SyncMode::None,
            SyncModeArg::Data => SyncMode::Data,
            SyncModeArg::All => SyncMode::All,
        }
    }
}

impl std::fmt::Display for SyncModeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncModeArg::None => "none",
            SyncModeArg::Data => "data",
            SyncModeArg::All => "all",
        };
        f.write_str(name)
    }
}

#[derive(Parser, Debug)]
struct WorkloadArgs {
    /// Number of resource-manager nodes in the mesh.
    #[arg(long, env = "STRATUM_NODES", default_value_t = 2)]
    nodes: usize,

    /// Number of key shards spread across the nodes.
    #[arg(long, env = "STRATUM_SHARDS", default_value_t = 4)]
    shards: u32,

    /// Execution model for every node.
    #[arg(long, env = "STRATUM_MODEL", value_enum, default_value_t = ModelArg::ShareNothing)]
    model: ModelArg,

    #[arg(long, env = "STRATUM_DATA_DIR", default_value = "./stratum-data")]
    data_dir: PathBuf,

    /// Redo log persist mode.
    #[arg(long, env = "STRATUM_SYNC_MODE", value_enum, default_value_t = SyncModeArg::Data)]
    sync_mode: SyncModeArg,

    #[arg(long, env = "STRATUM_TX_TIMEOUT_MS", default_value_t = 5_000)]
    tx_timeout_ms: u64,

    #[arg(long, env = "STRATUM_DEADLOCK_SCAN_INTERVAL_MS", default_value_t = 50)]
    deadlock_scan_interval_ms: u64,

    /// Batch sealing interval for the deterministic model.
    #[arg(long, env = "STRATUM_EPOCH_INTERVAL_MS", default_value_t = 10)]
    epoch_interval_ms: u64,

    /// Transactions to run.
    #[arg(long, default_value_t = 1_000)]
    txns: usize,

    /// Distinct keys in the workload.
    #[arg(long, default_value_t = 10_000)]
    keys: u64,

    #[arg(long, default_value_t = 4)]
    ops_per_txn: usize,

    /// Fraction of operations that are reads.
    #[arg(long, default_value_t = 0.8)]
    read_ratio: f64,

    /// Fraction of transactions driven through two-phase commit.
    #[arg(long, default_value_t = 0.1)]
    distributed_ratio: f64,

    /// In-flight transactions.
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// Emit the final stats as JSON instead of prose.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Workload(args) => run(args).await,
    }
}

async fn run(args: WorkloadArgs) -> anyhow::Result<()> {
    let mut cluster_config = ClusterConfig::new(args.data_dir.clone(), args.model.into());
    cluster_config.nodes = args.nodes.max(1);
    if cluster_config.model == ExecutionModel::Deterministic && cluster_config.nodes > 1 {
        // The deterministic pipeline orders one input stream; batches are
        // sequenced and executed on a single node.
        tracing::warn!("deterministic model runs one sequencer node, forcing --nodes 1");
        cluster_config.nodes = 1;
    }
    cluster_config.shards = args.shards.max(1);
    cluster_config.sync_mode = args.sync_mode.into();
    cluster_config.tx_timeout = Duration::from_millis(args.tx_timeout_ms.max(1));
    cluster_config.deadlock_scan_interval =
        Duration::from_millis(args.deadlock_scan_interval_ms.max(1));
    cluster_config.epoch_interval = Duration::from_millis(args.epoch_interval_ms.max(1));

    let workload = WorkloadConfig {
        txns: args.txns,
        keys: args.keys.max(1),
        ops_per_txn: args.ops_per_txn.max(1),
        read_ratio: args.read_ratio.clamp(0.0, 1.0),
        distributed_ratio: args.distributed_ratio.clamp(0.0, 1.0),
        concurrency: args.concurrency.max(1),
    };

    tracing::info!(
        nodes = cluster_config.nodes,
        shards = cluster_config.shards,
        model = ?cluster_config.model,
        txns = workload.txns,
        "starting in-process cluster"
    );

    let cluster = start_cluster(&cluster_config)?;
    seed_rows(&cluster, &workload, cluster_config.shards)?;

    let stats = run_workload(&cluster, &workload, cluster_config.shards).await?;
    tracing::info!(
        committed = stats.committed,
        aborted = stats.aborted,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        throughput_tps = format!("{:.0}", stats.throughput()),
        avg_latency_us = stats.avg_latency_us(),
        max_latency_us = stats.max_latency_us,
        "workload finished"
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "{} committed, {} aborted in {:.2}s ({:.0} tx/s, avg {}us, max {}us)",
            stats.committed,
            stats.aborted,
            stats.elapsed.as_secs_f64(),
            stats.throughput(),
            stats.avg_latency_us(),
            stats.max_latency_us
        );
    }
    Ok(())
}
