use clap::Parser;

use raft_lite::harness::{self, Cluster};
use raft_lite::{RaftConfig, RpcOptions};

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(about = "Runs an in-process Raft cluster and replicates a few commands")]
struct Args {
    /// Number of servers in the cluster
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Number of commands to submit to the leader
    #[arg(long, default_value = "5")]
    commands: u64,

    /// Randomly drop and delay inbound RPCs
    #[arg(long)]
    unreliable: bool,
}

#[tokio::main]
async fn main() {
    harness::init_logging();
    let args = Args::parse();

    let rpc_options = if args.unreliable {
        RpcOptions::unreliable()
    } else {
        RpcOptions::default()
    };
    let mut cluster = Cluster::<u64>::with_options(args.nodes, RaftConfig::default(), rpc_options);

    let (leader, term) = cluster.check_single_leader().await;
    tracing::info!(leader, term, "leader elected");

    for value in 1..=args.commands {
        let accepted = cluster.submit(leader, value).await;
        tracing::info!(value, accepted, "submitted command");
        harness::sleep_ms(50).await;
    }
    harness::sleep_ms(300).await;

    for id in 0..args.nodes {
        let committed = cluster.committed(id);
        tracing::info!(id, entries = committed.len(), "server commit log");
    }
    cluster.shutdown().await;
}
