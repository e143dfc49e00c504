use std::path::Path;
use std::process;

use slog::{error, info};

use raftkv::kv::{KvPeerClientFactory, KvRpcServer, KvStore};
use raftkv::raft::Node;
use raftkv::{logging, ClusterConfig};

fn usage() -> ! {
    eprintln!("usage: raftkv <cluster-config.json> <node-id>");
    process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        usage();
    }
    let node_id = match args[2].parse() {
        Ok(id) => id,
        Err(_) => usage(),
    };

    let logger = logging::root_logger();
    let config = ClusterConfig::from_file(Path::new(&args[1]), node_id)?;
    let listen_addr = config.local_info()?.endpoint.parse()?;

    let store = KvStore::new();
    let node = Node::new(&config, Box::new(store), &KvPeerClientFactory, logger.clone())?;

    let server = KvRpcServer::new(node.clone(), config.snapshot_dir.clone()).start(listen_addr);
    node.start();

    info!(logger, "raftkv serving"; "node" => node_id, "addr" => listen_addr.to_string());

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(logger, "cannot listen for shutdown signal"; "error" => err.to_string());
    }

    info!(logger, "shutting down");
    node.stop().await;
    server.stop().await;

    Ok(())
}
