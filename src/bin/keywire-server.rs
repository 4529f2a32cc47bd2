//! KEYWIRE Server Binary

use clap::Parser;
use keywire::server::{Config, Node};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// KEYWIRE - clustered key/value coordination node
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Endpoints to accept clients on
    #[arg(short, long, value_delimiter = ',', default_value = "0.0.0.0:6390")]
    listen: Vec<String>,

    /// Endpoint announced to push-to peers
    #[arg(short, long, default_value = "127.0.0.1:6390")]
    advertise: String,

    /// Backend kind
    #[arg(long, default_value = "memory")]
    storage_kind: String,

    /// Backend address
    #[arg(long, default_value = "memory")]
    storage_addr: String,

    /// Backend connections in the pool
    #[arg(long, default_value_t = 10)]
    pool_size: usize,

    /// Global secrets; the first one signs cluster commands
    #[arg(short, long = "secret", value_delimiter = ',')]
    secrets: Vec<String>,

    /// Peers to announce this node to
    #[arg(long, value_delimiter = ',')]
    push_to: Vec<String>,

    /// Peers to pull changes from
    #[arg(long, value_delimiter = ',')]
    pull_from: Vec<String>,

    /// Storage, delivery and peer call timeout in seconds
    #[arg(long, default_value_t = 10)]
    request_timeout: u64,

    /// Reconnect backoff in seconds
    #[arg(long, default_value_t = 2)]
    reconnect_backoff: u64,

    /// Cluster periodic command interval in seconds
    #[arg(long, default_value_t = 5)]
    cluster_interval: u64,

    /// Workers draining pulled changes
    #[arg(long, default_value_t = 20)]
    cluster_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("keywire=info".parse()?))
        .init();

    let args = Args::parse();

    let config = Config::default()
        .with_listen(args.listen)
        .with_advertise(args.advertise)
        .with_storage(args.storage_kind, args.storage_addr)
        .with_pool_size(args.pool_size)
        .with_global_secrets(args.secrets)
        .with_push_to(args.push_to)
        .with_pull_from(args.pull_from)
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_reconnect_backoff(Duration::from_secs(args.reconnect_backoff))
        .with_cluster_interval(Duration::from_secs(args.cluster_interval))
        .with_cluster_workers(args.cluster_workers);

    info!("Starting KEYWIRE node on {:?}", config.listen);
    let node = Node::start(config).await?;

    tokio::select! {
        result = node.run() => {
            if let Err(e) = &result {
                error!("Server error: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    node.shutdown().await?;
    Ok(())
}
