use anyhow::Result;
use rpcshard_lite::gateway::DEFAULT_RPC_PATH;
use rpcshard_lite::group::DEFAULT_SHARD_CAPACITY;
use rpcshard_lite::{GatewayConfig, GroupConfig, Node};
use shardgate::{DEFAULT_LISTEN_ADDR, counter, init_tracing};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    let rpc_path = std::env::var("RPC_PATH").unwrap_or_else(|_| DEFAULT_RPC_PATH.to_string());
    let capacity = match std::env::var("SHARD_CAPACITY") {
        Ok(raw) => raw.parse()?,
        Err(_) => DEFAULT_SHARD_CAPACITY,
    };
    let max_shards = match std::env::var("MAX_SHARDS") {
        Ok(raw) => Some(raw.parse::<usize>()?),
        Err(_) => None,
    };

    let config = GatewayConfig::builder()
        .rpc_path(rpc_path)
        .group(
            GroupConfig::builder()
                .capacity(capacity)
                .maybe_max_shards(max_shards)
                .build(),
        )
        .build();
    let node = Node::new(config, counter::catalog());
    let gateway = node.gateway();

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, capacity, max_shards = ?max_shards, "Starting gateway");

    tokio::select! {
        result = gateway.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
