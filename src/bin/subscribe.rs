use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use shardgate::counter::{ADDRESSING_FIELD, COUNTER_KIND, COUNT_TOPIC};
use shardgate::{DEFAULT_GATEWAY_URL, GatewayClient, init_tracing};
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let url = std::env::var("GATEWAY_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string());
    let name = std::env::var("COUNTER_NAME").unwrap_or_else(|_| "team1".to_string());

    println!("Connecting to gateway at {url}");
    let client = GatewayClient::connect(&url.parse::<Url>()?).await?;

    let path = format!("{COUNTER_KIND}.{COUNT_TOPIC}");
    println!("Subscribing to {path} for counter '{name}'");

    let updates = client.subscribe(path, json!({ ADDRESSING_FIELD: name }));
    futures::pin_mut!(updates);
    while let Some(value) = updates.next().await {
        println!("count = {}", value?);
    }

    println!("Subscription closed");
    Ok(())
}
