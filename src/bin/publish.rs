use anyhow::Result;
use serde_json::json;
use shardgate::counter::{ADDRESSING_FIELD, COUNTER_KIND};
use shardgate::{DEFAULT_GATEWAY_URL, GatewayClient, init_tracing};
use std::time::Duration;
use url::Url;

/// Interval between increments.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let url = std::env::var("GATEWAY_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string());
    let name = std::env::var("COUNTER_NAME").unwrap_or_else(|_| "team1".to_string());

    println!("Connecting to gateway at {url}");
    let mut client = GatewayClient::connect(&url.parse::<Url>()?).await?;

    let path = format!("{COUNTER_KIND}.inc");
    let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
    loop {
        interval.tick().await;
        let value = client
            .mutation(&path, json!({ ADDRESSING_FIELD: name, "amount": 1 }))
            .await?;
        println!("Incremented '{name}' to {value}");
    }
}
