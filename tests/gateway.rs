use futures::StreamExt;
use rpcshard_lite::{ErrorCode, GatewayConfig, GroupConfig, Node};
use serde_json::json;
use shardgate::counter::{self, ADDRESSING_FIELD};
use shardgate::{ClientError, GatewayClient};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

async fn start() -> (Node, Url) {
    start_with(GatewayConfig::default()).await
}

async fn start_with(config: GatewayConfig) -> (Node, Url) {
    let node = Node::new(config, counter::catalog());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = node.gateway();
    tokio::spawn(async move { gateway.serve(listener).await });
    let url = format!("ws://{addr}/rpc").parse().unwrap();
    (node, url)
}

#[tokio::test]
async fn test_mutation_and_query_over_websocket() {
    let (_node, url) = start().await;
    let mut client = GatewayClient::connect(&url).await.unwrap();

    let value = client
        .mutation("DO_COUNTER.inc", json!({ ADDRESSING_FIELD: "e2e", "amount": 4 }))
        .await
        .unwrap();
    assert_eq!(value, json!(4));

    let value = client
        .query("DO_COUNTER.get", json!({ ADDRESSING_FIELD: "e2e" }))
        .await
        .unwrap();
    assert_eq!(value, json!(4));
}

#[tokio::test]
async fn test_subscriber_sees_other_connections_mutations() {
    let (_node, url) = start().await;

    let subscriber = GatewayClient::connect(&url).await.unwrap();
    let updates = subscriber.subscribe(
        "DO_COUNTER.count".to_string(),
        json!({ ADDRESSING_FIELD: "shared" }),
    );
    futures::pin_mut!(updates);

    let initial = timeout(WAIT, updates.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(initial, json!(0));

    let mut publisher = GatewayClient::connect(&url).await.unwrap();
    for _ in 0..3 {
        publisher
            .mutation("DO_COUNTER.inc", json!({ ADDRESSING_FIELD: "shared", "amount": 1 }))
            .await
            .unwrap();
    }

    for expected in 1..=3 {
        let value = timeout(WAIT, updates.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(value, json!(expected));
    }
}

#[tokio::test]
async fn test_unknown_namespace_is_reported() {
    let (_node, url) = start().await;
    let mut client = GatewayClient::connect(&url).await.unwrap();

    match client.query("NOPE.get", json!({ ADDRESSING_FIELD: "x" })).await {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, ErrorCode::BadRequest),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_path_is_refused() {
    let (_node, url) = start().await;
    let mut wrong = url.clone();
    wrong.set_path("/elsewhere");
    assert!(GatewayClient::connect(&wrong).await.is_err());
}

#[tokio::test]
async fn test_upgrade_refused_when_no_shard_can_be_created() {
    let config = GatewayConfig::builder()
        .group(GroupConfig::builder().max_shards(0).build())
        .build();
    let (node, url) = start_with(config).await;

    match GatewayClient::connect(&url).await {
        Err(ClientError::WebSocket(tungstenite::Error::Http(response))) => {
            assert_eq!(response.status(), 503);
        }
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
    assert!(node.directory().is_empty());
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    use futures::SinkExt;
    use tungstenite::Message;

    let (_node, url) = start().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Ping(b"alive".to_vec())).await.unwrap();

    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Pong(b"alive".to_vec()));
}
