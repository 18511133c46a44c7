//! Minimal WebSocket client for the gateway's envelope protocol.

use async_stream::try_stream;
use futures::{SinkExt, Stream, StreamExt};
use rpcshard_lite::{
    ErrorCode, ProcedureKind, RequestEnvelope, RequestId, ResponseEnvelope, ResultPayload,
};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid frame from gateway: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("connection closed")]
    Closed,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One client connection to the gateway.
pub struct GatewayClient {
    ws: Socket,
    next_id: i64,
}

impl GatewayClient {
    pub async fn connect(url: &Url) -> Result<Self, ClientError> {
        let (ws, _response) = connect_async(url.as_str()).await?;
        debug!(url = %url, "Connected to gateway");
        Ok(Self { ws, next_id: 1 })
    }

    fn allocate_id(&mut self) -> RequestId {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;
        id
    }

    async fn send(&mut self, envelope: &RequestEnvelope) -> Result<(), ClientError> {
        let text = envelope.to_wire().to_string();
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Read envelopes until one for `id` arrives. Envelopes for other ids
    /// are dropped.
    async fn next_for(&mut self, id: &RequestId) -> Result<ResponseEnvelope, ClientError> {
        while let Some(message) = self.ws.next().await {
            let text = match message? {
                Message::Text(text) => text,
                Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                Message::Close(_) => break,
                _ => continue,
            };
            let envelope: ResponseEnvelope = serde_json::from_str(&text)?;
            if envelope.id.as_ref() == Some(id) {
                return Ok(envelope);
            }
            debug!(id = ?envelope.id, "Skipping envelope for another request");
        }
        Err(ClientError::Closed)
    }

    /// Run a query or mutation and wait for its result.
    pub async fn call(
        &mut self,
        kind: ProcedureKind,
        path: &str,
        input: Value,
    ) -> Result<Value, ClientError> {
        let id = self.allocate_id();
        self.send(&RequestEnvelope::call(id.clone(), kind, path, input))
            .await?;
        let reply = self.next_for(&id).await?;
        into_data(reply)
    }

    pub async fn query(&mut self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.call(ProcedureKind::Query, path, input).await
    }

    pub async fn mutation(&mut self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.call(ProcedureKind::Mutation, path, input).await
    }

    /// Start a subscription and stream its values, the initial one first.
    pub fn subscribe(
        mut self,
        path: String,
        input: Value,
    ) -> impl Stream<Item = Result<Value, ClientError>> {
        try_stream! {
            let id = self.allocate_id();
            self.send(&RequestEnvelope::call(id.clone(), ProcedureKind::Subscription, path, input))
                .await?;
            loop {
                let envelope = self.next_for(&id).await?;
                match envelope.result {
                    Some(ResultPayload::Started) => continue,
                    Some(ResultPayload::Stopped) => break,
                    _ => yield into_data(envelope)?,
                }
            }
        }
    }
}

fn into_data(envelope: ResponseEnvelope) -> Result<Value, ClientError> {
    if let Some(error) = envelope.error {
        return Err(ClientError::Remote {
            code: error.error_code(),
            message: error.message,
        });
    }
    match envelope.result {
        Some(ResultPayload::Data { data }) => Ok(data),
        _ => Ok(Value::Null),
    }
}
