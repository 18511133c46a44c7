//! WebSocket entrypoint.
//!
//! Accepts upgrades on the configured path, derives the group key from the
//! request headers and hands the connection to the shard its group assigns.

mod config;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::group::{GroupDirectory, ShardLease};
use crate::ids::ConnectionId;
use crate::shard::ConnectionOutbound;

pub use config::{DEFAULT_MAX_INFLIGHT_FRAMES, DEFAULT_RPC_PATH, GatewayConfig};

/// Accepts client connections and attaches them to shards.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    groups: Arc<GroupDirectory>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, groups: Arc<GroupDirectory>) -> Self {
        Self {
            config: Arc::new(config),
            groups,
        }
    }

    /// Accept connections until the listener fails.
    ///
    /// Each connection runs on its own task.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        info!(
            addr = ?listener.local_addr().ok(),
            path = %self.config.rpc_path,
            "Gateway listening"
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.handle_connection(stream, Some(peer)).await;
            });
        }
    }

    /// Run one connection from upgrade to close.
    pub async fn handle_connection<S>(&self, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connection_id = ConnectionId::generate();
        let mut lease: Option<ShardLease> = None;

        let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
            self.on_upgrade(connection_id, request, response, &mut lease)
        })
        .await;

        let mut ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = ?peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let Some(lease) = lease else {
            return;
        };

        let shard = Arc::clone(lease.shard());
        let (outbound, mut rx) = ConnectionOutbound::with_capacity(self.config.outbound_capacity);
        shard.open(connection_id, outbound);
        let inflight = Arc::new(Semaphore::new(self.config.max_inflight_frames.max(1)));

        loop {
            tokio::select! {
                frame = ws.next() => {
                    let frame = match frame {
                        Some(Ok(Message::Text(text))) => Bytes::from(text),
                        Some(Ok(Message::Binary(data))) => Bytes::from(data),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                            break;
                        }
                    };
                    let Ok(permit) = Arc::clone(&inflight).acquire_owned().await else {
                        break;
                    };
                    let shard = Arc::clone(&shard);
                    tokio::spawn(async move {
                        shard.handle_message(connection_id, frame).await;
                        drop(permit);
                    });
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = ws.send(Message::Text(text)).await {
                        debug!(connection_id = %connection_id, error = %e, "Failed to write frame");
                        break;
                    }
                }
            }
        }

        shard.close(connection_id);
        drop(lease);
        let _ = ws.close(None).await;
    }

    fn on_upgrade(
        &self,
        connection_id: ConnectionId,
        request: &Request,
        response: Response,
        lease: &mut Option<ShardLease>,
    ) -> Result<Response, ErrorResponse> {
        if request.uri().path() != self.config.rpc_path {
            return Err(reject(StatusCode::NOT_FOUND, "Not found"));
        }

        let group_key = self.config.group_key(request.headers());
        match self.groups.assign(&group_key, connection_id) {
            Ok(assigned) => {
                info!(
                    connection_id = %connection_id,
                    group = %group_key,
                    shard_id = %assigned.shard().id(),
                    "Accepted connection"
                );
                *lease = Some(assigned);
                Ok(response)
            }
            Err(e) => {
                warn!(group = %group_key, error = %e, "Rejected upgrade");
                Err(reject(StatusCode::SERVICE_UNAVAILABLE, "No shard available"))
            }
        }
    }
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_owned()));
    *response.status_mut() = status;
    response
}
