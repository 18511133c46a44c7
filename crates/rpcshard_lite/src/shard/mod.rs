//! Connection shards.
//!
//! A [`ConnectionShard`] owns a bounded set of client connections. It decodes
//! their frames, routes calls through the [`ExecutorRouter`], keeps the
//! shard-local subscription index and redistributes fanout events pushed by
//! executor instances to the connections subscribed to them.

mod connection;
mod directory;
mod index;

use bytes::Bytes;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::envelope::{
    ErrorShape, JSONRPC_VERSION, ProcedureKind, Request, RequestEnvelope, RequestId,
    ResponseEnvelope, decode_frame,
};
use crate::error::{ErrorCode, OutboundError};
use crate::ids::{ConnectionId, ShardId};
use crate::internal::{FanoutEvent, FanoutStatus};
use crate::router::ExecutorRouter;

pub use connection::{ConnectionOutbound, DEFAULT_OUTBOUND_CAPACITY, OutboundReceiver};
pub use directory::ShardDirectory;
pub use index::{SubscriptionIndex, SubscriptionKey};

#[derive(Debug, Default)]
struct ShardState {
    connections: HashMap<ConnectionId, ConnectionOutbound>,
    index: SubscriptionIndex,
    /// Subscriptions whose handshake is still in flight. The instance may
    /// already list this shard and push to it before the binding exists.
    pending: HashSet<SubscriptionKey>,
}

/// One shard of live connections.
///
/// Index state sits behind a mutex that is only held for synchronous index
/// updates and outbound queueing, never across a forwarded call.
pub struct ConnectionShard {
    id: ShardId,
    router: Arc<ExecutorRouter>,
    state: Mutex<ShardState>,
}

impl ConnectionShard {
    pub fn new(id: ShardId, router: Arc<ExecutorRouter>) -> Self {
        Self {
            id,
            router,
            state: Mutex::new(ShardState::default()),
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    fn state(&self) -> MutexGuard<'_, ShardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection with no subscriptions.
    pub fn open(&self, connection_id: ConnectionId, outbound: ConnectionOutbound) {
        let mut state = self.state();
        if state.connections.insert(connection_id, outbound).is_some() {
            warn!(shard_id = %self.id, connection_id = %connection_id, "Connection reopened");
            state.index.remove_connection(connection_id);
        }
        info!(
            shard_id = %self.id,
            connection_id = %connection_id,
            connections = state.connections.len(),
            "Connection opened"
        );
    }

    /// Drop a connection and every subscription it owns.
    ///
    /// Purely local: instances that registered this shard find out through
    /// a not-found fanout reply. Returns the number of subscriptions removed.
    pub fn close(&self, connection_id: ConnectionId) -> usize {
        let mut state = self.state();
        state.connections.remove(&connection_id);
        state.pending.retain(|key| key.connection_id != connection_id);
        let removed = state.index.remove_connection(connection_id);
        info!(
            shard_id = %self.id,
            connection_id = %connection_id,
            subscriptions = removed,
            connections = state.connections.len(),
            "Connection closed"
        );
        removed
    }

    /// Handle one inbound frame holding a single envelope or a batch.
    ///
    /// Envelopes of one frame are dispatched concurrently; their replies may
    /// interleave on the wire.
    pub async fn handle_message(&self, connection_id: ConnectionId, frame: Bytes) {
        let Some(outbound) = self.outbound(connection_id) else {
            debug!(shard_id = %self.id, connection_id = %connection_id, "Frame for unknown connection");
            return;
        };

        let envelopes = match decode_frame(&frame) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(
                    shard_id = %self.id,
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to decode frame"
                );
                let shape = ErrorShape::new(ErrorCode::ParseError, e.to_string());
                send(&outbound, &ResponseEnvelope::error(None, None, shape));
                return;
            }
        };

        debug!(
            shard_id = %self.id,
            connection_id = %connection_id,
            envelopes = envelopes.len(),
            "Dispatching frame"
        );
        join_all(
            envelopes
                .into_iter()
                .map(|envelope| self.dispatch(connection_id, &outbound, envelope)),
        )
        .await;
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        outbound: &ConnectionOutbound,
        envelope: RequestEnvelope,
    ) {
        let RequestEnvelope {
            id,
            jsonrpc,
            request,
        } = envelope;

        let (kind, path, input) = match request {
            Request::Stop => {
                if let Some(id) = id {
                    self.unsubscribe(connection_id, outbound, id, jsonrpc);
                }
                return;
            }
            Request::Call { kind, path, input } => (kind, path, input),
        };

        let Some(id) = id else {
            let shape = ErrorShape::new(ErrorCode::BadRequest, "`id` is required");
            send(outbound, &ResponseEnvelope::error(None, jsonrpc, shape));
            return;
        };

        match kind {
            ProcedureKind::Query | ProcedureKind::Mutation => {
                let reply = match self.router.route(&path, kind, input, &self.id).await {
                    Ok(data) => ResponseEnvelope::data(Some(id), jsonrpc, data),
                    Err(e) => {
                        warn!(
                            shard_id = %self.id,
                            connection_id = %connection_id,
                            path = %path,
                            error = %e,
                            "Call failed"
                        );
                        let shape = ErrorShape::new(e.code(), e.to_string()).with_path(path);
                        ResponseEnvelope::error(Some(id), jsonrpc, shape)
                    }
                };
                send(outbound, &reply);
            }
            ProcedureKind::Subscription => {
                self.subscribe(connection_id, outbound, id, jsonrpc, path, input)
                    .await;
            }
        }
    }

    async fn subscribe(
        &self,
        connection_id: ConnectionId,
        outbound: &ConnectionOutbound,
        id: RequestId,
        jsonrpc: Option<String>,
        path: String,
        input: Value,
    ) {
        let key = SubscriptionKey::new(connection_id, id.clone());

        // The id is reserved before the first await so a second subscription
        // with the same id in the same batch sees it.
        let reservation = {
            let mut state = self.state();
            if let Some(topic) = state.index.remove(&key) {
                warn!(
                    shard_id = %self.id,
                    connection_id = %connection_id,
                    id = %id,
                    topic = %topic,
                    "Duplicate subscription id, dropped previous binding"
                );
                None
            } else if !state.pending.insert(key.clone()) {
                warn!(
                    shard_id = %self.id,
                    connection_id = %connection_id,
                    id = %id,
                    "Duplicate subscription id, handshake already in flight"
                );
                None
            } else {
                Some(PendingHandshake {
                    shard: self,
                    key: Some(key.clone()),
                })
            }
        };
        let Some(reservation) = reservation else {
            let shape =
                ErrorShape::new(ErrorCode::BadRequest, format!("Duplicate id {id}")).with_path(path);
            send(outbound, &ResponseEnvelope::error(Some(id), jsonrpc, shape));
            return;
        };

        let handshake = match self.router.subscribe(&path, input, &self.id).await {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(
                    shard_id = %self.id,
                    connection_id = %connection_id,
                    path = %path,
                    error = %e,
                    "Subscription failed"
                );
                let shape = ErrorShape::new(e.code(), e.to_string()).with_path(path);
                send(outbound, &ResponseEnvelope::error(Some(id), jsonrpc, shape));
                return;
            }
        };

        // Replies are queued under the lock so no fanout push can overtake them.
        let mut state = self.state();
        reservation.complete(&mut state);
        if !state.connections.contains_key(&connection_id) {
            debug!(
                shard_id = %self.id,
                connection_id = %connection_id,
                topic = %handshake.topic,
                "Connection closed before subscription started"
            );
            return;
        }
        state.index.insert(key, handshake.topic.clone());
        send(outbound, &ResponseEnvelope::started(Some(id.clone()), jsonrpc.clone()));
        send(
            outbound,
            &ResponseEnvelope::data(Some(id), jsonrpc, handshake.message),
        );
        debug!(
            shard_id = %self.id,
            connection_id = %connection_id,
            topic = %handshake.topic,
            "Subscription started"
        );
    }

    fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        outbound: &ConnectionOutbound,
        id: RequestId,
        jsonrpc: Option<String>,
    ) {
        let key = SubscriptionKey::new(connection_id, id.clone());
        let mut state = self.state();
        if let Some(topic) = state.index.remove(&key) {
            debug!(
                shard_id = %self.id,
                connection_id = %connection_id,
                topic = %topic,
                "Subscription stopped"
            );
            send(outbound, &ResponseEnvelope::stopped(Some(id), jsonrpc));
        }
    }

    /// Deliver a pushed event to every local subscriber of its topic.
    pub fn receive_fanout(&self, event: &FanoutEvent) -> FanoutStatus {
        let state = self.state();
        let mut delivered = 0;
        for key in state.index.subscribers(&event.topic) {
            let Some(outbound) = state.connections.get(&key.connection_id) else {
                continue;
            };
            let push = ResponseEnvelope::data(
                Some(key.request_id),
                Some(JSONRPC_VERSION.to_owned()),
                event.message.clone(),
            );
            if send(outbound, &push) {
                delivered += 1;
            }
        }

        if delivered == 0 && !state.pending.is_empty() {
            // A handshake in flight may be for this topic; keep the registration.
            debug!(
                shard_id = %self.id,
                topic = %event.topic,
                pending = state.pending.len(),
                "No bound subscribers yet, handshake pending"
            );
            return FanoutStatus::Delivered(0);
        }
        if delivered == 0 {
            debug!(shard_id = %self.id, topic = %event.topic, "No local subscribers for fanout");
            return FanoutStatus::NotFound;
        }
        debug!(shard_id = %self.id, topic = %event.topic, delivered, "Fanout redistributed");
        FanoutStatus::Delivered(delivered)
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state().index.len()
    }

    /// Topic bound to `(connection_id, id)`, if any.
    pub fn subscription_topic(&self, connection_id: ConnectionId, id: &RequestId) -> Option<String> {
        let key = SubscriptionKey::new(connection_id, id.clone());
        self.state().index.topic_of(&key).map(str::to_owned)
    }

    fn outbound(&self, connection_id: ConnectionId) -> Option<ConnectionOutbound> {
        self.state().connections.get(&connection_id).cloned()
    }
}

impl std::fmt::Debug for ConnectionShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionShard").field("id", &self.id).finish()
    }
}

/// Releases a reserved subscription id. Dropped without [`complete`] when
/// the handshake fails or the dispatch is cancelled.
///
/// [`complete`]: PendingHandshake::complete
struct PendingHandshake<'a> {
    shard: &'a ConnectionShard,
    key: Option<SubscriptionKey>,
}

impl PendingHandshake<'_> {
    fn complete(mut self, state: &mut ShardState) {
        if let Some(key) = self.key.take() {
            state.pending.remove(&key);
        }
    }
}

impl Drop for PendingHandshake<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.shard.state().pending.remove(&key);
        }
    }
}

fn send(outbound: &ConnectionOutbound, envelope: &ResponseEnvelope) -> bool {
    match outbound.send(envelope) {
        Ok(()) => true,
        Err(OutboundError::Full) => {
            warn!(id = ?envelope.id, "Outbound queue full, dropped envelope");
            false
        }
        Err(e) => {
            debug!(id = ?envelope.id, error = %e, "Dropped outbound envelope");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResultPayload;
    use crate::error::ProcedureError;
    use crate::executor::{ExecutorCatalog, ExecutorDefinition, InstanceContext, InstanceRegistry};
    use crate::procedure::{ProcedureTable, Subscribed};
    use crate::router::FieldAddressing;
    use crate::storage::MemoryStorageProvider;
    use serde_json::json;

    fn shard() -> Arc<ConnectionShard> {
        let mut procedures = ProcedureTable::new();
        procedures
            .query("echo", |_ctx: InstanceContext, input: Value| async move {
                Ok::<_, ProcedureError>(input["value"].clone())
            })
            .subscription("ticks", |_ctx: InstanceContext, _input: Value| async move {
                Ok::<_, ProcedureError>(Subscribed::new("ticks", 0))
            });

        let mut catalog = ExecutorCatalog::new();
        catalog.register(ExecutorDefinition::new(
            "DO_TEST",
            FieldAddressing::new("_namespace"),
            procedures,
        ));
        let catalog = Arc::new(catalog);

        let directory = Arc::new(ShardDirectory::new());
        let registry = Arc::new(InstanceRegistry::new(
            Arc::clone(&catalog),
            Arc::new(MemoryStorageProvider::new()),
            directory.clone(),
        ));
        let router = Arc::new(ExecutorRouter::new(catalog, registry));
        let shard = Arc::new(ConnectionShard::new(ShardId::new("shard-test"), router));
        directory.insert(Arc::clone(&shard));
        shard
    }

    fn frame(value: Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    fn call(id: i64, method: &str, path: &str) -> Value {
        json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
            "params": {"path": path, "input": {"_namespace": "team1", "value": id}}
        })
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<ResponseEnvelope> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_query_reply_echoes_id_and_jsonrpc() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        shard
            .handle_message(conn, frame(call(4, "query", "DO_TEST.echo")))
            .await;

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, Some(RequestId::Number(4)));
        assert_eq!(replies[0].jsonrpc.as_deref(), Some("2.0"));
        assert_eq!(replies[0].data_value(), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_batch_gets_one_reply_per_envelope() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        let batch = json!([
            call(1, "query", "DO_TEST.echo"),
            call(2, "query", "DO_TEST.echo"),
            call(3, "query", "DO_TEST.nope"),
        ]);
        shard.handle_message(conn, frame(batch)).await;

        let mut replies = drain(&mut rx);
        replies.sort_by_key(|r| match r.id {
            Some(RequestId::Number(n)) => n,
            _ => 0,
        });
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].data_value(), Some(&json!(1)));
        assert_eq!(replies[1].data_value(), Some(&json!(2)));
        let error = replies[2].error.as_ref().unwrap();
        assert_eq!(error.error_code(), ErrorCode::BadRequest);
        assert_eq!(error.data.path.as_deref(), Some("DO_TEST.nope"));
    }

    #[tokio::test]
    async fn test_parse_error_keeps_connection_open() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        shard.handle_message(conn, Bytes::from_static(b"{not json")).await;
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, None);
        assert_eq!(replies[0].error.as_ref().unwrap().error_code(), ErrorCode::ParseError);

        shard
            .handle_message(conn, frame(call(1, "query", "DO_TEST.echo")))
            .await;
        assert_eq!(drain(&mut rx)[0].data_value(), Some(&json!(1)));
        assert_eq!(shard.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_null_id_is_bad_request() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        let mut envelope = call(1, "query", "DO_TEST.echo");
        envelope["id"] = Value::Null;
        shard.handle_message(conn, frame(envelope)).await;

        let replies = drain(&mut rx);
        assert_eq!(replies[0].id, None);
        assert_eq!(replies[0].error.as_ref().unwrap().error_code(), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_subscribe_sends_started_then_initial_data() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        shard
            .handle_message(conn, frame(call(7, "subscription", "DO_TEST.ticks")))
            .await;

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].result, Some(ResultPayload::Started));
        assert_eq!(replies[1].data_value(), Some(&json!(0)));
        assert_eq!(
            shard.subscription_topic(conn, &RequestId::Number(7)).as_deref(),
            Some("DO_TEST|team1|ticks")
        );
    }

    #[tokio::test]
    async fn test_duplicate_subscription_id_removes_first_and_fails() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        let sub = call(7, "subscription", "DO_TEST.ticks");
        shard.handle_message(conn, frame(sub.clone())).await;
        drain(&mut rx);

        shard.handle_message(conn, frame(sub)).await;
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        let error = replies[0].error.as_ref().unwrap();
        assert_eq!(error.error_code(), ErrorCode::BadRequest);
        assert_eq!(error.message, "Duplicate id 7");
        assert_eq!(shard.subscription_count(), 0);
        assert!(shard.state().index.is_consistent());
    }

    #[tokio::test]
    async fn test_repeated_subscription_id_in_one_batch() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        let sub = call(7, "subscription", "DO_TEST.ticks");
        shard.handle_message(conn, frame(json!([sub.clone(), sub]))).await;

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 3);
        let errors: Vec<_> = replies.iter().filter_map(|r| r.error.as_ref()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Duplicate id 7");
        let started = replies
            .iter()
            .filter(|r| r.result == Some(ResultPayload::Started))
            .count();
        assert_eq!(started, 1);
        assert_eq!(shard.subscription_count(), 1);
        assert!(shard.state().pending.is_empty());
    }

    #[tokio::test]
    async fn test_failed_handshake_releases_id() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        shard
            .handle_message(conn, frame(call(7, "subscription", "DO_TEST.missing")))
            .await;
        assert!(drain(&mut rx)[0].error.is_some());
        assert!(shard.state().pending.is_empty());

        shard
            .handle_message(conn, frame(call(7, "subscription", "DO_TEST.ticks")))
            .await;
        assert_eq!(drain(&mut rx)[0].result, Some(ResultPayload::Started));
    }

    #[tokio::test]
    async fn test_fanout_during_handshake_is_not_found_only_after_close() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, _rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);
        shard
            .state()
            .pending
            .insert(SubscriptionKey::new(conn, RequestId::Number(1)));

        let event = FanoutEvent {
            topic: "DO_TEST|team1|ticks".into(),
            message: json!(1),
        };
        assert_eq!(shard.receive_fanout(&event), FanoutStatus::Delivered(0));

        shard.close(conn);
        assert_eq!(shard.receive_fanout(&event), FanoutStatus::NotFound);
    }

    #[tokio::test]
    async fn test_stop_replies_only_for_known_subscription() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let (outbound, mut rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);

        shard
            .handle_message(conn, frame(call(7, "subscription", "DO_TEST.ticks")))
            .await;
        drain(&mut rx);

        let stop = json!({"id": 7, "method": "subscription.stop"});
        shard.handle_message(conn, frame(stop.clone())).await;
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].result, Some(ResultPayload::Stopped));
        assert_eq!(replies[0].jsonrpc, None);

        shard.handle_message(conn, frame(stop)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_fanout_reaches_subscribers_only() {
        let shard = shard();
        let subscribed = ConnectionId::generate();
        let idle = ConnectionId::generate();
        let (outbound_a, mut rx_a) = ConnectionOutbound::channel();
        let (outbound_b, mut rx_b) = ConnectionOutbound::channel();
        shard.open(subscribed, outbound_a);
        shard.open(idle, outbound_b);

        shard
            .handle_message(subscribed, frame(call(3, "subscription", "DO_TEST.ticks")))
            .await;
        drain(&mut rx_a);

        let event = FanoutEvent {
            topic: "DO_TEST|team1|ticks".into(),
            message: json!(42),
        };
        assert_eq!(shard.receive_fanout(&event), FanoutStatus::Delivered(1));

        let pushes = drain(&mut rx_a);
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].id, Some(RequestId::Number(3)));
        assert_eq!(pushes[0].data_value(), Some(&json!(42)));
        assert!(drain(&mut rx_b).is_empty());

        let other = FanoutEvent {
            topic: "DO_TEST|team2|ticks".into(),
            message: json!(1),
        };
        assert_eq!(shard.receive_fanout(&other), FanoutStatus::NotFound);
    }

    #[tokio::test]
    async fn test_close_removes_every_subscription() {
        let shard = shard();
        let conn = ConnectionId::generate();
        let other = ConnectionId::generate();
        let (outbound, _rx) = ConnectionOutbound::channel();
        let (other_outbound, _other_rx) = ConnectionOutbound::channel();
        shard.open(conn, outbound);
        shard.open(other, other_outbound);

        let batch = json!([
            call(1, "subscription", "DO_TEST.ticks"),
            call(2, "subscription", "DO_TEST.ticks"),
        ]);
        shard.handle_message(conn, frame(batch)).await;
        shard
            .handle_message(other, frame(call(1, "subscription", "DO_TEST.ticks")))
            .await;
        assert_eq!(shard.subscription_count(), 3);

        assert_eq!(shard.close(conn), 2);
        let state = shard.state();
        assert!(!state.index.references(conn));
        assert!(state.index.is_consistent());
        assert_eq!(state.index.len(), 1);
    }

    #[tokio::test]
    async fn test_frame_for_unknown_connection_is_dropped() {
        let shard = shard();
        shard
            .handle_message(ConnectionId::generate(), frame(call(1, "query", "DO_TEST.echo")))
            .await;
        assert_eq!(shard.connection_count(), 0);
    }
}
