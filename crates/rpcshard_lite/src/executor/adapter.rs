use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::envelope::ProcedureKind;
use crate::error::{ProcedureError, StorageError};
use crate::executor::InstanceKey;
use crate::ids::ShardId;
use crate::internal::{
    FanoutEvent, FanoutStatus, FanoutTransport, ForwardedCall, ForwardedReply,
    SubscriptionHandshake,
};
use crate::procedure::{ProcedureTable, Subscribed};
use crate::storage::KvStore;

const TOPIC_KEY_PREFIX: &str = "_topic/";

fn topic_key(topic: &str) -> String {
    format!("{TOPIC_KEY_PREFIX}{topic}")
}

/// Result of one [`InstanceContext::emit`] round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Shards that had at least one local subscriber.
    pub delivered: Vec<ShardId>,
    /// Shards that answered not-found and were dropped from the registry.
    pub pruned: Vec<ShardId>,
}

impl EmitReport {
    /// True when nothing was delivered anywhere.
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }
}

struct ContextInner {
    key: InstanceKey,
    storage: Arc<dyn KvStore>,
    fanout: Arc<dyn FanoutTransport>,
}

/// What a procedure sees of the instance it runs in: its identity, its
/// storage and its publish path.
#[derive(Clone)]
pub struct InstanceContext {
    inner: Arc<ContextInner>,
}

impl InstanceContext {
    pub fn new(
        key: InstanceKey,
        storage: Arc<dyn KvStore>,
        fanout: Arc<dyn FanoutTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                key,
                storage,
                fanout,
            }),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.inner.key
    }

    pub fn kind(&self) -> &str {
        &self.inner.key.kind
    }

    pub fn name(&self) -> &str {
        &self.inner.key.name
    }

    pub fn storage(&self) -> &Arc<dyn KvStore> {
        &self.inner.storage
    }

    /// `<kind>|<name>|<topic>`, the topic as shards see it.
    pub fn namespaced(&self, topic: &str) -> String {
        format!("{}|{}|{}", self.kind(), self.name(), topic)
    }

    /// Shards currently registered for `topic`.
    pub async fn subscribers(&self, topic: &str) -> Result<BTreeSet<ShardId>, StorageError> {
        let members = self.storage().set_members(&topic_key(topic)).await?;
        Ok(members.into_iter().map(ShardId::new).collect())
    }

    /// Register `shard` for `topic`. Returns whether it was newly added.
    pub async fn add_subscriber(&self, topic: &str, shard: &ShardId) -> Result<bool, StorageError> {
        self.storage()
            .set_add(&topic_key(topic), shard.as_str())
            .await
    }

    /// Push `message` to every shard registered for `topic`.
    ///
    /// Pushes go out in parallel. Shards that answer not-found are removed
    /// from the registry once the round is over; shards registered while the
    /// round was running are left alone.
    pub async fn emit(&self, topic: &str, message: Value) -> Result<EmitReport, StorageError> {
        let shards = self.subscribers(topic).await?;
        if shards.is_empty() {
            debug!(instance = %self.key(), topic = %topic, "Emit with no registered shards");
            return Ok(EmitReport::default());
        }

        let event = FanoutEvent {
            topic: self.namespaced(topic),
            message,
        };

        let fanout = self.inner.fanout.as_ref();
        let event_ref = &event;
        let outcomes = join_all(shards.into_iter().map(|shard| async move {
            let status = fanout.push(&shard, event_ref).await;
            (shard, status)
        }))
        .await;

        let mut report = EmitReport::default();
        for (shard, status) in outcomes {
            debug!(
                shard_id = %shard,
                topic = %event.topic,
                status = status.status_code(),
                "Fanout pushed"
            );
            match status {
                FanoutStatus::Delivered(_) => report.delivered.push(shard),
                FanoutStatus::NotFound => report.pruned.push(shard),
            }
        }

        if !report.pruned.is_empty() {
            let stale: Vec<String> = report
                .pruned
                .iter()
                .map(|shard| shard.as_str().to_owned())
                .collect();
            self.storage().set_remove(&topic_key(topic), &stale).await?;
            info!(
                instance = %self.key(),
                topic = %topic,
                pruned = ?stale,
                "Pruned stale shards from subscriber registry"
            );
        }

        Ok(report)
    }
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("key", &self.inner.key)
            .finish()
    }
}

/// Runs forwarded calls against one instance's procedures and storage.
///
/// The adapter takes no locks: the owning mailbox guarantees that only one
/// call runs at a time.
pub struct ExecutorAdapter {
    ctx: InstanceContext,
    procedures: Arc<ProcedureTable>,
}

impl ExecutorAdapter {
    pub fn new(ctx: InstanceContext, procedures: Arc<ProcedureTable>) -> Self {
        Self { ctx, procedures }
    }

    pub fn context(&self) -> &InstanceContext {
        &self.ctx
    }

    pub async fn handle_forwarded_call(&self, call: ForwardedCall) -> ForwardedReply {
        let path = call.path.clone();
        match self.execute(call).await {
            Ok(data) => ForwardedReply::ok(data),
            Err(e) => {
                warn!(
                    instance = %self.ctx.key(),
                    path = %path,
                    code = e.code.as_str(),
                    error = %e,
                    "Forwarded call failed"
                );
                ForwardedReply::err(e.into())
            }
        }
    }

    pub async fn emit(&self, topic: &str, message: Value) -> Result<EmitReport, StorageError> {
        self.ctx.emit(topic, message).await
    }

    async fn execute(&self, call: ForwardedCall) -> Result<Value, ProcedureError> {
        if call.name != self.ctx.name() {
            return Err(ProcedureError::internal(format!(
                "call for '{}' delivered to instance {}",
                call.name,
                self.ctx.key()
            )));
        }

        let procedure = self.procedures.get(&call.path).ok_or_else(|| {
            ProcedureError::bad_request(format!(
                "no procedure '{}' on '{}'",
                call.path,
                self.ctx.kind()
            ))
        })?;

        if procedure.kind() != call.kind {
            return Err(ProcedureError::bad_request(format!(
                "'{}' is a {}, not a {}",
                call.path,
                procedure.kind(),
                call.kind
            )));
        }

        match call.kind {
            ProcedureKind::Query | ProcedureKind::Mutation => {
                procedure.invoke(self.ctx.clone(), call.input).await
            }
            ProcedureKind::Subscription => {
                let origin = call.origin_shard_id;
                let output = procedure.invoke(self.ctx.clone(), call.input).await?;
                let subscribed: Subscribed<Value> =
                    serde_json::from_value(output).map_err(|e| {
                        ProcedureError::internal(format!(
                            "'{}' did not return a subscription handshake: {e}",
                            call.path
                        ))
                    })?;

                if self.ctx.add_subscriber(&subscribed.topic, &origin).await? {
                    debug!(
                        instance = %self.ctx.key(),
                        topic = %subscribed.topic,
                        shard_id = %origin,
                        "Registered subscriber shard"
                    );
                }

                let handshake = SubscriptionHandshake {
                    topic: self.ctx.namespaced(&subscribed.topic),
                    message: subscribed.initial,
                };
                Ok(serde_json::to_value(handshake)?)
            }
        }
    }
}
