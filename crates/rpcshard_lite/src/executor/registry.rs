use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{InstanceError, StorageError};
use crate::executor::{EmitReport, ExecutorAdapter, ExecutorCatalog, InstanceContext, InstanceKey};
use crate::internal::{FanoutTransport, ForwardedCall, ForwardedReply};
use crate::storage::StorageProvider;

/// Maps `(kind, name)` to the single live instance with that identity.
pub trait InstanceResolver: Send + Sync {
    fn resolve(&self, kind: &str, name: &str) -> Result<InstanceHandle, InstanceError>;
}

enum InstanceCommand {
    Call {
        call: ForwardedCall,
        reply: oneshot::Sender<ForwardedReply>,
    },
    Emit {
        topic: String,
        message: Value,
        reply: oneshot::Sender<Result<EmitReport, StorageError>>,
    },
}

/// Cloneable address of a running instance.
///
/// Commands are queued on the instance's mailbox and run one at a time, so
/// calls against the same instance never interleave.
#[derive(Clone)]
pub struct InstanceHandle {
    key: InstanceKey,
    tx: mpsc::UnboundedSender<InstanceCommand>,
}

impl InstanceHandle {
    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// Whether both handles point at the same running instance.
    pub fn same_instance(&self, other: &InstanceHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub async fn call(&self, call: ForwardedCall) -> Result<ForwardedReply, InstanceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(InstanceCommand::Call { call, reply })
            .map_err(|_| InstanceError::Closed(self.key.clone()))?;
        rx.await.map_err(|_| InstanceError::Closed(self.key.clone()))
    }

    /// Publish `message` on `topic` from inside the instance's turn order.
    pub async fn emit(
        &self,
        topic: impl Into<String>,
        message: Value,
    ) -> Result<EmitReport, InstanceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(InstanceCommand::Emit {
                topic: topic.into(),
                message,
                reply,
            })
            .map_err(|_| InstanceError::Closed(self.key.clone()))?;
        let report = rx
            .await
            .map_err(|_| InstanceError::Closed(self.key.clone()))??;
        Ok(report)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle").field("key", &self.key).finish()
    }
}

/// Creates instances on first use and keeps them for the life of the process.
pub struct InstanceRegistry {
    catalog: Arc<ExecutorCatalog>,
    storage: Arc<dyn StorageProvider>,
    fanout: Arc<dyn FanoutTransport>,
    instances: DashMap<InstanceKey, InstanceHandle, ahash::RandomState>,
}

impl InstanceRegistry {
    pub fn new(
        catalog: Arc<ExecutorCatalog>,
        storage: Arc<dyn StorageProvider>,
        fanout: Arc<dyn FanoutTransport>,
    ) -> Self {
        Self {
            catalog,
            storage,
            fanout,
            instances: DashMap::default(),
        }
    }

    /// Number of instances started so far.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn spawn(&self, key: InstanceKey) -> Result<InstanceHandle, InstanceError> {
        let definition = self
            .catalog
            .get(&key.kind)
            .ok_or_else(|| InstanceError::UnknownKind(key.kind.clone()))?;

        let ctx = InstanceContext::new(
            key.clone(),
            self.storage.open(&key),
            Arc::clone(&self.fanout),
        );
        let adapter = ExecutorAdapter::new(ctx, Arc::clone(definition.procedures()));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_instance(adapter, rx));

        info!(instance = %key, "Started executor instance");
        Ok(InstanceHandle { key, tx })
    }
}

impl InstanceResolver for InstanceRegistry {
    fn resolve(&self, kind: &str, name: &str) -> Result<InstanceHandle, InstanceError> {
        let key = InstanceKey::new(kind, name);
        match self.instances.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    warn!(instance = %key, "Instance mailbox closed, restarting");
                    let handle = self.spawn(key)?;
                    entry.insert(handle.clone());
                    return Ok(handle);
                }
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(key)?;
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }
}

async fn run_instance(adapter: ExecutorAdapter, mut rx: mpsc::UnboundedReceiver<InstanceCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            InstanceCommand::Call { call, reply } => {
                let reply_value = adapter.handle_forwarded_call(call).await;
                let _ = reply.send(reply_value);
            }
            InstanceCommand::Emit {
                topic,
                message,
                reply,
            } => {
                let report = adapter.emit(&topic, message).await;
                let _ = reply.send(report);
            }
        }
    }
    debug!(instance = %adapter.context().key(), "Instance mailbox drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ProcedureKind;
    use crate::error::{ErrorCode, ProcedureError};
    use crate::executor::ExecutorDefinition;
    use crate::ids::ShardId;
    use crate::internal::{FanoutEvent, FanoutStatus};
    use crate::procedure::ProcedureTable;
    use crate::router::FieldAddressing;
    use crate::storage::MemoryStorageProvider;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoShards;

    #[async_trait]
    impl FanoutTransport for NoShards {
        async fn push(&self, _shard: &ShardId, _event: &FanoutEvent) -> FanoutStatus {
            FanoutStatus::NotFound
        }
    }

    fn registry() -> InstanceRegistry {
        let mut procedures = ProcedureTable::new();
        procedures.mutation("bump", |ctx: InstanceContext, _input: Value| async move {
            let value = ctx.storage().load::<i64>("n").await?.unwrap_or(0) + 1;
            ctx.storage().save("n", &value).await?;
            Ok::<_, ProcedureError>(value)
        });

        let mut catalog = ExecutorCatalog::new();
        catalog.register(ExecutorDefinition::new(
            "DO_TEST",
            FieldAddressing::new("_namespace"),
            procedures,
        ));

        InstanceRegistry::new(
            Arc::new(catalog),
            Arc::new(MemoryStorageProvider::new()),
            Arc::new(NoShards),
        )
    }

    fn bump(name: &str) -> ForwardedCall {
        ForwardedCall {
            path: "bump".into(),
            kind: ProcedureKind::Mutation,
            input: Value::Null,
            origin_shard_id: ShardId::new("shard-a"),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn test_resolve_is_deterministic() {
        let registry = registry();
        let a = registry.resolve("DO_TEST", "team1").unwrap();
        let b = registry.resolve("DO_TEST", "team1").unwrap();
        let c = registry.resolve("DO_TEST", "team2").unwrap();

        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let registry = registry();
        let err = registry.resolve("DO_MISSING", "x").unwrap_err();
        assert!(matches!(err, InstanceError::UnknownKind(_)));
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let registry = Arc::new(registry());

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let handle = registry.resolve("DO_TEST", "team1").unwrap();
                handle.call(bump("team1")).await.unwrap().into_result().unwrap()
            }));
        }

        let mut seen: Vec<i64> = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap().as_i64().unwrap());
        }
        seen.sort();
        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_state_is_per_instance() {
        let registry = registry();
        let one = registry.resolve("DO_TEST", "one").unwrap();
        let two = registry.resolve("DO_TEST", "two").unwrap();

        one.call(bump("one")).await.unwrap();
        one.call(bump("one")).await.unwrap();
        let reply = two.call(bump("two")).await.unwrap();
        assert_eq!(reply.into_result().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_emit_through_handle() {
        let registry = registry();
        let handle = registry.resolve("DO_TEST", "team1").unwrap();
        let report = handle.emit("count", json!(1)).await.unwrap();
        assert!(report.is_empty());
    }
}
