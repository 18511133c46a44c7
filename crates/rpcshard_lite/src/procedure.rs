use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

use crate::envelope::ProcedureKind;
use crate::error::ProcedureError;
use crate::executor::InstanceContext;

/// Output of a subscription procedure: the topic to register the caller's
/// shard under and the first value to hand back.
///
/// The procedure is a one-shot handshake. Later values reach subscribers
/// through [`InstanceContext::emit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribed<T> {
    pub topic: String,
    pub initial: T,
}

impl<T> Subscribed<T> {
    pub fn new(topic: impl Into<String>, initial: T) -> Self {
        Self {
            topic: topic.into(),
            initial,
        }
    }
}

pub type ProcedureFuture = Pin<Box<dyn Future<Output = Result<Value, ProcedureError>> + Send>>;

/// A type-erased procedure body taking raw JSON input.
pub type ProcedureFn = Arc<dyn Fn(InstanceContext, Value) -> ProcedureFuture + Send + Sync + 'static>;

/// A registered procedure and the kind it may be invoked as.
#[derive(Clone)]
pub struct Procedure {
    kind: ProcedureKind,
    handler: ProcedureFn,
}

impl Procedure {
    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    pub fn invoke(&self, ctx: InstanceContext, input: Value) -> ProcedureFuture {
        (self.handler)(ctx, input)
    }
}

/// The closed set of procedures one executor kind exposes.
///
/// Built once at startup; lookups at call time are by name only.
#[derive(Clone, Default)]
pub struct ProcedureTable {
    procedures: HashMap<String, Procedure>,
}

impl ProcedureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read-only procedure.
    pub fn query<I, O, F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(InstanceContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ProcedureError>> + Send + 'static,
    {
        self.insert(name.into(), ProcedureKind::Query, make_handler(f))
    }

    /// Register a state-changing procedure.
    pub fn mutation<I, O, F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(InstanceContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ProcedureError>> + Send + 'static,
    {
        self.insert(name.into(), ProcedureKind::Mutation, make_handler(f))
    }

    /// Register a subscription handshake.
    pub fn subscription<I, T, F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        F: Fn(InstanceContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Subscribed<T>, ProcedureError>> + Send + 'static,
    {
        self.insert(name.into(), ProcedureKind::Subscription, make_handler(f))
    }

    fn insert(&mut self, name: String, kind: ProcedureKind, handler: ProcedureFn) -> &mut Self {
        if self
            .procedures
            .insert(name.clone(), Procedure { kind, handler })
            .is_some()
        {
            warn!(procedure = %name, "Replaced an existing procedure registration");
        }
        info!(procedure = %name, kind = %kind, "Registered procedure");
        self
    }

    pub fn get(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

/// Box a typed async closure into a [`ProcedureFn`].
///
/// Input that does not decode into `I` is rejected as a bad request before the
/// closure runs.
fn make_handler<I, O, F, Fut>(f: F) -> ProcedureFn
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(InstanceContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ProcedureError>> + Send + 'static,
{
    Arc::new(move |ctx: InstanceContext, raw: Value| -> ProcedureFuture {
        let input = match serde_json::from_value::<I>(raw) {
            Ok(input) => input,
            Err(e) => {
                let err = ProcedureError::bad_request(format!("invalid input: {e}"));
                return Box::pin(async move { Err::<Value, _>(err) });
            }
        };
        let fut = f(ctx, input);
        Box::pin(async move {
            let output = fut.await?;
            serde_json::to_value(output).map_err(ProcedureError::from)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::executor::InstanceKey;
    use crate::internal::{FanoutEvent, FanoutStatus, FanoutTransport};
    use crate::ids::ShardId;
    use crate::storage::MemoryStore;
    use serde_json::json;

    struct NoShards;

    #[async_trait::async_trait]
    impl FanoutTransport for NoShards {
        async fn push(&self, _shard: &ShardId, _event: &FanoutEvent) -> FanoutStatus {
            FanoutStatus::NotFound
        }
    }

    fn ctx() -> InstanceContext {
        InstanceContext::new(
            InstanceKey::new("DO_TEST", "t"),
            Arc::new(MemoryStore::new()),
            Arc::new(NoShards),
        )
    }

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_typed_query_round_trip() {
        let mut table = ProcedureTable::new();
        table.query("add", |_ctx, input: Add| async move {
            Ok::<_, ProcedureError>(input.a + input.b)
        });

        let procedure = table.get("add").unwrap();
        assert_eq!(procedure.kind(), ProcedureKind::Query);
        let out = procedure.invoke(ctx(), json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_bad_input_is_bad_request() {
        let mut table = ProcedureTable::new();
        table.query("add", |_ctx, input: Add| async move {
            Ok::<_, ProcedureError>(input.a + input.b)
        });

        let err = table
            .get("add")
            .unwrap()
            .invoke(ctx(), json!({"a": "two"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_subscription_output_shape() {
        let mut table = ProcedureTable::new();
        table.subscription("ticks", |_ctx, _input: Value| async move {
            Ok::<_, ProcedureError>(Subscribed::new("ticks", 0))
        });

        let out = table.get("ticks").unwrap().invoke(ctx(), Value::Null).await.unwrap();
        assert_eq!(out, json!({"topic": "ticks", "initial": 0}));
    }

    #[test]
    fn test_registration_replaces_by_name() {
        let mut table = ProcedureTable::new();
        table
            .query("get", |_ctx, _input: Value| async move { Ok::<_, ProcedureError>(1) })
            .mutation("get", |_ctx, _input: Value| async move { Ok::<_, ProcedureError>(2) });
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("get").unwrap().kind(), ProcedureKind::Mutation);
    }
}
