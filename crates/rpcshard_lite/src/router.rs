use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::envelope::ProcedureKind;
use crate::error::RouteError;
use crate::executor::{ExecutorCatalog, InstanceResolver};
use crate::ids::ShardId;
use crate::internal::{ForwardedCall, SubscriptionHandshake};
use crate::path::ProcedurePath;

/// Derives the instance name a call is addressed to from its raw input.
pub trait AddressingExtractor: Send + Sync {
    /// Name of the input field the extractor reads.
    fn field(&self) -> &str;

    fn extract(&self, namespace: &str, input: &Value) -> Result<String, RouteError>;
}

/// Reads a required, non-empty string field from an object input.
#[derive(Debug, Clone)]
pub struct FieldAddressing {
    field: String,
}

impl FieldAddressing {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl AddressingExtractor for FieldAddressing {
    fn field(&self) -> &str {
        &self.field
    }

    fn extract(&self, namespace: &str, input: &Value) -> Result<String, RouteError> {
        match input.get(&self.field).and_then(Value::as_str) {
            Some(name) if !name.is_empty() => Ok(name.to_owned()),
            _ => Err(RouteError::MissingAddressing {
                namespace: namespace.to_owned(),
                field: self.field.clone(),
            }),
        }
    }
}

/// Turns a client call into a forwarded call against a named instance.
pub struct ExecutorRouter {
    catalog: Arc<ExecutorCatalog>,
    resolver: Arc<dyn InstanceResolver>,
}

impl ExecutorRouter {
    pub fn new(catalog: Arc<ExecutorCatalog>, resolver: Arc<dyn InstanceResolver>) -> Self {
        Self { catalog, resolver }
    }

    /// Route one call arriving on shard `origin` and return the instance's
    /// result.
    ///
    /// Path and addressing are validated before any instance is resolved.
    pub async fn route(
        &self,
        path: &str,
        kind: ProcedureKind,
        input: Value,
        origin: &ShardId,
    ) -> Result<Value, RouteError> {
        let path = ProcedurePath::parse(path)?;
        let definition = self
            .catalog
            .get(path.namespace())
            .ok_or_else(|| RouteError::UnknownNamespace(path.namespace().to_owned()))?;
        let name = definition.addressing().extract(path.namespace(), &input)?;

        let instance = self.resolver.resolve(path.namespace(), &name)?;
        debug!(
            path = %path.full_path(),
            instance = %instance.key(),
            kind = %kind,
            "Forwarding call"
        );

        let reply = instance
            .call(ForwardedCall {
                path: path.procedure().to_owned(),
                kind,
                input,
                origin_shard_id: origin.clone(),
                name,
            })
            .await?;

        reply.into_result().map_err(|e| RouteError::Remote {
            code: e.code,
            message: e.message,
        })
    }

    /// Route a subscription call on behalf of `origin` and decode the
    /// handshake it returns.
    pub async fn subscribe(
        &self,
        path: &str,
        input: Value,
        origin: &ShardId,
    ) -> Result<SubscriptionHandshake, RouteError> {
        let data = self
            .route(path, ProcedureKind::Subscription, input, origin)
            .await?;
        serde_json::from_value(data).map_err(RouteError::Handshake)
    }
}
