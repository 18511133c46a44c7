//! Messages exchanged between shards, the router and executor instances.
//!
//! These mirror the internal HTTP contracts of a multi-process deployment:
//! `POST /rpc-internal` carries a [`ForwardedCall`] and answers with a
//! [`ForwardedReply`]; `POST /fanout-internal` carries a [`FanoutEvent`] and
//! answers with a [`FanoutStatus`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ProcedureKind;
use crate::error::{ErrorCode, ProcedureError};
use crate::ids::ShardId;

/// A procedure invocation forwarded to a named executor instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedCall {
    /// Procedure path with the executor namespace stripped.
    pub path: String,
    pub kind: ProcedureKind,
    #[serde(default)]
    pub input: Value,
    /// Shard the call came in on. Subscriptions register this shard.
    pub origin_shard_id: ShardId,
    /// Addressing name the instance was resolved by.
    pub name: String,
}

/// Failure reported by an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<ProcedureError> for RemoteError {
    fn from(err: ProcedureError) -> Self {
        Self {
            code: err.code,
            message: err.message,
        }
    }
}

/// Reply to a [`ForwardedCall`]: `{ok: true, data}` or `{ok: false, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ForwardedReply {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: RemoteError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        Err(self.error.unwrap_or_else(|| RemoteError {
            code: ErrorCode::InternalError,
            message: "instance reported a failure without details".into(),
        }))
    }
}

/// What a subscription call returns to the shard that issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionHandshake {
    /// Topic namespaced as `<kind>|<name>|<topic>`.
    pub topic: String,
    /// First value delivered to the subscriber.
    pub message: Value,
}

/// One message pushed from an instance to a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEvent {
    pub topic: String,
    pub message: Value,
}

/// Outcome of pushing a [`FanoutEvent`] to one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutStatus {
    /// Delivered to this many local subscribers. Zero means the shard is
    /// still completing a subscription handshake and keeps its registration.
    Delivered(usize),
    /// The shard is gone or has no local subscriber for the topic.
    NotFound,
}

impl FanoutStatus {
    pub fn status_code(self) -> u16 {
        match self {
            FanoutStatus::Delivered(_) => 204,
            FanoutStatus::NotFound => 404,
        }
    }
}

/// Push endpoint of the shards, as seen from executor instances.
#[async_trait]
pub trait FanoutTransport: Send + Sync {
    async fn push(&self, shard: &ShardId, event: &FanoutEvent) -> FanoutStatus;
}
