//! # rpcshard_lite
//!
//! A sharded real-time RPC gateway over WebSocket.
//!
//! Clients send `query`, `mutation` and `subscription` calls addressed by a
//! dotted path (`Namespace.procedure`). Each call is routed to a stateful
//! executor instance picked by a name carried in the call's input. Executors
//! publish events once and every subscribed connection receives them, no
//! matter which shard it lives on.
//!
//! ## Executors
//!
//! An executor kind declares its addressing field and a typed procedure
//! table once at startup:
//!
//! ```ignore
//! use rpcshard_lite::{ExecutorCatalog, ExecutorDefinition, FieldAddressing, ProcedureTable, Subscribed};
//!
//! let mut procedures = ProcedureTable::new();
//! procedures
//!     .mutation("inc", |ctx, input: Amount| async move {
//!         let value = ctx.storage().load::<i64>("counter").await?.unwrap_or(0) + input.amount;
//!         ctx.storage().save("counter", &value).await?;
//!         ctx.emit("count", value.into()).await?;
//!         Ok(value)
//!     })
//!     .subscription("count", |ctx, _input: serde_json::Value| async move {
//!         let value = ctx.storage().load::<i64>("counter").await?.unwrap_or(0);
//!         Ok(Subscribed::new("count", value))
//!     });
//!
//! let mut catalog = ExecutorCatalog::new();
//! catalog.register(ExecutorDefinition::new(
//!     "DO_COUNTER",
//!     FieldAddressing::new("_namespace"),
//!     procedures,
//! ));
//! ```
//!
//! ## Gateway
//!
//! ```ignore
//! use rpcshard_lite::{GatewayConfig, Node};
//!
//! let node = Node::new(GatewayConfig::builder().rpc_path("/rpc").build(), catalog);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8787").await?;
//! node.gateway().serve(listener).await?;
//! ```
//!
//! ## Topics
//!
//! A subscription procedure names a topic local to its instance. Shards see
//! it namespaced as `{kind}|{name}|{topic}`, e.g. `DO_COUNTER|team1|count`.
//! Instances remember which shards subscribed under `_topic/{topic}` in
//! their own storage and prune shards that stop answering.

pub mod envelope;
pub mod executor;
pub mod gateway;
pub mod group;
pub mod internal;
pub mod procedure;
pub mod router;
pub mod shard;
pub mod storage;

mod error;
mod ids;
mod node;
mod path;

pub use envelope::{
    ErrorShape, ProcedureKind, Request, RequestEnvelope, RequestId, ResponseEnvelope,
    ResultPayload, decode_frame,
};
pub use error::{
    EnvelopeError, ErrorCode, GatewayError, GroupError, InstanceError, OutboundError, PathError,
    ProcedureError, RouteError, StorageError,
};
pub use executor::{
    EmitReport, ExecutorAdapter, ExecutorCatalog, ExecutorDefinition, InstanceContext,
    InstanceHandle, InstanceKey, InstanceRegistry, InstanceResolver,
};
pub use gateway::{Gateway, GatewayConfig};
pub use group::{GroupConfig, GroupDirectory, ShardGroup, ShardLease};
pub use ids::{ConnectionId, ShardId};
pub use internal::{FanoutEvent, FanoutStatus, ForwardedCall, ForwardedReply};
pub use node::Node;
pub use path::ProcedurePath;
pub use procedure::{ProcedureTable, Subscribed};
pub use router::{AddressingExtractor, ExecutorRouter, FieldAddressing};
pub use shard::{ConnectionOutbound, ConnectionShard, ShardDirectory};
pub use storage::{KvStore, MemoryStorageProvider, MemoryStore, StorageProvider};
