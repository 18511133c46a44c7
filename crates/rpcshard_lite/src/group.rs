//! Locality groups of connection shards.
//!
//! A [`ShardGroup`] hands each new connection a slot on a member shard with
//! spare capacity, creating a shard when every member is full. The slot is
//! held by a [`ShardLease`] and released when the lease is dropped.

use bon::Builder;
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::error::GroupError;
use crate::ids::{ConnectionId, ShardId};
use crate::router::ExecutorRouter;
use crate::shard::{ConnectionShard, ShardDirectory};

pub const DEFAULT_SHARD_CAPACITY: usize = 1000;

/// Configuration shared by every group of a gateway.
#[derive(Debug, Clone, Builder)]
pub struct GroupConfig {
    /// Maximum connections per shard. Values below 1 are treated as 1.
    #[builder(default = DEFAULT_SHARD_CAPACITY)]
    pub capacity: usize,

    /// Drop a shard from its group (and from the shard directory) once its
    /// last connection is released.
    #[builder(default = true)]
    pub retire_empty_shards: bool,

    /// Live shards this process may hold across all groups. Connections that
    /// would need another shard are refused. Unlimited when unset.
    pub max_shards: Option<usize>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Creates and retires shards on behalf of groups.
pub trait ShardFactory: Send + Sync {
    fn create(&self) -> Result<Arc<ConnectionShard>, GroupError>;

    fn retire(&self, shard: &ShardId);
}

/// Creates in-process shards and lists them in a [`ShardDirectory`].
pub struct LocalShardFactory {
    router: Arc<ExecutorRouter>,
    directory: Arc<ShardDirectory>,
    max_shards: Option<usize>,
}

impl LocalShardFactory {
    pub fn new(router: Arc<ExecutorRouter>, directory: Arc<ShardDirectory>) -> Self {
        Self {
            router,
            directory,
            max_shards: None,
        }
    }

    /// Refuse to create shards beyond `max` live ones.
    pub fn with_max_shards(mut self, max: usize) -> Self {
        self.max_shards = Some(max);
        self
    }
}

impl ShardFactory for LocalShardFactory {
    fn create(&self) -> Result<Arc<ConnectionShard>, GroupError> {
        if let Some(max) = self.max_shards {
            if self.directory.len() >= max {
                return Err(GroupError::ShardCreate(format!("shard limit of {max} reached")));
            }
        }
        let shard = Arc::new(ConnectionShard::new(
            ShardId::generate(),
            Arc::clone(&self.router),
        ));
        self.directory.insert(Arc::clone(&shard));
        Ok(shard)
    }

    fn retire(&self, shard: &ShardId) {
        self.directory.remove(shard);
    }
}

struct Member {
    shard: Arc<ConnectionShard>,
    count: usize,
}

/// Membership coordinator for one locality key.
pub struct ShardGroup {
    key: String,
    config: GroupConfig,
    factory: Arc<dyn ShardFactory>,
    members: Mutex<Vec<Member>>,
}

impl ShardGroup {
    pub fn new(key: impl Into<String>, config: GroupConfig, factory: Arc<dyn ShardFactory>) -> Self {
        Self {
            key: key.into(),
            config,
            factory,
            members: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity.max(1)
    }

    fn members_lock(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot for `connection_id` on a member with spare capacity.
    ///
    /// Selection and the count increment happen under one lock, so
    /// concurrent assignments never push a member past capacity. If shard
    /// creation fails no membership state changes.
    pub fn assign(self: &Arc<Self>, connection_id: ConnectionId) -> Result<ShardLease, GroupError> {
        let capacity = self.capacity();
        let mut members = self.members_lock();

        let shard = match members.iter_mut().find(|m| m.count < capacity) {
            Some(member) => {
                member.count += 1;
                Arc::clone(&member.shard)
            }
            None => {
                let shard = self.factory.create()?;
                info!(
                    group = %self.key,
                    shard_id = %shard.id(),
                    members = members.len() + 1,
                    "Created shard"
                );
                members.push(Member {
                    shard: Arc::clone(&shard),
                    count: 1,
                });
                shard
            }
        };

        debug!(
            group = %self.key,
            shard_id = %shard.id(),
            connection_id = %connection_id,
            "Assigned connection"
        );
        Ok(ShardLease {
            group: Arc::clone(self),
            shard,
            connection_id,
        })
    }

    fn release(&self, shard_id: &ShardId) {
        let mut members = self.members_lock();
        let Some(pos) = members.iter().position(|m| m.shard.id() == shard_id) else {
            return;
        };

        let member = &mut members[pos];
        member.count = member.count.saturating_sub(1);
        if member.count == 0 && self.config.retire_empty_shards {
            members.remove(pos);
            self.factory.retire(shard_id);
            info!(group = %self.key, shard_id = %shard_id, "Retired empty shard");
        }
    }

    /// `(shard id, connection count)` of every member.
    pub fn members(&self) -> Vec<(ShardId, usize)> {
        self.members_lock()
            .iter()
            .map(|m| (m.shard.id().clone(), m.count))
            .collect()
    }

    pub fn connection_count(&self, shard_id: &ShardId) -> Option<usize> {
        self.members_lock()
            .iter()
            .find(|m| m.shard.id() == shard_id)
            .map(|m| m.count)
    }

    pub fn len(&self) -> usize {
        self.members_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members_lock().is_empty()
    }
}

impl fmt::Debug for ShardGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardGroup")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish()
    }
}

/// A connection's slot on a shard. Dropping it releases the slot.
pub struct ShardLease {
    group: Arc<ShardGroup>,
    shard: Arc<ConnectionShard>,
    connection_id: ConnectionId,
}

impl ShardLease {
    pub fn shard(&self) -> &Arc<ConnectionShard> {
        &self.shard
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn group_key(&self) -> &str {
        self.group.key()
    }
}

impl Drop for ShardLease {
    fn drop(&mut self) {
        self.group.release(self.shard.id());
    }
}

impl fmt::Debug for ShardLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardLease")
            .field("group", &self.group.key())
            .field("shard_id", self.shard.id())
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// All groups of a gateway, created on first use of their key.
pub struct GroupDirectory {
    config: GroupConfig,
    factory: Arc<dyn ShardFactory>,
    groups: DashMap<String, Arc<ShardGroup>, ahash::RandomState>,
}

impl GroupDirectory {
    pub fn new(config: GroupConfig, factory: Arc<dyn ShardFactory>) -> Self {
        Self {
            config,
            factory,
            groups: DashMap::default(),
        }
    }

    pub fn group(&self, key: &str) -> Arc<ShardGroup> {
        if let Some(group) = self.groups.get(key) {
            return Arc::clone(group.value());
        }
        let group = self.groups.entry(key.to_owned()).or_insert_with(|| {
            info!(group = %key, "Created group");
            Arc::new(ShardGroup::new(
                key,
                self.config.clone(),
                Arc::clone(&self.factory),
            ))
        });
        Arc::clone(group.value())
    }

    pub fn assign(&self, key: &str, connection_id: ConnectionId) -> Result<ShardLease, GroupError> {
        self.group(key).assign(connection_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
