use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::ids::ShardId;
use crate::internal::{FanoutEvent, FanoutStatus, FanoutTransport};
use crate::shard::ConnectionShard;

/// Live shards of this process, addressed by id.
///
/// This is the push endpoint executor instances fan out through: a shard
/// that is no longer listed answers [`FanoutStatus::NotFound`].
#[derive(Debug, Default)]
pub struct ShardDirectory {
    shards: DashMap<ShardId, Arc<ConnectionShard>, ahash::RandomState>,
}

impl ShardDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, shard: Arc<ConnectionShard>) {
        debug!(shard_id = %shard.id(), "Shard listed");
        self.shards.insert(shard.id().clone(), shard);
    }

    pub fn remove(&self, id: &ShardId) -> Option<Arc<ConnectionShard>> {
        let removed = self.shards.remove(id).map(|(_, shard)| shard);
        if removed.is_some() {
            debug!(shard_id = %id, "Shard delisted");
        }
        removed
    }

    pub fn get(&self, id: &ShardId) -> Option<Arc<ConnectionShard>> {
        self.shards.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &ShardId) -> bool {
        self.shards.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[async_trait]
impl FanoutTransport for ShardDirectory {
    async fn push(&self, shard: &ShardId, event: &FanoutEvent) -> FanoutStatus {
        match self.get(shard) {
            Some(target) => target.receive_fanout(event),
            None => {
                debug!(shard_id = %shard, topic = %event.topic, "Fanout to unknown shard");
                FanoutStatus::NotFound
            }
        }
    }
}
