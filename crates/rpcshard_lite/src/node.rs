use std::sync::Arc;

use crate::executor::{ExecutorCatalog, InstanceRegistry, InstanceResolver};
use crate::gateway::{Gateway, GatewayConfig};
use crate::group::{GroupDirectory, LocalShardFactory};
use crate::router::ExecutorRouter;
use crate::shard::ShardDirectory;
use crate::storage::{MemoryStorageProvider, StorageProvider};

/// One gateway process: shards, executor instances and the wiring between
/// them.
///
/// Instances fan out through the shard directory; shards route through the
/// router, which resolves instances from the registry.
pub struct Node {
    config: GatewayConfig,
    directory: Arc<ShardDirectory>,
    registry: Arc<InstanceRegistry>,
    groups: Arc<GroupDirectory>,
}

impl Node {
    /// Wire a node with in-memory instance storage.
    pub fn new(config: GatewayConfig, catalog: ExecutorCatalog) -> Self {
        Self::with_storage(config, catalog, Arc::new(MemoryStorageProvider::new()))
    }

    pub fn with_storage(
        config: GatewayConfig,
        catalog: ExecutorCatalog,
        storage: Arc<dyn StorageProvider>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let directory = Arc::new(ShardDirectory::new());
        let registry = Arc::new(InstanceRegistry::new(
            Arc::clone(&catalog),
            storage,
            directory.clone(),
        ));
        let router = Arc::new(ExecutorRouter::new(
            catalog,
            Arc::clone(&registry) as Arc<dyn InstanceResolver>,
        ));
        let mut factory = LocalShardFactory::new(router, Arc::clone(&directory));
        if let Some(max) = config.group.max_shards {
            factory = factory.with_max_shards(max);
        }
        let groups = Arc::new(GroupDirectory::new(config.group.clone(), Arc::new(factory)));

        Self {
            config,
            directory,
            registry,
            groups,
        }
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.config.clone(), Arc::clone(&self.groups))
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<ShardDirectory> {
        &self.directory
    }

    pub fn groups(&self) -> &Arc<GroupDirectory> {
        &self.groups
    }
}
