//! Versioned holder for the current partition map.

use crate::partition_map::PartitionMap;
use ringkv_common::KvError;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Holds the current partition map. Each logical operation takes one
/// [`snapshot`](Self::snapshot) and routes every call of that operation
/// through it, even if a newer map is installed meanwhile.
#[derive(Debug)]
pub struct PartitionMapProvider<M> {
    current: RwLock<Arc<M>>,
}

impl<M: PartitionMap> PartitionMapProvider<M> {
    pub fn new(map: M) -> Self {
        Self {
            current: RwLock::new(Arc::new(map)),
        }
    }

    pub async fn snapshot(&self) -> Arc<M> {
        self.current.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.current.read().await.version()
    }

    /// Install `map` if it is strictly newer than the current one.
    pub async fn update(&self, map: M) -> Result<(), KvError> {
        let mut current = self.current.write().await;
        let installed = current.version();
        if map.version() <= installed {
            return Err(KvError::VersionTooOld {
                used: map.version(),
                current: installed,
            });
        }
        tracing::info!(
            from = installed,
            to = map.version(),
            "installed new partition map"
        );
        *current = Arc::new(map);
        Ok(())
    }
}
