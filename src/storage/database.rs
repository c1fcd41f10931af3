use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::{Result, StoreError};
use crate::storage::container::Container;

/// Handle to a set of named containers.
///
/// Constructed explicitly and passed to whatever needs it; there is no
/// ambient global instance. Cloning shares the underlying catalog.
#[derive(Clone, Default)]
pub struct DocumentStore {
    containers: Arc<RwLock<HashMap<String, Container>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a container partitioned by the given document path
    /// (e.g. `/sessionId`). Fails if the name is taken.
    pub async fn create_container(
        &self,
        name: &str,
        partition_key_path: &str,
    ) -> Result<Container> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(name) {
            return Err(StoreError::ContainerExists(name.to_string()));
        }
        let container = Container::new(name, partition_key_path);
        containers.insert(name.to_string(), container.clone());
        Ok(container)
    }

    /// Create-if-missing variant for process start-up paths that race.
    pub async fn create_container_if_not_exists(
        &self,
        name: &str,
        partition_key_path: &str,
    ) -> Result<Container> {
        match self.create_container(name, partition_key_path).await {
            Ok(container) => Ok(container),
            Err(StoreError::ContainerExists(_)) => self.container(name).await,
            Err(err) => Err(err),
        }
    }

    /// Look up an existing container.
    pub async fn container(&self, name: &str) -> Result<Container> {
        let containers = self.containers.read().await;
        containers
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::ContainerNotFound(name.to_string()))
    }

    pub async fn container_names(&self) -> Vec<String> {
        let containers = self.containers.read().await;
        containers.keys().cloned().collect()
    }
}
