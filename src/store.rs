//! Deployment store shared by every connection of a server instance.
//!
//! All access goes through single-key operations that are individually
//! atomic; there is no transactional guarantee across keys. Archives are
//! handed out as `Arc` so a running test never holds the map lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::archive::Archive;

/// Concurrent mapping from deployment ID to archive.
#[derive(Debug, Default)]
pub struct DeploymentStore {
    deployments: RwLock<HashMap<String, Arc<Archive>>>,
}

impl DeploymentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `archive` under `id`, returning the archive it replaced.
    pub fn insert(&self, id: impl Into<String>, archive: Archive) -> Option<Arc<Archive>> {
        self.deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), Arc::new(archive))
    }

    /// Remove and return the deployment stored under `id`.
    pub fn remove(&self, id: &str) -> Option<Arc<Archive>> {
        self.deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Shared handle to the deployment stored under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Archive>> {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Whether a deployment exists under `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Number of current deployments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether there are no deployments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of current deployment IDs, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
