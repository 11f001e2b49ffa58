//! In-memory cache of known containers.

use std::collections::HashMap;
use std::sync::Arc;

use ocishim_shared::errors::{ShimError, ShimResult};
use parking_lot::Mutex;

use crate::container::Container;

/// Thread-safe map from container id to container.
///
/// The on-disk store stays authoritative; this only caches `Arc` handles so
/// repeated lookups return the same process records. The lock is held for
/// the map mutation only.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, Arc<Container>>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("containers", &self.inner.lock().len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a new container.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the id is already cached.
    pub fn insert(&self, container: Arc<Container>) -> ShimResult<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(container.id()) {
            return Err(ShimError::AlreadyExists(format!(
                "container {} already exists",
                container.id()
            )));
        }
        tracing::trace!(container_id = %container.id(), "Registering container");
        inner.insert(container.id().to_string(), container);
        Ok(())
    }

    /// Cache a container rebuilt from disk, or return the one already cached.
    pub fn insert_or_get(&self, container: Arc<Container>) -> Arc<Container> {
        let mut inner = self.inner.lock();
        inner
            .entry(container.id().to_string())
            .or_insert_with(|| {
                tracing::trace!(container_id = %container.id(), "Registering recovered container");
                container
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.inner.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Container>> {
        let removed = self.inner.lock().remove(id);
        if removed.is_some() {
            tracing::trace!(container_id = %id, "Unregistered container");
        }
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
