//! Indexed store of storage classes.
//!
//! Read-mostly: classification reads it on every claim event, the class
//! watcher writes on adds, updates, deletes and resync ticks.

use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::storage::v1::StorageClass;
use tracing::warn;

/// Thread-safe mapping from class name to the latest class object.
#[derive(Default)]
pub struct ClassCache {
    inner: RwLock<HashMap<String, StorageClass>>,
}

impl ClassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a class, keyed by its name.
    pub fn add(&self, class: StorageClass) {
        let Some(name) = class.metadata.name.clone() else {
            warn!("ignoring storage class without a name");
            return;
        };
        self.inner.write().unwrap().insert(name, class);
    }

    /// Alias of [`add`]; the informer callbacks distinguish adds from
    /// updates but the cache treats them the same.
    ///
    /// [`add`]: ClassCache::add
    pub fn update(&self, class: StorageClass) {
        self.add(class);
    }

    pub fn delete(&self, name: &str) {
        self.inner.write().unwrap().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<StorageClass> {
        self.inner.read().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<StorageClass> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}
