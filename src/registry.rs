//! Named store of collector instances

use crate::collector::SharedCollector;
use crate::error::ManagerError;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of collectors keyed by their unique name
///
/// Every mutation takes the write lock. Readers only hold the read lock long
/// enough to clone the `Arc` handles they need, so a slow `collect()` never
/// blocks a mutation.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: RwLock<HashMap<String, SharedCollector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector under its own name
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::DuplicateName` if the name is taken; the
    /// registry is left unchanged.
    pub async fn add(&self, collector: SharedCollector) -> Result<(), ManagerError> {
        let name = collector.name().to_string();
        let mut collectors = self.collectors.write().await;
        if collectors.contains_key(&name) {
            return Err(ManagerError::DuplicateName(name));
        }
        debug!("Registering collector {}", name);
        collectors.insert(name, collector);
        Ok(())
    }

    /// Register a collector, replacing any previous entry with the same name
    ///
    /// Returns the replaced collector, if any.
    pub async fn replace(&self, collector: SharedCollector) -> Option<SharedCollector> {
        let name = collector.name().to_string();
        self.collectors.write().await.insert(name, collector)
    }

    /// Stop a collector and delete it
    ///
    /// # Errors
    ///
    /// `NotFound` if no collector has this name, `StopFailed` if its `stop()`
    /// fails, in which case it stays registered.
    pub async fn remove(&self, name: &str) -> Result<SharedCollector, ManagerError> {
        let mut collectors = self.collectors.write().await;
        let collector = collectors
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        collector.stop().map_err(|source| ManagerError::StopFailed {
            name: name.to_string(),
            source,
        })?;

        info!("Removed collector {}", name);
        collectors
            .remove(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    pub async fn get(&self, name: &str) -> Result<SharedCollector, ManagerError> {
        self.collectors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.collectors.read().await.contains_key(name)
    }

    /// Run `f` only while `collector` is the instance registered as `name`
    ///
    /// The read lock is held across `f`, so a concurrent `remove` completes
    /// either before the check or after `f` returns.
    pub async fn while_registered<R>(
        &self,
        name: &str,
        collector: &SharedCollector,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let collectors = self.collectors.read().await;
        let registered = collectors.get(name)?;
        if Arc::as_ptr(registered) as *const u8 != Arc::as_ptr(collector) as *const u8 {
            return None;
        }
        Some(f())
    }

    /// Snapshot of the whole registry
    pub async fn list(&self) -> HashMap<String, SharedCollector> {
        self.collectors.read().await.clone()
    }

    /// Handles to every collector that is currently enabled
    pub async fn snapshot_enabled(&self) -> Vec<(String, SharedCollector)> {
        self.collectors
            .read()
            .await
            .iter()
            .filter(|(_, collector)| collector.is_enabled())
            .map(|(name, collector)| (name.clone(), collector.clone()))
            .collect()
    }

    /// Enable a collector
    ///
    /// Also returns whether it was already enabled before the call.
    pub async fn enable(&self, name: &str) -> Result<(SharedCollector, bool), ManagerError> {
        self.set_enabled(name, true).await
    }

    /// Disable a collector
    ///
    /// Also returns whether it was enabled before the call.
    pub async fn disable(&self, name: &str) -> Result<(SharedCollector, bool), ManagerError> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(SharedCollector, bool), ManagerError> {
        let collectors = self.collectors.write().await;
        let collector = collectors
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        let was_enabled = collector.is_enabled();
        collector.set_enabled(enabled);
        if was_enabled != enabled {
            info!(
                "Collector {} {}",
                name,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Ok((collector.clone(), was_enabled))
    }

    pub async fn len(&self) -> usize {
        self.collectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.collectors.read().await.is_empty()
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::test_support::TestCollector;
    use quickcheck_macros::quickcheck;
    use std::collections::HashSet;
    use std::sync::Arc;

    // Adding any sequence of names keeps exactly the first instance of each name
    #[quickcheck]
    fn prop_registry_names_unique(names: Vec<u8>) -> bool {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let registry = CollectorRegistry::new();
            let mut seen = HashSet::new();
            for name in &names {
                let name = format!("c{}", name % 16);
                let added = registry
                    .add(Arc::new(TestCollector::new(&name)))
                    .await
                    .is_ok();
                if added != seen.insert(name) {
                    return false;
                }
            }
            registry.len().await == seen.len()
        })
    }
}
