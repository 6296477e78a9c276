//! Generation naming and stale-generation cleanup.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use super::storage::ResourceStore;

/// Opaque, build-time version identifier for a cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(String);

impl Generation {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Generation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Outcome of purging stale generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
  pub deleted: Vec<Generation>,
  /// Generations that could not be deleted and are left behind
  pub failed: Vec<Generation>,
}

/// Creates generation namespaces and removes the ones that are no longer current.
#[derive(Clone)]
pub struct GenerationManager {
  store: Arc<dyn ResourceStore>,
}

impl GenerationManager {
  pub fn new(store: Arc<dyn ResourceStore>) -> Self {
    Self { store }
  }

  /// Create the namespace for an installing generation.
  ///
  /// Failure here is fatal to install.
  pub fn instantiate(&self, generation: &Generation) -> Result<()> {
    self.store.open_generation(generation)
  }

  /// Record that a generation finished installing and took control.
  pub fn mark_active(&self, generation: &Generation) -> Result<()> {
    self.store.mark_active(generation)
  }

  /// Whether a generation completed activation, in this run or an earlier one.
  /// A namespace left by an interrupted install does not count.
  pub fn is_active(&self, generation: &Generation) -> Result<bool> {
    Ok(self.store.active_generations()?.contains(generation))
  }

  /// The most recently activated generation.
  pub fn latest_active(&self) -> Result<Option<Generation>> {
    Ok(self.store.active_generations()?.pop())
  }

  /// Delete every generation other than `current`.
  ///
  /// Individual deletion failures are logged and leave the generation behind;
  /// only a failure to enumerate generations is returned as an error.
  pub fn purge_stale(&self, current: &Generation) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();

    for generation in self.store.list_generations()? {
      if &generation == current {
        continue;
      }

      match self.store.delete_generation(&generation) {
        Ok(()) => {
          info!(%generation, "deleted stale generation");
          report.deleted.push(generation);
        }
        Err(e) => {
          warn!(%generation, error = %e, "failed to delete stale generation");
          report.failed.push(generation);
        }
      }
    }

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{EntryInfo, SqliteStorage};
  use crate::cache::traits::{RequestKey, Snapshot};
  use color_eyre::eyre::eyre;

  #[test]
  fn test_purge_keeps_only_current() {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    for id in ["v1", "v2", "v3"] {
      store.open_generation(&Generation::new(id)).unwrap();
    }
    let manager = GenerationManager::new(store.clone());

    let report = manager.purge_stale(&Generation::new("v3")).unwrap();

    assert_eq!(
      report.deleted,
      vec![Generation::new("v1"), Generation::new("v2")]
    );
    assert!(report.failed.is_empty());
    assert_eq!(
      store.list_generations().unwrap(),
      vec![Generation::new("v3")]
    );
  }

  #[test]
  fn test_purge_with_nothing_stale() {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = GenerationManager::new(store);
    let report = manager.purge_stale(&Generation::new("v1")).unwrap();
    assert_eq!(report, PurgeReport::default());
  }

  #[test]
  fn test_interrupted_install_is_not_active() {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = GenerationManager::new(store.clone());
    let v1 = Generation::new("v1");
    let v2 = Generation::new("v2");

    manager.instantiate(&v1).unwrap();
    manager.mark_active(&v1).unwrap();
    manager.instantiate(&v2).unwrap();

    assert!(manager.is_active(&v1).unwrap());
    assert!(!manager.is_active(&v2).unwrap());
    assert_eq!(manager.latest_active().unwrap(), Some(v1));
  }

  /// Store whose deletes fail for one generation.
  struct StickyStore {
    inner: SqliteStorage,
    sticky: Generation,
  }

  impl ResourceStore for StickyStore {
    fn open_generation(&self, generation: &Generation) -> Result<()> {
      self.inner.open_generation(generation)
    }
    fn put(&self, generation: &Generation, key: &RequestKey, snapshot: &Snapshot) -> Result<bool> {
      self.inner.put(generation, key, snapshot)
    }
    fn get(&self, generation: &Generation, key: &RequestKey) -> Result<Option<Snapshot>> {
      self.inner.get(generation, key)
    }
    fn delete_generation(&self, generation: &Generation) -> Result<()> {
      if generation == &self.sticky {
        return Err(eyre!("disk is read-only"));
      }
      self.inner.delete_generation(generation)
    }
    fn list_generations(&self) -> Result<Vec<Generation>> {
      self.inner.list_generations()
    }
    fn mark_active(&self, generation: &Generation) -> Result<()> {
      self.inner.mark_active(generation)
    }
    fn active_generations(&self) -> Result<Vec<Generation>> {
      self.inner.active_generations()
    }
    fn entries(&self, generation: &Generation) -> Result<Vec<EntryInfo>> {
      self.inner.entries(generation)
    }
  }

  #[test]
  fn test_failed_delete_does_not_stop_purge() {
    let store = StickyStore {
      inner: SqliteStorage::open_in_memory().unwrap(),
      sticky: Generation::new("v1"),
    };
    for id in ["v1", "v2", "v3"] {
      store.open_generation(&Generation::new(id)).unwrap();
    }
    let manager = GenerationManager::new(Arc::new(store));

    let report = manager.purge_stale(&Generation::new("v3")).unwrap();

    assert_eq!(report.deleted, vec![Generation::new("v2")]);
    assert_eq!(report.failed, vec![Generation::new("v1")]);
  }
}
