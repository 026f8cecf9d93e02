pub mod config_vars;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::errors::DispatchError;
use crate::models::Runner;

pub use config_vars::ConfigStore;

/// Connected runners. Nothing here is persisted: a runner exists only while
/// its config stream is open.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, Registered>>,
    next_generation: AtomicU64,
}

struct Registered {
    runner: Runner,
    generation: u64,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner, replacing any previous record with the same id.
    /// Returns the generation of the new record, for [`Self::delete_generation`].
    pub fn create(&self, runner: Runner) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Runner '{}' registered (by_id_only: {}, generation: {})",
            runner.id,
            runner.by_id_only,
            generation
        );
        self.runners
            .write()
            .insert(runner.id.clone(), Registered { runner, generation });
        generation
    }

    /// Remove a runner. Jobs already assigned to it are unaffected.
    pub fn delete(&self, id: &str) {
        if self.runners.write().remove(id).is_some() {
            tracing::info!("Runner '{}' deregistered", id);
        }
    }

    /// Remove a runner only if its record is still the one registered as
    /// `generation`. A reconnect that replaced it is left alone.
    pub fn delete_generation(&self, id: &str, generation: u64) {
        let mut runners = self.runners.write();
        match runners.get(id) {
            Some(current) if current.generation == generation => {
                runners.remove(id);
                tracing::info!("Runner '{}' deregistered", id);
            }
            Some(_) => {
                tracing::debug!(
                    "Runner '{}' generation {} already replaced, keeping the newer registration",
                    id,
                    generation
                );
            }
            None => {}
        }
    }

    pub fn get_by_id(&self, id: &str) -> Result<Runner, DispatchError> {
        self.runners
            .read()
            .get(id)
            .map(|r| r.runner.clone())
            .ok_or_else(|| DispatchError::NotFound(format!("runner '{}' not found", id)))
    }

    pub fn is_empty(&self) -> bool {
        self.runners.read().is_empty()
    }

    /// Whether any registered runner accepts jobs targeted at any runner.
    pub fn any_accepts_untargeted(&self) -> bool {
        self.runners.read().values().any(|r| !r.runner.by_id_only)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.runners.read().contains_key(id)
    }

    pub fn list(&self) -> Vec<Runner> {
        let mut runners: Vec<Runner> = self
            .runners
            .read()
            .values()
            .map(|r| r.runner.clone())
            .collect();
        runners.sort_by(|a, b| a.id.cmp(&b.id));
        runners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_delete() {
        let registry = RunnerRegistry::new();
        assert!(registry.is_empty());

        registry.create(Runner::new("r1"));
        assert!(!registry.is_empty());
        assert_eq!(registry.get_by_id("r1").expect("exists").id, "r1");

        registry.delete("r1");
        assert!(registry.is_empty());
        let err = registry.get_by_id("r1").unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));

        // deleting twice is fine
        registry.delete("r1");
    }

    #[test]
    fn test_create_replaces_existing() {
        let registry = RunnerRegistry::new();
        registry.create(Runner::new("r1"));
        registry.create(Runner::by_id_only("r1"));
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get_by_id("r1").expect("exists").by_id_only);
    }

    #[test]
    fn test_delete_generation_keeps_newer_registration() {
        let registry = RunnerRegistry::new();
        let first = registry.create(Runner::new("r1"));
        let second = registry.create(Runner::by_id_only("r1"));
        assert_ne!(first, second);

        // the first connection going away must not remove the second
        registry.delete_generation("r1", first);
        assert!(registry.get_by_id("r1").expect("still registered").by_id_only);

        registry.delete_generation("r1", second);
        assert!(registry.is_empty());

        // unknown ids are ignored
        registry.delete_generation("r1", second);
    }

    #[test]
    fn test_any_accepts_untargeted() {
        let registry = RunnerRegistry::new();
        assert!(!registry.any_accepts_untargeted());

        registry.create(Runner::by_id_only("pinned"));
        assert!(!registry.any_accepts_untargeted());
        assert!(registry.contains("pinned"));

        registry.create(Runner::new("general"));
        assert!(registry.any_accepts_untargeted());
    }

    #[test]
    fn test_list_sorted_by_id() {
        let registry = RunnerRegistry::new();
        registry.create(Runner::new("b"));
        registry.create(Runner::new("a"));
        let ids: Vec<String> = registry.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
