use std::collections::BTreeMap;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::models::{ConfigVar, Runner, TargetRunner};

/// Config vars pushed to runners, keyed by target and name.
pub struct ConfigStore {
    vars: RwLock<BTreeMap<(TargetKey, String), ConfigVar>>,
    revision: watch::Sender<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TargetKey {
    Any,
    Id(String),
}

impl From<&TargetRunner> for TargetKey {
    fn from(target: &TargetRunner) -> Self {
        match target {
            TargetRunner::Any => TargetKey::Any,
            TargetRunner::Id(id) => TargetKey::Id(id.clone()),
        }
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            vars: RwLock::new(BTreeMap::new()),
            revision,
        }
    }

    /// Upsert vars. A var with an empty value is deleted.
    pub fn set(&self, vars: Vec<ConfigVar>) {
        {
            let mut map = self.vars.write();
            for var in vars {
                let key = (TargetKey::from(&var.target), var.name.clone());
                if var.value.is_empty() {
                    map.remove(&key);
                } else {
                    map.insert(key, var);
                }
            }
        }
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Vars that apply to `runner`, sorted by name. A var targeted at the
    /// runner's id wins over an untargeted var with the same name.
    pub fn for_runner(&self, runner: &Runner) -> Vec<ConfigVar> {
        let map = self.vars.read();
        let mut merged: BTreeMap<String, ConfigVar> = BTreeMap::new();
        for ((target, name), var) in map.iter() {
            match target {
                TargetKey::Any => {
                    merged.entry(name.clone()).or_insert_with(|| var.clone());
                }
                TargetKey::Id(id) if *id == runner.id => {
                    merged.insert(name.clone(), var.clone());
                }
                TargetKey::Id(_) => {}
            }
        }
        merged.into_values().collect()
    }

    pub fn list(&self) -> Vec<ConfigVar> {
        self.vars.read().values().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targeted(name: &str, value: &str, id: &str) -> ConfigVar {
        ConfigVar {
            name: name.to_string(),
            value: value.to_string(),
            target: TargetRunner::Id(id.to_string()),
        }
    }

    #[test]
    fn test_for_runner_filters_by_target() {
        let store = ConfigStore::new();
        store.set(vec![
            ConfigVar::new("B", "any-b"),
            ConfigVar::new("A", "any-a"),
            targeted("C", "r1-only", "r1"),
            targeted("D", "r2-only", "r2"),
        ]);

        let names: Vec<String> = store
            .for_runner(&Runner::new("r1"))
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_targeted_var_overrides_any() {
        let store = ConfigStore::new();
        store.set(vec![ConfigVar::new("TOKEN", "shared"), targeted("TOKEN", "mine", "r1")]);

        let r1 = store.for_runner(&Runner::new("r1"));
        assert_eq!(r1.len(), 1);
        assert_eq!(r1[0].value, "mine");

        let r2 = store.for_runner(&Runner::new("r2"));
        assert_eq!(r2[0].value, "shared");
    }

    #[test]
    fn test_empty_value_deletes() {
        let store = ConfigStore::new();
        store.set(vec![ConfigVar::new("A", "1")]);
        store.set(vec![ConfigVar::new("A", "")]);
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn test_set_bumps_revision() {
        let store = ConfigStore::new();
        let mut rx = store.subscribe();
        store.set(vec![ConfigVar::new("A", "1")]);
        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow(), 1);
    }
}
