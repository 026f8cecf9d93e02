use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::job::TargetRunner;

/// A connected worker. Lives only as long as its registration stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    /// Only accept jobs explicitly targeted at this runner's id.
    #[serde(default)]
    pub by_id_only: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Runner {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            by_id_only: false,
            labels: BTreeMap::new(),
        }
    }

    pub fn by_id_only(id: impl Into<String>) -> Self {
        Self {
            by_id_only: true,
            ..Self::new(id)
        }
    }

    /// Whether a config var or job targeted at `target` applies to this runner.
    pub fn matches(&self, target: &TargetRunner) -> bool {
        match target {
            TargetRunner::Any => true,
            TargetRunner::Id(id) => *id == self.id,
        }
    }
}

/// A configuration variable pushed to runners over their config stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub target: TargetRunner,
}

impl ConfigVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            target: TargetRunner::Any,
        }
    }
}
