use super::activity::Activity;
use crate::error::PipeResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Completed lineage of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Root activity of the run
    pub run: Activity,
    /// Module activities in temporal order
    pub activities: Vec<Activity>,
}

impl ProvenanceRecord {
    /// Pretty-printed JSON
    pub fn to_json(&self) -> PipeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> PipeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Activities of one module in temporal order
    pub fn activities_for(&self, module: &str) -> Vec<&Activity> {
        self.activities.iter().filter(|a| a.name == module).collect()
    }

    /// Look up the run or a module activity by id
    pub fn activity(&self, id: Uuid) -> Option<&Activity> {
        if self.run.id == id {
            return Some(&self.run);
        }
        self.activities.iter().find(|a| a.id == id)
    }

    /// Activity that produced the latest revision of `key`
    pub fn last_producer(&self, key: &str) -> Option<&Activity> {
        self.activities.iter().rev().find(|a| a.produced(key))
    }

    /// Number of module activities
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}
