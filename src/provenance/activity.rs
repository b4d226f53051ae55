use crate::system::SystemInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reference to one revision of a blob entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRef {
    /// Stable across overwrites and cycles while the key stays in the blob
    pub id: Uuid,
    pub key: String,
    /// 0 when first produced, bumped by every overwrite
    pub revision: u32,
}

/// Something outside the blob an activity read or wrote, usually a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Run,
    Module,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Running,
    Completed,
    Skipped,
    Stopped,
    Failed,
}

/// One provenance unit: the run itself or one module invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub name: String,
    pub kind: ActivityKind,

    /// Zero-based cycle; `None` for the run activity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    pub children: Vec<Uuid>,

    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    pub inputs: Vec<EntryRef>,
    pub outputs: Vec<EntryRef>,
    pub removed: Vec<EntryRef>,

    /// External resources recorded by the module
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_read: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_written: Vec<Resource>,

    pub status: ActivityStatus,
    pub configuration: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb_start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb_stop: Option<f64>,
}

impl Activity {
    pub(crate) fn new(name: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            cycle: None,
            parent: None,
            children: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            removed: Vec::new(),
            resources_read: Vec::new(),
            resources_written: Vec::new(),
            status: ActivityStatus::Running,
            configuration: Value::Null,
            system: None,
            peak_memory_mb_start: None,
            peak_memory_mb_stop: None,
        }
    }

    pub(crate) fn close(&mut self, status: ActivityStatus, duration: f64) {
        self.finished_at = Some(Utc::now());
        self.duration = Some(duration);
        self.status = status;
    }

    /// Whether this activity produced or overwrote `key`
    pub fn produced(&self, key: &str) -> bool {
        self.outputs.iter().any(|entry| entry.key == key)
    }

    /// Whether this activity saw `key` before it ran
    pub fn consumed(&self, key: &str) -> bool {
        self.inputs.iter().any(|entry| entry.key == key)
    }
}
