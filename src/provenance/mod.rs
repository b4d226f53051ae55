//! Lineage recording
//!
//! The recorder opens one run activity per pipeline and one child activity
//! for every module invocation. Blob entries get a UUID when first produced,
//! keep it across overwrites (bumping the revision) and lose it when the key
//! leaves the blob. Modules add the files they touch through a
//! [`ProvenanceHandle`].

mod activity;
mod export;
mod handle;
mod record;
mod recorder;

pub use activity::{Activity, ActivityKind, ActivityStatus, EntryRef, Resource};
pub use export::{ExportPolicy, JsonFileExporter, ProvenanceExporter};
pub use handle::ProvenanceHandle;
pub use record::ProvenanceRecord;
pub use recorder::{PendingActivity, ProvenanceRecorder};
