use super::activity::{Activity, ActivityKind, ActivityStatus, EntryRef};
use super::handle::{ProvenanceHandle, RecordedResources};
use super::record::ProvenanceRecord;
use crate::logger::NamedLogger;
use crate::pipeline::Blob;
use crate::system::{peak_memory_mb, SystemInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct TrackedEntry {
    id: Uuid,
    revision: u32,
    stamp: u64,
}

impl TrackedEntry {
    fn to_ref(&self, key: &str) -> EntryRef {
        EntryRef {
            id: self.id,
            key: key.to_string(),
            revision: self.revision,
        }
    }
}

/// A module activity between `begin` and `complete`
#[derive(Debug)]
pub struct PendingActivity {
    activity: Activity,
    started: Instant,
}

impl PendingActivity {
    pub fn id(&self) -> Uuid {
        self.activity.id
    }
}

/// Builds the lineage record of a run
///
/// Entries are identified by the write stamps of the blob, so the recorder
/// only ever reads the blob. When disabled every method returns immediately.
pub struct ProvenanceRecorder {
    enabled: bool,
    run: Option<Activity>,
    run_started: Option<Instant>,
    activities: Vec<Activity>,
    entries: HashMap<String, TrackedEntry>,
    resources: Arc<Mutex<RecordedResources>>,
    logger: NamedLogger,
}

impl ProvenanceRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            run: None,
            run_started: None,
            activities: Vec::new(),
            entries: HashMap::new(),
            resources: Arc::new(Mutex::new(RecordedResources::default())),
            logger: NamedLogger::new("Provenance"),
        }
    }

    /// Route log lines to another logger
    pub fn with_logger(mut self, logger: NamedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Handle for modules to record external resources; detached when disabled
    pub fn handle(&self) -> ProvenanceHandle {
        if self.enabled {
            ProvenanceHandle::attached(Arc::clone(&self.resources))
        } else {
            ProvenanceHandle::detached()
        }
    }

    /// Move resources recorded so far into `activity`
    fn collect_resources(resources: &Mutex<RecordedResources>, activity: &mut Activity) {
        if let Ok(mut recorded) = resources.lock() {
            activity.resources_read.append(&mut recorded.read);
            activity.resources_written.append(&mut recorded.written);
        }
    }

    /// Open the root activity of the run
    pub fn begin_run(&mut self, name: &str, configuration: Value) {
        if !self.enabled {
            return;
        }
        self.logger.info(&format!("Starting activity '{}'", name));

        let mut run = Activity::new(name, ActivityKind::Run);
        run.configuration = configuration;
        run.system = Some(SystemInfo::collect());
        run.peak_memory_mb_start = peak_memory_mb();

        self.run = Some(run);
        self.run_started = Some(Instant::now());
    }

    /// Align tracked entries with the blob a new cycle starts with
    ///
    /// Keys that vanished are retired; keys the recorder has not seen with
    /// their current stamp become fresh entries without a producer.
    pub fn observe_cycle_start(&mut self, blob: &Blob) {
        if !self.enabled {
            return;
        }
        self.entries.retain(|key, _| blob.has(key));
        for (key, stamp) in blob.stamped_keys() {
            self.entry_for(&key, stamp);
        }
    }

    /// Start the activity of a module about to process `visible`
    pub fn begin(&mut self, module: &str, cycle: u64, visible: &Blob) -> Option<PendingActivity> {
        if !self.enabled {
            return None;
        }
        if let Some(run) = self.run.as_mut() {
            Self::collect_resources(&self.resources, run);
        }

        let mut activity = Activity::new(module, ActivityKind::Module);
        activity.cycle = Some(cycle);
        activity.parent = self.run.as_ref().map(|run| run.id);
        activity.inputs = visible
            .stamped_keys()
            .into_iter()
            .map(|(key, stamp)| self.entry_for(&key, stamp))
            .collect();

        Some(PendingActivity {
            activity,
            started: Instant::now(),
        })
    }

    /// Close an activity, diffing the cycle blob against the tracked entries
    pub fn complete(&mut self, pending: Option<PendingActivity>, after: &Blob, status: ActivityStatus) {
        let Some(PendingActivity {
            mut activity,
            started,
        }) = pending
        else {
            return;
        };

        for (key, stamp) in after.stamped_keys() {
            match self.entries.get_mut(&key) {
                Some(entry) if entry.stamp == stamp => {}
                Some(entry) => {
                    entry.revision += 1;
                    entry.stamp = stamp;
                    activity.outputs.push(entry.to_ref(&key));
                }
                None => {
                    let entry = TrackedEntry {
                        id: Uuid::new_v4(),
                        revision: 0,
                        stamp,
                    };
                    activity.outputs.push(entry.to_ref(&key));
                    self.entries.insert(key, entry);
                }
            }
        }

        let mut gone: Vec<String> = self
            .entries
            .keys()
            .filter(|key| !after.has(key))
            .cloned()
            .collect();
        gone.sort();
        for key in gone {
            if let Some(entry) = self.entries.remove(&key) {
                activity.removed.push(entry.to_ref(&key));
            }
        }

        Self::collect_resources(&self.resources, &mut activity);
        activity.close(status, started.elapsed().as_secs_f64());
        if let Some(run) = self.run.as_mut() {
            run.children.push(activity.id);
        }
        self.activities.push(activity);
    }

    /// Activity that produced the latest revision of `key` so far
    pub fn last_producer(&self, key: &str) -> Option<&Activity> {
        self.activities.iter().rev().find(|a| a.produced(key))
    }

    /// Close the run and hand out the record; `None` when disabled
    pub fn finish(&mut self, status: ActivityStatus) -> Option<ProvenanceRecord> {
        if !self.enabled {
            return None;
        }

        let mut run = match self.run.take() {
            Some(run) => run,
            None => {
                self.logger.warn("Could not finish the run activity, it was never started.");
                return None;
            }
        };
        let duration = self
            .run_started
            .take()
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        run.peak_memory_mb_stop = peak_memory_mb();
        Self::collect_resources(&self.resources, &mut run);
        run.close(status, duration);
        self.logger.info(&format!("Finishing activity '{}'", run.name));

        self.entries.clear();
        Some(ProvenanceRecord {
            run,
            activities: std::mem::take(&mut self.activities),
        })
    }

    fn entry_for(&mut self, key: &str, stamp: u64) -> EntryRef {
        match self.entries.get_mut(key) {
            Some(entry) if entry.stamp == stamp => entry.to_ref(key),
            Some(entry) => {
                entry.revision += 1;
                entry.stamp = stamp;
                entry.to_ref(key)
            }
            None => {
                let entry = TrackedEntry {
                    id: Uuid::new_v4(),
                    revision: 0,
                    stamp,
                };
                let entry_ref = entry.to_ref(key);
                self.entries.insert(key.to_string(), entry);
                entry_ref
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> ProvenanceRecorder {
        let mut recorder = ProvenanceRecorder::new(true);
        recorder.begin_run("test", json!({}));
        recorder
    }

    #[test]
    fn test_outputs_and_inputs() {
        let mut recorder = recorder();
        let mut blob = Blob::new();
        recorder.observe_cycle_start(&blob);

        let pending = recorder.begin("Producer", 0, &blob);
        blob.set("a", 1);
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        let pending = recorder.begin("Consumer", 0, &blob);
        blob.set("b", 2);
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        let record = recorder.finish(ActivityStatus::Completed).unwrap();
        let producer = &record.activities[0];
        let consumer = &record.activities[1];

        assert!(producer.inputs.is_empty());
        assert_eq!(producer.outputs[0].key, "a");
        assert_eq!(consumer.inputs, producer.outputs);
        assert_eq!(consumer.outputs.len(), 1);
        assert_eq!(consumer.outputs[0].key, "b");
        assert_eq!(record.run.children, vec![producer.id, consumer.id]);
        assert_eq!(consumer.parent, Some(record.run.id));
    }

    #[test]
    fn test_overwrite_keeps_id_and_bumps_revision() {
        let mut recorder = recorder();
        let mut blob = Blob::new();
        recorder.observe_cycle_start(&blob);

        let pending = recorder.begin("First", 0, &blob);
        blob.set("x", 1);
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        let pending = recorder.begin("Second", 0, &blob);
        blob.set("x", 2);
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        let record = recorder.finish(ActivityStatus::Completed).unwrap();
        let first = &record.activities[0].outputs[0];
        let second = &record.activities[1].outputs[0];
        assert_eq!(first.id, second.id);
        assert_eq!(first.revision, 0);
        assert_eq!(second.revision, 1);
        assert_eq!(record.last_producer("x").unwrap().name, "Second");
    }

    #[test]
    fn test_removed_entries_are_retired() {
        let mut recorder = recorder();
        let mut blob = Blob::new();
        blob.set("gone", true);
        recorder.observe_cycle_start(&blob);

        let pending = recorder.begin("Cleaner", 0, &blob);
        blob.remove("gone");
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        let record = recorder.finish(ActivityStatus::Completed).unwrap();
        assert_eq!(record.activities[0].removed[0].key, "gone");
        assert!(record.last_producer("gone").is_none());
    }

    #[test]
    fn test_entry_id_survives_cycles_only_while_key_persists() {
        let mut recorder = recorder();
        let mut blob = Blob::new();
        recorder.observe_cycle_start(&blob);
        let pending = recorder.begin("Seed", 0, &blob);
        blob.set("kept", 1);
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        // persistent blob: same entry next cycle
        recorder.observe_cycle_start(&blob);
        let pending = recorder.begin("Reader", 1, &blob).unwrap();
        assert_eq!(pending.activity.inputs[0].revision, 0);
        let kept_id = pending.activity.inputs[0].id;
        recorder.complete(Some(pending), &blob, ActivityStatus::Completed);

        // fresh blob: the key disappears, then comes back as a new entry
        let mut fresh = Blob::new();
        recorder.observe_cycle_start(&fresh);
        let pending = recorder.begin("Seed", 2, &fresh);
        fresh.set("kept", 1);
        recorder.complete(pending, &fresh, ActivityStatus::Completed);

        let record = recorder.finish(ActivityStatus::Completed).unwrap();
        let reborn = &record.activities[2].outputs[0];
        assert_ne!(reborn.id, kept_id);
        assert_eq!(reborn.revision, 0);
    }

    #[test]
    fn test_resources_go_to_the_current_activity() {
        let mut recorder = recorder();
        let handle = recorder.handle();
        assert!(handle.is_recording());

        // before any module runs: belongs to the run
        handle.record_input("file:///calibration.toml", "detector calibration");

        let blob = Blob::new();
        recorder.observe_cycle_start(&blob);
        let pending = recorder.begin("Writer", 0, &blob);
        handle.record_input("file:///raw_0.dat", "");
        handle.record_output("file:///events_0.h5", "reconstructed events");
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        let pending = recorder.begin("Idle", 0, &blob);
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        // from a finish hook
        handle.record_output("file:///summary.json", "");

        let record = recorder.finish(ActivityStatus::Completed).unwrap();
        let writer = &record.activities[0];
        assert_eq!(writer.resources_read[0].url, "file:///raw_0.dat");
        assert_eq!(writer.resources_written[0].comment, "reconstructed events");
        assert!(record.activities[1].resources_read.is_empty());
        assert!(record.activities[1].resources_written.is_empty());

        assert_eq!(record.run.resources_read[0].url, "file:///calibration.toml");
        assert_eq!(record.run.resources_written[0].url, "file:///summary.json");

        let restored = ProvenanceRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(restored.activities[0].resources_written, writer.resources_written);
    }

    #[test]
    fn test_disabled_recorder_is_a_no_op() {
        let mut recorder = ProvenanceRecorder::new(false);
        recorder.begin_run("off", json!({}));
        let mut blob = Blob::new();
        recorder.observe_cycle_start(&blob);

        let pending = recorder.begin("Any", 0, &blob);
        assert!(pending.is_none());
        blob.set("a", 1);
        recorder.complete(pending, &blob, ActivityStatus::Completed);

        assert!(recorder.last_producer("a").is_none());
        assert!(!recorder.handle().is_recording());
        assert!(recorder.finish(ActivityStatus::Completed).is_none());
    }

    #[test]
    fn test_run_activity_carries_system_and_configuration() {
        let mut recorder = ProvenanceRecorder::new(true);
        recorder.begin_run("configured", json!({"Pump": {"max_count": 5}}));
        let record = recorder.finish(ActivityStatus::Completed).unwrap();

        assert_eq!(record.run.kind, ActivityKind::Run);
        assert_eq!(record.run.status, ActivityStatus::Completed);
        assert!(record.run.system.is_some());
        assert_eq!(record.run.configuration["Pump"]["max_count"], 5);
        assert!(record.is_empty());
    }
}
