use blobflow::pipeline::modules::CountingPump;
use blobflow::provenance::ActivityStatus;
use blobflow::*;
use proptest::prelude::*;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type Journal = Arc<Mutex<Vec<String>>>;

/// Module that writes every lifecycle call into a shared journal
struct Tracker {
    journal: Journal,
    name: String,
    calls: u64,
    fail_on_call: Option<u64>,
    flow_on_call: Option<(u64, Flow)>,
}

impl Tracker {
    fn new(journal: &Journal) -> Self {
        Self {
            journal: Arc::clone(journal),
            name: String::new(),
            calls: 0,
            fail_on_call: None,
            flow_on_call: None,
        }
    }

    fn failing_on(mut self, call: u64) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    fn flow_on(mut self, call: u64, flow: Flow) -> Self {
        self.flow_on_call = Some((call, flow));
        self
    }
}

impl Module for Tracker {
    fn configure(&mut self, ctx: &mut ModuleContext) -> PipeResult<()> {
        self.name = ctx.name().to_string();
        Ok(())
    }

    fn process(&mut self, blob: &mut Blob) -> PipeResult<Flow> {
        self.calls += 1;
        self.journal
            .lock()
            .unwrap()
            .push(format!("process {}", self.name));
        blob.set(self.name.clone(), self.calls);

        if self.fail_on_call == Some(self.calls) {
            return Err(PipeError::GenericError(format!(
                "{} broke on call {}",
                self.name, self.calls
            )));
        }
        match self.flow_on_call {
            Some((call, flow)) if call == self.calls => Ok(flow),
            _ => Ok(Flow::Continue),
        }
    }

    fn finish(&mut self) -> PipeResult<Option<Value>> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("finish {}", self.name));
        Ok(Some(Value::from(self.calls)))
    }
}

fn pipeline(name: &str) -> Pipeline {
    Pipeline::builder(name)
        .without_config_file()
        .build()
        .unwrap()
}

fn count(journal: &Journal, entry: &str) -> usize {
    journal.lock().unwrap().iter().filter(|e| *e == entry).count()
}

#[test]
fn test_counting_module_stops_after_max_count() {
    let journal = Journal::default();
    let mut pipeline = pipeline("counting");
    pipeline
        .attach(Attachment::module(CountingPump::new()).with("max_count", 5))
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("Downstream"))
        .unwrap();

    let report = pipeline.drain(None).unwrap();

    assert_eq!(report.cycles, 5);
    assert_eq!(
        report.stop_reason,
        StopReason::Stopped {
            module: "CountingPump".to_string(),
            cycle: 5
        }
    );
    assert_eq!(report.finish_results.get("CountingPump"), Some(&Value::from(5)));
    assert_eq!(count(&journal, "process Downstream"), 5);
    assert_eq!(count(&journal, "finish Downstream"), 1);
    assert_eq!(
        journal.lock().unwrap().last().map(String::as_str),
        Some("finish Downstream")
    );
    // the pump also ran in the stopping cycle
    assert_eq!(
        report.statistics.module("CountingPump").unwrap().invocations,
        6
    );
}

#[test]
fn test_failing_module_still_finishes_everything() {
    let journal = Journal::default();
    let mut pipeline = pipeline("failing");
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("Before"))
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal).failing_on(3)).named("Failing"))
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("After"))
        .unwrap();

    let err = pipeline.drain(None).unwrap_err();

    match &err {
        PipeError::ModuleExecution { module, cycle, .. } => {
            assert_eq!(module, "Failing");
            assert_eq!(*cycle, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("Failing broke on call 3"));

    assert_eq!(count(&journal, "process Before"), 3);
    assert_eq!(count(&journal, "process Failing"), 3);
    assert_eq!(count(&journal, "process After"), 2);
    for name in ["Before", "Failing", "After"] {
        assert_eq!(count(&journal, &format!("finish {}", name)), 1);
    }

    let report = pipeline.report().unwrap();
    assert_eq!(report.cycles, 2);
    assert!(!report.success());
    assert!(report.provenance.is_some());
    assert_eq!(report.statistics.module("Before").unwrap().invocations, 3);

    let record = report.provenance.as_ref().unwrap();
    assert_eq!(record.run.status, ActivityStatus::Failed);
    let failing = record.activities_for("Failing");
    assert_eq!(failing.last().unwrap().status, ActivityStatus::Failed);
}

#[test]
fn test_disabled_provenance_keeps_statistics() {
    let journal = Journal::default();
    let mut pipeline = Pipeline::builder("no-provenance")
        .without_config_file()
        .provenance(false)
        .build()
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("A"))
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("B"))
        .unwrap();

    let report = pipeline.drain(Some(10)).unwrap();

    assert!(report.provenance.is_none());
    assert_eq!(report.cycles, 10);
    assert_eq!(report.statistics.cycle_samples, 10);
    for name in ["A", "B"] {
        let module = report.statistics.module(name).unwrap();
        assert_eq!(module.invocations, 10);
        assert_eq!(module.samples, 10);
        assert!(module.wall.is_some());
        assert!(module.cpu.is_some());
    }
}

#[test]
fn test_stop_runs_only_up_to_the_signalling_module() {
    let journal = Journal::default();
    let mut pipeline = pipeline("stop");
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("First"))
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal).flow_on(4, Flow::Stop)).named("Stopper"))
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("Last"))
        .unwrap();

    let report = pipeline.drain(Some(100)).unwrap();

    assert_eq!(report.cycles, 3);
    assert_eq!(count(&journal, "process First"), 4);
    assert_eq!(count(&journal, "process Stopper"), 4);
    assert_eq!(count(&journal, "process Last"), 3);
    assert_eq!(count(&journal, "finish Last"), 1);
}

#[test]
fn test_skip_aborts_only_the_current_cycle() {
    let journal = Journal::default();
    let mut pipeline = pipeline("skip");
    pipeline
        .attach(Attachment::module(Tracker::new(&journal).flow_on(2, Flow::Skip)).named("Skipper"))
        .unwrap();
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("Later"))
        .unwrap();

    let report = pipeline.drain(Some(4)).unwrap();

    assert_eq!(report.cycles, 4);
    assert_eq!(count(&journal, "process Skipper"), 4);
    assert_eq!(count(&journal, "process Later"), 3);

    let record = report.provenance.unwrap();
    assert_eq!(
        record.activities_for("Skipper")[1].status,
        ActivityStatus::Skipped
    );
    assert_eq!(record.activities_for("Later")[1].cycle, Some(2));
}

#[test]
fn test_sample_counts_match_invocations() {
    let journal = Journal::default();
    let mut pipeline = pipeline("samples");
    pipeline
        .attach(Attachment::module(Tracker::new(&journal)).named("Always"))
        .unwrap();
    pipeline
        .attach(
            Attachment::module(Tracker::new(&journal))
                .named("EveryOther")
                .with("every", 2),
        )
        .unwrap();

    let report = pipeline.drain(Some(7)).unwrap();

    let always = report.statistics.module("Always").unwrap();
    let every_other = report.statistics.module("EveryOther").unwrap();
    assert_eq!(always.samples, count(&journal, "process Always"));
    assert_eq!(
        every_other.samples,
        count(&journal, "process EveryOther")
    );
    assert_eq!(every_other.invocations, 3);
}

#[test]
fn test_statistics_limit_keeps_latest_samples() {
    let mut pipeline = Pipeline::builder("limited")
        .without_config_file()
        .stats_limit(3)
        .build()
        .unwrap();
    pipeline
        .attach_fn("Noop", |_: &mut Blob| Ok(Flow::Continue))
        .unwrap();

    let report = pipeline.drain(Some(10)).unwrap();
    let module = report.statistics.module("Noop").unwrap();
    assert_eq!(module.invocations, 10);
    assert_eq!(module.samples, 3);
    assert_eq!(report.statistics.cycle_samples, 3);
}

#[test]
fn test_provenance_inputs_come_from_earlier_activities() {
    let journal = Journal::default();
    let mut pipeline = Pipeline::builder("lineage")
        .without_config_file()
        .blob_policy(BlobPolicy::Persistent(Blob::new()))
        .build()
        .unwrap();
    for name in ["A", "B", "C"] {
        pipeline
            .attach(Attachment::module(Tracker::new(&journal)).named(name))
            .unwrap();
    }
    pipeline
        .attach_fn("Rewrite", |blob: &mut Blob| {
            if let Some(value) = blob.get_mut("A") {
                *value = Value::from(0);
            }
            Ok(Flow::Continue)
        })
        .unwrap();

    let report = pipeline.drain(Some(5)).unwrap();
    let record = report.provenance.unwrap();
    assert_eq!(record.len(), 20);

    let mut produced: HashMap<(uuid::Uuid, u32), usize> = HashMap::new();
    for (index, activity) in record.activities.iter().enumerate() {
        for input in &activity.inputs {
            let origin = produced
                .get(&(input.id, input.revision))
                .unwrap_or_else(|| panic!("input {:?} has no earlier producer", input));
            assert!(*origin < index);
            assert!(record.activities[*origin].started_at <= activity.started_at);
        }
        for output in &activity.outputs {
            produced.insert((output.id, output.revision), index);
        }
    }

    // one entry per key for the whole persistent run
    let ids: HashSet<uuid::Uuid> = record
        .activities_for("A")
        .iter()
        .flat_map(|a| a.outputs.iter().map(|o| o.id))
        .collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(record.last_producer("A").unwrap().name, "Rewrite");
    assert_eq!(record.last_producer("B").unwrap().name, "B");
    assert_eq!(record.activity(record.run.id).unwrap().children.len(), 20);
}

#[test]
fn test_config_file_with_variables() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("pipeline.toml");
    fs::write(
        &config_path,
        "[VARIABLES]\nLIMIT = 3\n\n[CountingPump]\nmax_count = \"LIMIT\"\n",
    )
    .unwrap();

    let mut pipeline = Pipeline::builder("configured")
        .config_file(&config_path)
        .build()
        .unwrap();
    pipeline
        .attach(Attachment::module(CountingPump::new()).with("max_count", 100))
        .unwrap();

    let report = pipeline.drain(None).unwrap();
    assert_eq!(report.cycles, 3);
}

#[test]
fn test_provenance_is_exported_on_drain() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("provenance.json");

    let mut pipeline = Pipeline::builder("exported")
        .without_config_file()
        .provenance_file(&path)
        .build()
        .unwrap();
    pipeline
        .attach(Attachment::module(CountingPump::new()).with("max_count", 2))
        .unwrap();
    pipeline.drain(None).unwrap();

    let record = ProvenanceRecord::from_json(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(record.run.name, "exported");
    assert_eq!(record.activities_for("CountingPump").len(), 3);
    assert_eq!(record.run.configuration["CountingPump"]["max_count"], 2);
}

#[test]
fn test_manual_export_waits_for_the_caller() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("manual.json");

    let mut pipeline = Pipeline::builder("manual")
        .without_config_file()
        .export_policy(ExportPolicy::Manual)
        .provenance_file(&path)
        .build()
        .unwrap();
    pipeline
        .attach_fn("Noop", |_: &mut Blob| Ok(Flow::Continue))
        .unwrap();
    pipeline.drain(Some(2)).unwrap();
    assert!(!path.exists());

    pipeline.export_provenance().unwrap();
    assert!(path.exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_attachment_order_is_execution_order(modules in 1usize..6, cycles in 0u64..8) {
        let journal = Journal::default();
        let mut pipeline = pipeline("order");
        let names: Vec<String> = (0..modules).map(|i| format!("M{}", i)).collect();
        for name in &names {
            pipeline
                .attach(Attachment::module(Tracker::new(&journal)).named(name.clone()))
                .unwrap();
        }

        let report = pipeline.drain(Some(cycles)).unwrap();
        prop_assert_eq!(report.cycles, cycles);

        let processed: Vec<String> = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("process "))
            .cloned()
            .collect();
        let expected: Vec<String> = (0..cycles)
            .flat_map(|_| names.iter().map(|n| format!("process {}", n)))
            .collect();
        prop_assert_eq!(processed, expected);

        let finished: Vec<String> = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("finish "))
            .cloned()
            .collect();
        let expected_finish: Vec<String> = names.iter().map(|n| format!("finish {}", n)).collect();
        prop_assert_eq!(finished, expected_finish);
    }
}
