//! End-to-end integration tests for the calibration train.
//!
//! Each test goes through the public API: build a registry or use the
//! default catalogue -> plan -> execute -> inspect the artifact.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use calibtrain_pipeline::catalogue::{self, DISABLE_TPC, SDD_SWITCH};
use calibtrain_pipeline::stages::CALIBRATED_FLAG;
use calibtrain_pipeline::{
    read_artifact, ActivationReason, CalibrationTrain, ConsumerHandle, EventReader,
    MetadataLocation, PipelineExecutor, PlannedStage, StageDescriptor, StageRegistry, StageRole,
    StageWiring, TrainConfig, TrainEvent, EventEmitter, CatalogueWiring, ExecutorConfig,
    MemorySource, DEFAULT_ARTIFACT_FILE, LOCAL_ACCESS_FILE, SNAPSHOT_FILE,
};
use calibtrain_types::{CalibError, CapabilityMask, Event, Overrides, RunContext, Subsystem};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn registry(stages: Vec<StageDescriptor>) -> StageRegistry {
    let mut reg = StageRegistry::new();
    for stage in stages {
        reg.register(stage).expect("register");
    }
    reg
}

fn context(subsystems: &[Subsystem]) -> RunContext {
    RunContext::new(104892, subsystems.iter().copied().collect())
}

fn write_descriptor(root: &Path, run: u32, doc: serde_json::Value) {
    let dir = root.join("GRP/GRP/Data");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("Run{run}.json")), doc.to_string()).unwrap();
}

fn write_events(path: &Path, n: usize) {
    let mut body = String::new();
    for i in 0..n {
        let line = json!({
            "record": {
                "t0": 10.0 + i as f64,
                "vertex": [0.0, 0.0, i as f64],
                "tracks": [
                    {"pt": 1.0, "dedx": 50.0, "tof_signal": 30.0, "trd_tracklets": 5},
                    {"pt": 0.2, "dedx": 70.0, "tof_signal": 40.0}
                ]
            },
            "friend": {"clusters": 12}
        });
        body.push_str(&line.to_string());
        body.push('\n');
    }
    std::fs::write(path, body).unwrap();
}

fn train_config(dir: &Path, run: u32) -> TrainConfig {
    TrainConfig {
        input: dir.join("AliESDs.jsonl"),
        metadata: MetadataLocation::Directory(dir.join("OCDB")),
        snapshot_file: dir.join(SNAPSHOT_FILE),
        local_access: dir.join(LOCAL_ACCESS_FILE),
        output_dir: dir.join("out"),
        capture_env: false,
        ..TrainConfig::new(run)
    }
}

// ---------------------------------------------------------------------------
// Planning scenarios
// ---------------------------------------------------------------------------

#[test]
fn prerequisite_pruning_only_applies_to_activated_stages() {
    // A = TPC present; B needs A; C needs B but its own predicate never fires.
    let reg = registry(vec![
        StageDescriptor::when_present("stage_a", Subsystem::Tpc),
        StageDescriptor::always("stage_b").requires("stage_a"),
        StageDescriptor::when_present("stage_c", Subsystem::Emcal).requires("stage_b"),
    ]);
    let plan = reg.plan(&context(&[Subsystem::Tpc]));

    assert_eq!(plan.names(), vec!["stage_a", "stage_b"]);
    assert_eq!(
        plan.decision("stage_c").unwrap().reason,
        ActivationReason::PredicateFalse
    );
}

#[test]
fn terminal_stage_registered_first_runs_last() {
    let reg = registry(vec![
        StageDescriptor::when_present("stage_d", Subsystem::Tof).terminal_mutating(),
        StageDescriptor::when_present("stage_a", Subsystem::Tpc),
    ]);
    let plan = reg.plan(&context(&[Subsystem::Tpc, Subsystem::Tof]));

    assert_eq!(plan.names(), vec!["stage_a", "stage_d"]);
    assert_eq!(plan.terminal().unwrap().name, "stage_d");
}

#[test]
fn override_disables_stage_and_its_dependents() {
    let reg = catalogue::default_registry().unwrap();
    let ctx = context(&[Subsystem::Tpc, Subsystem::Trd, Subsystem::Tof, Subsystem::T0])
        .with_overrides(Overrides::new().with(DISABLE_TPC, "1"));
    let plan = reg.plan(&ctx);

    assert_eq!(plan.names(), vec!["t0_calib"]);
    assert_eq!(
        plan.decision("tpc_calib").unwrap().reason,
        ActivationReason::SwitchedOff {
            switch: DISABLE_TPC.to_string()
        }
    );
    for dependent in ["trd_calib", "tof_calib"] {
        assert_eq!(
            plan.decision(dependent).unwrap().reason,
            ActivationReason::MissingPrerequisite {
                prerequisite: "tpc_calib".to_string()
            },
            "{dependent} should be pruned"
        );
    }
}

#[test]
fn sdd_stage_needs_positive_switch() {
    let reg = catalogue::default_registry().unwrap();
    let base = context(&[Subsystem::ItsSdd]);

    for (raw, expected) in [("1", true), ("0", false), ("-3", false), ("yes", false), (" 7x", true)] {
        let ctx = base.clone().with_overrides(Overrides::new().with(SDD_SWITCH, raw));
        assert_eq!(reg.plan(&ctx).contains("sdd_align"), expected, "switch value {raw:?}");
    }
    assert!(!reg.plan(&base).contains("sdd_align"));
}

#[test]
fn plan_serializes_identically_for_identical_input() {
    let reg = catalogue::default_registry().unwrap();
    let ctx = context(&[Subsystem::ItsSpd, Subsystem::Tpc, Subsystem::Tof]);
    let a = serde_json::to_string(&reg.plan(&ctx)).unwrap();
    let b = serde_json::to_string(&reg.plan(&ctx)).unwrap();
    assert_eq!(a, b);
}

// ---------------------------------------------------------------------------
// Full runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_run_writes_artifact_with_every_planned_stage() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(
        &dir.path().join("OCDB"),
        104892,
        json!({
            "run": 104892,
            "detector_mask": "ITSSPD ITSSDD TPC TRD TOF T0",
            "scalars": {"l3_current": 30000.0}
        }),
    );
    write_events(&dir.path().join("AliESDs.jsonl"), 5);

    let mut config = train_config(dir.path(), 104892);
    config.overrides.set(SDD_SWITCH, "1");

    let emitter = EventEmitter::new(64);
    let mut rx = emitter.subscribe();
    let train = CalibrationTrain::with_default_catalogue()
        .unwrap()
        .with_emitter(emitter);
    let handle = train.run(&config).await.unwrap();

    assert_eq!(handle.events_processed, 5);
    assert_eq!(handle.path, dir.path().join("out").join(DEFAULT_ARTIFACT_FILE));

    let artifact = read_artifact(&handle.path).await.unwrap();
    assert_eq!(
        artifact.plan,
        vec!["tpc_calib", "trd_calib", "t0_calib", "mean_vertex", "sdd_align", "tof_calib"]
    );
    assert_eq!(artifact.detectors, vec!["ITSSPD", "ITSSDD", "TPC", "TRD", "TOF", "T0"]);
    assert_eq!(artifact.stages.len(), 6);
    assert_eq!(artifact.stages["t0_calib"]["mean_t0"], 12.0);
    assert_eq!(artifact.cleanup["released"][0], "geometry");

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(match event {
            TrainEvent::PlanComputed { .. } => "plan",
            TrainEvent::StageWired { .. } => "wired",
            TrainEvent::StreamStarted { .. } => "started",
            TrainEvent::StreamCompleted { .. } => "completed",
            TrainEvent::CleanupCompleted { .. } => "cleanup",
            TrainEvent::ArtifactWritten { .. } => "artifact",
            TrainEvent::RunFailed { .. } => "failed",
        });
    }
    assert_eq!(seen.first(), Some(&"plan"));
    assert_eq!(seen.iter().filter(|s| **s == "wired").count(), 6);
    assert_eq!(seen.last(), Some(&"artifact"));
    assert!(!seen.contains(&"failed"));
}

#[tokio::test]
async fn empty_mask_still_produces_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(&dir.path().join("OCDB"), 5, json!({"detector_mask": 0}));
    write_events(&dir.path().join("AliESDs.jsonl"), 3);

    let train = CalibrationTrain::with_default_catalogue().unwrap();
    let handle = train.run(&train_config(dir.path(), 5)).await.unwrap();

    let artifact = read_artifact(&handle.path).await.unwrap();
    assert!(artifact.plan.is_empty());
    assert!(artifact.detectors.is_empty());
    assert_eq!(artifact.events_processed, 3);
    assert_eq!(artifact.cleanup["released"][0], "geometry");
}

#[tokio::test]
async fn unavailable_descriptor_is_fatal_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_events(&dir.path().join("AliESDs.jsonl"), 1);

    let train = CalibrationTrain::with_default_catalogue().unwrap();
    let err = train.run(&train_config(dir.path(), 77)).await.unwrap_err();

    assert!(matches!(err, CalibError::DescriptorUnavailable { run: 77 }));
    assert!(err.is_run_fatal());
    assert!(!dir.path().join("out").exists());
}

#[tokio::test]
async fn malformed_descriptor_is_fatal_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(&dir.path().join("OCDB"), 9, json!({"detector_mask": 1_048_576}));
    write_events(&dir.path().join("AliESDs.jsonl"), 1);

    let train = CalibrationTrain::with_default_catalogue().unwrap();
    let err = train.run(&train_config(dir.path(), 9)).await.unwrap_err();

    match &err {
        CalibError::MalformedDescriptor { run, message } => {
            assert_eq!(*run, 9);
            assert!(message.contains("unknown bits"), "{message}");
        }
        other => panic!("Expected MalformedDescriptor, got: {other:?}"),
    }
    assert!(!dir.path().join("out").exists());
}

#[tokio::test]
async fn snapshot_file_overrides_metadata_directory() {
    let dir = tempfile::tempdir().unwrap();
    // The directory says TPC; the snapshot says T0 only.
    write_descriptor(&dir.path().join("OCDB"), 11, json!({"detector_mask": ["TPC"]}));
    std::fs::write(
        dir.path().join(SNAPSHOT_FILE),
        json!({"runs": {"11": {"detector_mask": ["T0"]}}}).to_string(),
    )
    .unwrap();

    let train = CalibrationTrain::with_default_catalogue().unwrap();
    let plan = train.plan_only(&train_config(dir.path(), 11)).await.unwrap();
    assert_eq!(plan.names(), vec!["t0_calib"]);
}

// ---------------------------------------------------------------------------
// Record visibility
// ---------------------------------------------------------------------------

/// Reader that records whether it ever saw the TOF flag on a record.
struct FlagProbe {
    name: String,
    saw_flag: Arc<Mutex<bool>>,
}

#[async_trait]
impl EventReader for FlagProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, event: &Event) -> calibtrain_types::Result<()> {
        if event.record.contains_key(CALIBRATED_FLAG) {
            *self.saw_flag.lock().unwrap() = true;
        }
        Ok(())
    }

    async fn finish(&mut self) -> calibtrain_types::Result<serde_json::Value> {
        Ok(json!(*self.saw_flag.lock().unwrap()))
    }
}

/// Catalogue wiring with every normal stage replaced by a probe.
struct ProbeWiring {
    saw_flag: Arc<Mutex<bool>>,
}

impl StageWiring for ProbeWiring {
    fn wire(
        &self,
        stage: &PlannedStage,
        context: &RunContext,
    ) -> calibtrain_types::Result<ConsumerHandle> {
        match stage.role {
            StageRole::Normal => Ok(ConsumerHandle::reader(FlagProbe {
                name: stage.name.clone(),
                saw_flag: Arc::clone(&self.saw_flag),
            })),
            StageRole::TerminalMutating => CatalogueWiring.wire(stage, context),
        }
    }
}

#[tokio::test]
async fn readers_never_observe_terminal_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let reg = catalogue::default_registry().unwrap();
    let ctx = context(&[Subsystem::Tpc, Subsystem::Trd, Subsystem::Tof]);
    let plan = reg.plan(&ctx);
    assert_eq!(plan.terminal().unwrap().name, "tof_calib");

    let saw_flag = Arc::new(Mutex::new(false));
    let executor = PipelineExecutor::new(
        ExecutorConfig {
            output_dir: dir.path().to_path_buf(),
            ..ExecutorConfig::default()
        },
        Arc::new(ProbeWiring {
            saw_flag: Arc::clone(&saw_flag),
        }),
    );
    let events = (0..4).map(|i| {
        let mut record = serde_json::Map::new();
        record.insert("tracks".into(), json!([{"tof_signal": 25.0}]));
        Event::new(i, record)
    });
    let handle = executor
        .run(&plan, &ctx, &mut MemorySource::new(events))
        .await
        .unwrap();

    assert!(!*saw_flag.lock().unwrap());
    let artifact = read_artifact(&handle.path).await.unwrap();
    assert_eq!(artifact.stages["tpc_calib"], json!(false));
    assert_eq!(artifact.stages["tof_calib"]["events"], 4);
}

#[test]
fn capability_mask_round_trips_through_names() {
    let mask = CapabilityMask::from_names(["tpc", "TOF", "ad"]).unwrap();
    assert_eq!(mask.to_string(), "TPC TOF AD");
    assert_eq!(mask.bits(), (1 << 3) | (1 << 5) | (1 << 21));
}
