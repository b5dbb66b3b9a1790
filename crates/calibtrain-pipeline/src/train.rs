//! The calibration train driver.
//!
//! Ties the pieces together for one run: overrides, descriptor lookup,
//! planning, dataset, execution.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use calibtrain_types::{CalibError, Overrides, Result, RunContext};

use crate::artifact::{ArtifactHandle, DEFAULT_ARTIFACT_FILE};
use crate::catalogue::default_registry;
use crate::dataset::JsonLinesDataset;
use crate::descriptor::{
    select_source, LocalAccessConfig, MetadataLocation, LOCAL_ACCESS_FILE, SNAPSHOT_FILE,
};
use crate::engine::{ExecutorConfig, PipelineExecutor};
use crate::events::{EventEmitter, TrainEvent};
use crate::planner::ExecutionPlan;
use crate::registry::StageRegistry;
use crate::stage::{CatalogueWiring, StageWiring};

/// Default event input.
pub const DEFAULT_INPUT: &str = "AliESDs.jsonl";

/// Default metadata location.
pub const DEFAULT_METADATA: &str = "local://OCDB";

/// Everything one run needs.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub run_id: u32,
    pub input: PathBuf,
    pub metadata: MetadataLocation,
    /// Checked first; when present it replaces `metadata`.
    pub snapshot_file: PathBuf,
    /// Optional site file; may redirect `metadata` and add switch values.
    pub local_access: PathBuf,
    pub output_dir: PathBuf,
    pub output_file: String,
    pub read_friends: bool,
    /// Explicit switch values. They win over the environment.
    pub overrides: Overrides,
    /// Read the registry's switch variables from the process environment.
    pub capture_env: bool,
}

impl TrainConfig {
    pub fn new(run_id: u32) -> Self {
        Self {
            run_id,
            input: PathBuf::from(DEFAULT_INPUT),
            metadata: MetadataLocation::Directory(PathBuf::from("OCDB")),
            snapshot_file: PathBuf::from(SNAPSHOT_FILE),
            local_access: PathBuf::from(LOCAL_ACCESS_FILE),
            output_dir: PathBuf::from("."),
            output_file: DEFAULT_ARTIFACT_FILE.to_string(),
            read_friends: true,
            overrides: Overrides::new(),
            capture_env: true,
        }
    }

    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            output_dir: self.output_dir.clone(),
            output_file: self.output_file.clone(),
            read_friends: self.read_friends,
        }
    }
}

/// Plans and runs calibration passes against one stage registry.
pub struct CalibrationTrain {
    registry: StageRegistry,
    wiring: Arc<dyn StageWiring>,
    emitter: EventEmitter,
}

impl CalibrationTrain {
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry,
            wiring: Arc::new(CatalogueWiring),
            emitter: EventEmitter::default(),
        }
    }

    /// Train over the default catalogue.
    pub fn with_default_catalogue() -> Result<Self> {
        Ok(Self::new(default_registry()?))
    }

    pub fn with_wiring(mut self, wiring: Arc<dyn StageWiring>) -> Self {
        self.wiring = wiring;
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Environment values for the registry's switches, then the local
    /// access file's, then the explicit ones from `config`. Later layers win.
    pub fn overrides_for(
        &self,
        config: &TrainConfig,
        local: Option<&LocalAccessConfig>,
    ) -> Overrides {
        let mut overrides = if config.capture_env {
            Overrides::capture(self.registry.switch_names())
        } else {
            Overrides::new()
        };
        if let Some(local) = local {
            for (name, value) in &local.overrides {
                overrides.set(name.clone(), value.clone());
            }
        }
        overrides.merge(config.overrides.clone());
        overrides
    }

    /// Resolve the run context for `config`.
    pub async fn resolve(&self, config: &TrainConfig) -> Result<RunContext> {
        let local = LocalAccessConfig::load(&config.local_access).await?;
        let overrides = self.overrides_for(config, local.as_ref());
        let location = match local.as_ref().map(LocalAccessConfig::location).transpose()? {
            Some(Some(location)) => location,
            _ => config.metadata.clone(),
        };
        let source = select_source(&location, &config.snapshot_file);
        tracing::debug!(run = config.run_id, source = %source.describe(), "Resolving run");
        let context = source.resolve(config.run_id).await?;
        tracing::info!(run = context.run_id, detectors = %context.mask, "Triggered detectors");
        Ok(context.with_overrides(overrides))
    }

    /// Resolve and plan without touching the dataset.
    pub async fn plan_only(&self, config: &TrainConfig) -> Result<ExecutionPlan> {
        match self.resolve(config).await {
            Ok(context) => Ok(self.plan(&context)),
            Err(e) => Err(self.failed(config.run_id, e)),
        }
    }

    /// Full run. Returns the written artifact.
    pub async fn run(&self, config: &TrainConfig) -> Result<ArtifactHandle> {
        let started = Instant::now();
        let result = self.run_inner(config, started).await;
        match result {
            Ok(handle) => {
                tracing::info!(
                    run = config.run_id,
                    events = handle.events_processed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Processing time"
                );
                Ok(handle)
            }
            Err(e) => Err(self.failed(config.run_id, e)),
        }
    }

    async fn run_inner(&self, config: &TrainConfig, started: Instant) -> Result<ArtifactHandle> {
        let context = self.resolve(config).await?;
        let plan = self.plan(&context);

        let mut dataset = JsonLinesDataset::open(&config.input, config.read_friends).await?;
        tracing::info!(
            run = context.run_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Configuration time"
        );

        let executor = PipelineExecutor::new(config.executor_config(), Arc::clone(&self.wiring))
            .with_emitter(self.emitter.clone());
        executor.run(&plan, &context, &mut dataset).await
    }

    fn plan(&self, context: &RunContext) -> ExecutionPlan {
        let plan = self.registry.plan(context);
        for decision in &plan.decisions {
            tracing::debug!(
                stage = %decision.stage,
                activated = decision.activated,
                reason = %decision.reason,
                "Activation decision"
            );
        }
        tracing::info!(run = plan.run_id, stages = ?plan.names(), "Execution plan");
        self.emitter.emit(TrainEvent::PlanComputed {
            run_id: plan.run_id,
            stages: plan.names().into_iter().map(String::from).collect(),
        });
        plan
    }

    fn failed(&self, run_id: u32, error: CalibError) -> CalibError {
        self.emitter.emit(TrainEvent::RunFailed {
            run_id,
            error: error.to_string(),
        });
        error
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue;
    use serde_json::json;

    fn write_descriptor(root: &std::path::Path, run: u32, mask: serde_json::Value) {
        let dir = root.join("GRP/GRP/Data");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(format!("Run{run}.json")),
            json!({"run": run, "detector_mask": mask}).to_string(),
        )
        .unwrap();
    }

    fn config(dir: &std::path::Path, run: u32) -> TrainConfig {
        TrainConfig {
            metadata: MetadataLocation::Directory(dir.join("OCDB")),
            snapshot_file: dir.join(SNAPSHOT_FILE),
            local_access: dir.join(LOCAL_ACCESS_FILE),
            input: dir.join(DEFAULT_INPUT),
            output_dir: dir.join("out"),
            capture_env: false,
            ..TrainConfig::new(run)
        }
    }

    #[test]
    fn explicit_overrides_win() {
        let train = CalibrationTrain::with_default_catalogue().unwrap();
        let mut cfg = TrainConfig::new(1);
        cfg.capture_env = false;
        cfg.overrides.set(catalogue::SDD_SWITCH, "2");
        let overrides = train.overrides_for(&cfg, None);
        assert_eq!(overrides.switch(catalogue::SDD_SWITCH), Some(2));
    }

    #[tokio::test]
    async fn plan_only_reads_no_dataset() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(&dir.path().join("OCDB"), 7, json!(["TPC", "TOF"]));
        let train = CalibrationTrain::with_default_catalogue().unwrap();

        // No input file exists; planning must still succeed.
        let plan = train.plan_only(&config(dir.path(), 7)).await.unwrap();
        assert_eq!(plan.names(), vec!["tpc_calib", "tof_calib"]);
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn missing_descriptor_emits_run_failed() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let train = CalibrationTrain::with_default_catalogue()
            .unwrap()
            .with_emitter(emitter);

        let err = train.run(&config(dir.path(), 8)).await.unwrap_err();
        assert!(matches!(err, CalibError::DescriptorUnavailable { run: 8 }));
        assert!(err.is_run_fatal());
        match rx.try_recv().unwrap() {
            TrainEvent::RunFailed { run_id, .. } => assert_eq!(run_id, 8),
            other => panic!("Expected RunFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_access_file_redirects_metadata_and_sets_switches() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(&dir.path().join("site"), 12, json!(["TPC", "TRD"]));
        std::fs::write(
            dir.path().join(LOCAL_ACCESS_FILE),
            json!({
                "metadata": format!("local://{}", dir.path().join("site").display()),
                "overrides": {(catalogue::DISABLE_TRD): "1", (catalogue::SDD_SWITCH): "1"}
            })
            .to_string(),
        )
        .unwrap();

        let mut cfg = config(dir.path(), 12);
        cfg.overrides.set(catalogue::SDD_SWITCH, "0");
        let train = CalibrationTrain::with_default_catalogue().unwrap();
        let plan = train.plan_only(&cfg).await.unwrap();

        // Local file disabled TRD; the explicit value kept SDD off.
        assert_eq!(plan.names(), vec!["tpc_calib"]);
    }
}
