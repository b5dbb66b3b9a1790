//! Calibration train: stage registry, planner, and single-pass executor.
//!
//! This crate decides which calibration stages run for a given run, in what
//! order, and drives one sequential pass of the event data through them,
//! writing a single per-run artifact.

pub mod artifact;
pub mod catalogue;
pub mod dataset;
pub mod descriptor;
pub mod engine;
pub mod events;
pub mod planner;
pub mod registry;
pub mod stage;
pub mod stages;
pub mod train;
pub mod validation;

pub use artifact::{read_artifact, write_artifact, ArtifactHandle, CalibArtifact, DEFAULT_ARTIFACT_FILE};
pub use catalogue::{default_registry, default_stages};
pub use dataset::{EventSource, JsonLinesDataset, MemorySource};
pub use descriptor::{
    decode_descriptor, select_source, DescriptorSource, DirectoryDescriptorSource,
    LocalAccessConfig, MetadataLocation, SnapshotDescriptorSource, LOCAL_ACCESS_FILE,
    SNAPSHOT_FILE,
};
pub use engine::{ExecutorConfig, PipelineExecutor, WiredStage};
pub use events::{EventEmitter, TrainEvent};
pub use planner::{plan, ActivationDecision, ActivationReason, ExecutionPlan, PlannedStage};
pub use registry::{Predicate, StageDescriptor, StageRegistry, StageRole, StageSwitch, SwitchMode};
pub use stage::{CatalogueWiring, ConsumerHandle, EventMutator, EventReader, StageWiring};
pub use train::{CalibrationTrain, TrainConfig, DEFAULT_INPUT, DEFAULT_METADATA};
pub use validation::{validate_registry, validate_registry_or_raise, Diagnostic, LintRule, Severity};
