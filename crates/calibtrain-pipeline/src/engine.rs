//! Pipeline executor.
//!
//! Implements the run lifecycle: wire, stream, finish, clean up, write.
//! Wiring happens before any input is read; a wiring failure aborts the run
//! with no artifact. Streaming is one sequential pass in which each event
//! visits every consumer in plan order before the next event is fetched.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use calibtrain_types::{CalibError, Result, RunContext};

use crate::artifact::{write_artifact, ArtifactHandle, CalibArtifact, DEFAULT_ARTIFACT_FILE};
use crate::dataset::EventSource;
use crate::events::{EventEmitter, TrainEvent};
use crate::planner::ExecutionPlan;
use crate::registry::StageRole;
use crate::stage::{CatalogueWiring, ConsumerHandle, EventReader, StageWiring};
use crate::stages::CleanGeometry;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Configuration for the executor's output.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub output_dir: PathBuf,
    pub output_file: String,
    /// Present per-event auxiliary data to the stages. When off, friends
    /// are stripped before the first consumer sees the event.
    pub read_friends: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            output_file: DEFAULT_ARTIFACT_FILE.to_string(),
            read_friends: true,
        }
    }
}

/// Drives one pass of a dataset through the wired stages of a plan.
pub struct PipelineExecutor {
    config: ExecutorConfig,
    wiring: Arc<dyn StageWiring>,
    emitter: EventEmitter,
}

/// A wired plan entry. Outputs and failures are keyed by the plan name,
/// not by whatever the consumer calls itself.
pub struct WiredStage {
    pub name: String,
    pub handle: ConsumerHandle,
}

struct StreamSummary {
    events: u64,
    outputs: BTreeMap<String, serde_json::Value>,
}

fn stage_failed(stage: &str, event: u64, err: CalibError) -> CalibError {
    match err {
        e @ CalibError::StageFailed { .. } => e,
        other => CalibError::StageFailed {
            stage: stage.to_string(),
            event,
            message: other.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    /// Create an executor with the given stage wiring.
    pub fn new(config: ExecutorConfig, wiring: Arc<dyn StageWiring>) -> Self {
        Self {
            config,
            wiring,
            emitter: EventEmitter::default(),
        }
    }

    /// Create an executor wired to the built-in catalogue stages.
    pub fn with_catalogue(config: ExecutorConfig) -> Self {
        Self::new(config, Arc::new(CatalogueWiring))
    }

    /// Publish progress on `emitter` instead of a private channel.
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Wire every plan entry, in plan order.
    ///
    /// Any failure, including a consumer whose kind does not match the
    /// stage's role, is reported as `InitializationFailed`.
    pub fn wire(
        &self,
        plan: &ExecutionPlan,
        context: &RunContext,
    ) -> Result<Vec<WiredStage>> {
        let mut consumers = Vec::with_capacity(plan.len());
        for stage in &plan.stages {
            let handle = self.wiring.wire(stage, context).map_err(|e| {
                CalibError::InitializationFailed {
                    stage: stage.name.clone(),
                    message: e.to_string(),
                }
            })?;
            let expects_mutator = stage.role == StageRole::TerminalMutating;
            if handle.is_mutator() != expects_mutator {
                return Err(CalibError::InitializationFailed {
                    stage: stage.name.clone(),
                    message: format!(
                        "role {:?} wired to a {}",
                        stage.role,
                        if handle.is_mutator() { "mutator" } else { "reader" }
                    ),
                });
            }
            tracing::debug!(stage = %stage.name, role = ?stage.role, "Stage wired");
            self.emitter.emit(TrainEvent::StageWired {
                stage: stage.name.clone(),
                role: stage.role,
            });
            consumers.push(WiredStage {
                name: stage.name.clone(),
                handle,
            });
        }
        Ok(consumers)
    }

    /// Run the plan over `source` and write the artifact.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        context: &RunContext,
        source: &mut dyn EventSource,
    ) -> Result<ArtifactHandle> {
        let mut consumers = self.wire(plan, context)?;

        self.emitter.emit(TrainEvent::StreamStarted {
            run_id: context.run_id,
            stage_count: consumers.len(),
        });
        let started = Instant::now();
        let streamed = stream(&mut consumers, source, self.config.read_friends).await;

        // Cleanup runs whether or not the stream succeeded.
        let mut cleanup = CleanGeometry::new();
        let cleanup_output = cleanup.finish().await;
        self.emitter.emit(TrainEvent::CleanupCompleted {
            stage: cleanup.name().to_string(),
        });

        let summary = streamed?;
        let cleanup_output = cleanup_output?;
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(run = context.run_id, events = summary.events, elapsed_ms = duration_ms, "Stream completed");
        self.emitter.emit(TrainEvent::StreamCompleted {
            run_id: context.run_id,
            events: summary.events,
            duration_ms,
        });

        let execution_id = uuid::Uuid::new_v4();
        let artifact = CalibArtifact {
            execution_id: execution_id.to_string(),
            run_id: context.run_id,
            created_at: chrono::Utc::now(),
            detectors: context.mask.names().into_iter().map(String::from).collect(),
            plan: plan.names().into_iter().map(String::from).collect(),
            events_processed: summary.events,
            stages: summary.outputs,
            cleanup: cleanup_output,
        };
        let path = write_artifact(&artifact, &self.config.output_dir, &self.config.output_file).await?;
        tracing::info!(run = context.run_id, path = %path.display(), "Artifact written");
        self.emitter.emit(TrainEvent::ArtifactWritten {
            run_id: context.run_id,
            path: path.display().to_string(),
        });

        Ok(ArtifactHandle {
            path,
            execution_id,
            events_processed: summary.events,
        })
    }
}

/// Present every event to every consumer in order, then finish them.
async fn stream(
    consumers: &mut [WiredStage],
    source: &mut dyn EventSource,
    read_friends: bool,
) -> Result<StreamSummary> {
    let mut events = 0u64;
    while let Some(mut event) = source.next_event().await? {
        if !read_friends {
            event.friend = None;
        }
        let index = event.index;
        for stage in consumers.iter_mut() {
            if let Err(e) = stage.handle.process(&mut event).await {
                return Err(stage_failed(&stage.name, index, e));
            }
        }
        events += 1;
    }

    let mut outputs = BTreeMap::new();
    for stage in consumers.iter_mut() {
        let output = match stage.handle.finish().await {
            Ok(output) => output,
            Err(e) => return Err(stage_failed(&stage.name, events, e)),
        };
        outputs.insert(stage.name.clone(), output);
    }
    Ok(StreamSummary { events, outputs })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
