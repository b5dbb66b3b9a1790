//! Train event system for observability.
//!
//! Emits [`TrainEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, monitoring, tests) can follow a run without
//! coupling to the executor internals.

use serde::{Deserialize, Serialize};

use crate::registry::StageRole;

/// Events emitted during a calibration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrainEvent {
    PlanComputed {
        run_id: u32,
        stages: Vec<String>,
    },
    StageWired {
        stage: String,
        role: StageRole,
    },
    StreamStarted {
        run_id: u32,
        stage_count: usize,
    },
    StreamCompleted {
        run_id: u32,
        events: u64,
        duration_ms: u64,
    },
    CleanupCompleted {
        stage: String,
    },
    ArtifactWritten {
        run_id: u32,
        path: String,
    },
    RunFailed {
        run_id: u32,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<TrainEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: TrainEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TrainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
