//! Stage consumer traits, the consumer handle, and stage wiring.

use async_trait::async_trait;

use calibtrain_types::{CalibError, Event, Result, RunContext};

use crate::catalogue;
use crate::planner::PlannedStage;
use crate::stages::{MeanVertexCalib, SddAlign, SddSettings, T0Calib, TofCalib, TpcCalib, TrdCalib};

// ---------------------------------------------------------------------------
// Consumer traits
// ---------------------------------------------------------------------------

/// A stage that only reads the shared per-event record.
#[async_trait]
pub trait EventReader: Send {
    fn name(&self) -> &str;

    /// Consume one event.
    async fn process(&mut self, event: &Event) -> Result<()>;

    /// Called once after the last event; the value lands in the artifact.
    async fn finish(&mut self) -> Result<serde_json::Value>;
}

/// A stage that alters the shared per-event record.
#[async_trait]
pub trait EventMutator: Send {
    fn name(&self) -> &str;

    async fn process(&mut self, event: &mut Event) -> Result<()>;

    async fn finish(&mut self) -> Result<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// ConsumerHandle: one wired plan entry
// ---------------------------------------------------------------------------

pub enum ConsumerHandle {
    Reader(Box<dyn EventReader>),
    Mutator(Box<dyn EventMutator>),
}

impl ConsumerHandle {
    pub fn reader(stage: impl EventReader + 'static) -> Self {
        Self::Reader(Box::new(stage))
    }

    pub fn mutator(stage: impl EventMutator + 'static) -> Self {
        Self::Mutator(Box::new(stage))
    }

    pub fn name(&self) -> &str {
        match self {
            ConsumerHandle::Reader(r) => r.name(),
            ConsumerHandle::Mutator(m) => m.name(),
        }
    }

    pub fn is_mutator(&self) -> bool {
        matches!(self, ConsumerHandle::Mutator(_))
    }

    /// Readers get a shared borrow; only the mutator gets `&mut`.
    pub async fn process(&mut self, event: &mut Event) -> Result<()> {
        match self {
            ConsumerHandle::Reader(r) => r.process(event).await,
            ConsumerHandle::Mutator(m) => m.process(event).await,
        }
    }

    pub async fn finish(&mut self) -> Result<serde_json::Value> {
        match self {
            ConsumerHandle::Reader(r) => r.finish().await,
            ConsumerHandle::Mutator(m) => m.finish().await,
        }
    }
}

// ---------------------------------------------------------------------------
// StageWiring
// ---------------------------------------------------------------------------

/// Builds the consumer for a plan entry before streaming begins.
pub trait StageWiring: Send + Sync {
    fn wire(&self, stage: &PlannedStage, context: &RunContext) -> Result<ConsumerHandle>;
}

/// Wiring for the built-in catalogue stages.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogueWiring;

impl StageWiring for CatalogueWiring {
    fn wire(&self, stage: &PlannedStage, context: &RunContext) -> Result<ConsumerHandle> {
        let handle = match stage.name.as_str() {
            catalogue::TPC_CALIB => ConsumerHandle::reader(TpcCalib::new()),
            catalogue::TRD_CALIB => ConsumerHandle::reader(TrdCalib::new()),
            catalogue::T0_CALIB => ConsumerHandle::reader(T0Calib::new()),
            catalogue::MEAN_VERTEX => ConsumerHandle::reader(MeanVertexCalib::new()),
            catalogue::SDD_ALIGN => {
                ConsumerHandle::reader(SddAlign::new(SddSettings::for_run(context)))
            }
            catalogue::TOF_CALIB => ConsumerHandle::mutator(TofCalib::new()),
            other => {
                return Err(CalibError::Other(format!(
                    "No stage implementation named '{other}'"
                )))
            }
        };
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
