//! Stage descriptors and the append-only stage registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use calibtrain_types::{CalibError, Result, RunContext, Subsystem};
use serde::{Deserialize, Serialize};

use crate::planner::{plan, ExecutionPlan};

// ---------------------------------------------------------------------------
// Descriptor types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// Reads the shared per-event record only.
    Normal,
    /// Alters the shared per-event record; always placed last.
    TerminalMutating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchMode {
    /// Stage stays off unless the switch is set to a positive value.
    OptIn,
    /// A positive value turns the stage off regardless of its predicate.
    OptOut,
}

/// An environment switch bound to exactly one stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageSwitch {
    pub env: String,
    pub mode: SwitchMode,
}

/// Activation predicate evaluated against the run context.
pub type Predicate = Arc<dyn Fn(&RunContext) -> Result<bool> + Send + Sync>;

/// A registered stage: name, activation predicate, prerequisites, and role.
#[derive(Clone)]
pub struct StageDescriptor {
    name: String,
    predicate: Predicate,
    prerequisites: Vec<String>,
    role: StageRole,
    switch: Option<StageSwitch>,
}

impl StageDescriptor {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&RunContext) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            prerequisites: Vec::new(),
            role: StageRole::Normal,
            switch: None,
        }
    }

    /// Active whenever `subsystem` contributed data to the run.
    pub fn when_present(name: impl Into<String>, subsystem: Subsystem) -> Self {
        Self::new(name, move |ctx: &RunContext| Ok(ctx.has(subsystem)))
    }

    /// Predicate that always holds; combine with [`opt_in`](Self::opt_in).
    pub fn always(name: impl Into<String>) -> Self {
        Self::new(name, |_: &RunContext| Ok(true))
    }

    /// Declare a prerequisite. Duplicates are ignored.
    #[must_use]
    pub fn requires(mut self, stage: impl Into<String>) -> Self {
        let stage = stage.into();
        if !self.prerequisites.contains(&stage) {
            self.prerequisites.push(stage);
        }
        self
    }

    #[must_use]
    pub fn terminal_mutating(mut self) -> Self {
        self.role = StageRole::TerminalMutating;
        self
    }

    #[must_use]
    pub fn opt_in(mut self, env: impl Into<String>) -> Self {
        self.switch = Some(StageSwitch {
            env: env.into(),
            mode: SwitchMode::OptIn,
        });
        self
    }

    #[must_use]
    pub fn opt_out(mut self, env: impl Into<String>) -> Self {
        self.switch = Some(StageSwitch {
            env: env.into(),
            mode: SwitchMode::OptOut,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prerequisites(&self) -> &[String] {
        &self.prerequisites
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn switch(&self) -> Option<&StageSwitch> {
        self.switch.as_ref()
    }

    /// Run the raw predicate, ignoring any switch.
    pub fn evaluate(&self, context: &RunContext) -> Result<bool> {
        (self.predicate)(context)
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("prerequisites", &self.prerequisites)
            .field("role", &self.role)
            .field("switch", &self.switch)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StageRegistry
// ---------------------------------------------------------------------------

/// Ordered, append-only catalogue of stages.
///
/// Registration order is the execution order, except that the single
/// terminal-mutating stage is always moved to the end of a plan.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDescriptor>,
    index: HashMap<String, usize>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    ///
    /// Fails on a duplicate name, a second terminal-mutating stage, or a
    /// switch already bound to another stage.
    pub fn register(&mut self, descriptor: StageDescriptor) -> Result<()> {
        if self.index.contains_key(descriptor.name()) {
            return Err(CalibError::DuplicateStageName {
                name: descriptor.name().to_string(),
            });
        }
        if descriptor.role() == StageRole::TerminalMutating {
            if let Some(existing) = self.terminal() {
                return Err(CalibError::DuplicateTerminalStage {
                    existing: existing.name().to_string(),
                    rejected: descriptor.name().to_string(),
                });
            }
        }
        if let Some(switch) = descriptor.switch() {
            let owner = self
                .stages
                .iter()
                .find(|d| d.switch().is_some_and(|s| s.env == switch.env));
            if let Some(owner) = owner {
                return Err(CalibError::DuplicateSwitch {
                    switch: switch.env.clone(),
                    stage: owner.name().to_string(),
                });
            }
        }

        tracing::debug!(stage = %descriptor.name(), role = ?descriptor.role(), "Stage registered");
        self.index
            .insert(descriptor.name().to_string(), self.stages.len());
        self.stages.push(descriptor);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, descriptor: StageDescriptor) -> Result<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&StageDescriptor> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Registration position of a stage.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The terminal-mutating stage, if one is registered.
    pub fn terminal(&self) -> Option<&StageDescriptor> {
        self.stages
            .iter()
            .find(|d| d.role() == StageRole::TerminalMutating)
    }

    /// Every switch name bound to a stage, in registration order.
    pub fn switch_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|d| d.switch().map(|s| s.env.as_str()))
            .collect()
    }

    /// Plan a run against this registry. See [`plan`].
    pub fn plan(&self, context: &RunContext) -> ExecutionPlan {
        plan(context, self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
