//! Stage ordering engine.
//!
//! [`plan`] turns a run context and the stage registry into an
//! [`ExecutionPlan`]:
//!
//! 1. evaluate every stage in registration order (switches first, then the
//!    predicate; a failing predicate means "not activated"),
//! 2. prune candidates whose prerequisites are not all candidates, repeating
//!    until nothing changes,
//! 3. keep registration order for normal stages and append the
//!    terminal-mutating stage, if it survived.
//!
//! Planning is pure: the same context and registry always give the same plan.

use std::collections::{HashMap, HashSet};
use std::fmt;

use calibtrain_types::{CalibError, RunContext};
use serde::{Deserialize, Serialize};

use crate::registry::{StageDescriptor, StageRegistry, StageRole, SwitchMode};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why a stage was or was not activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationReason {
    PredicateTrue,
    PredicateFalse,
    SwitchedOff { switch: String },
    SwitchNotSet { switch: String },
    PredicateError { message: String },
    MissingPrerequisite { prerequisite: String },
}

impl fmt::Display for ActivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationReason::PredicateTrue => f.write_str("predicate true"),
            ActivationReason::PredicateFalse => f.write_str("predicate false"),
            ActivationReason::SwitchedOff { switch } => write!(f, "disabled by {switch}"),
            ActivationReason::SwitchNotSet { switch } => write!(f, "{switch} not set"),
            ActivationReason::PredicateError { message } => {
                write!(f, "predicate error: {message}")
            }
            ActivationReason::MissingPrerequisite { prerequisite } => {
                write!(f, "prerequisite '{prerequisite}' inactive")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationDecision {
    pub stage: String,
    pub activated: bool,
    pub reason: ActivationReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    pub name: String,
    pub role: StageRole,
}

/// Ordered set of stages to run for one pass over a dataset, plus the
/// per-stage decisions that produced it (in registration order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub run_id: u32,
    pub stages: Vec<PlannedStage>,
    pub decisions: Vec<ActivationDecision>,
}

impl ExecutionPlan {
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s.name == stage)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn terminal(&self) -> Option<&PlannedStage> {
        self.stages
            .iter()
            .find(|s| s.role == StageRole::TerminalMutating)
    }

    pub fn decision(&self, stage: &str) -> Option<&ActivationDecision> {
        self.decisions.iter().find(|d| d.stage == stage)
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Evaluate switches and the predicate of one stage.
fn evaluate(descriptor: &StageDescriptor, context: &RunContext) -> ActivationReason {
    if let Some(switch) = descriptor.switch() {
        let positive = context.overrides.is_positive(&switch.env);
        match switch.mode {
            SwitchMode::OptOut if positive => {
                return ActivationReason::SwitchedOff {
                    switch: switch.env.clone(),
                }
            }
            SwitchMode::OptIn if !positive => {
                return ActivationReason::SwitchNotSet {
                    switch: switch.env.clone(),
                }
            }
            _ => {}
        }
    }

    match descriptor.evaluate(context) {
        Ok(true) => ActivationReason::PredicateTrue,
        Ok(false) => ActivationReason::PredicateFalse,
        Err(e) => {
            let err = CalibError::StagePredicateError {
                stage: descriptor.name().to_string(),
                message: e.to_string(),
            };
            tracing::warn!(run = context.run_id, stage = %descriptor.name(), error = %err, "Stage not activated");
            ActivationReason::PredicateError {
                message: e.to_string(),
            }
        }
    }
}

/// Drop candidates whose prerequisites are not all candidates, until a
/// fixed point. Returns the first missing prerequisite of each dropped stage.
fn prune<'a>(candidates: &mut Vec<&'a StageDescriptor>) -> HashMap<&'a str, String> {
    let mut removed = HashMap::new();
    loop {
        let names: HashSet<&str> = candidates.iter().map(|&d| d.name()).collect();
        let before = candidates.len();
        candidates.retain(|&d| {
            match d
                .prerequisites()
                .iter()
                .find(|p| !names.contains(p.as_str()))
            {
                Some(missing) => {
                    removed.insert(d.name(), missing.clone());
                    false
                }
                None => true,
            }
        });
        if candidates.len() == before {
            return removed;
        }
    }
}

/// Compute the execution plan for `context`.
///
/// Never fails: a stage whose predicate errors is simply not activated.
/// An empty plan is valid.
pub fn plan(context: &RunContext, registry: &StageRegistry) -> ExecutionPlan {
    let mut reasons: Vec<(&StageDescriptor, ActivationReason)> = registry
        .iter()
        .map(|d| (d, evaluate(d, context)))
        .collect();

    let mut candidates: Vec<&StageDescriptor> = reasons
        .iter()
        .filter(|(_, r)| *r == ActivationReason::PredicateTrue)
        .map(|&(d, _)| d)
        .collect();

    let removed = prune(&mut candidates);
    for (d, reason) in reasons.iter_mut() {
        if let Some(missing) = removed.get(d.name()) {
            tracing::debug!(stage = %d.name(), prerequisite = %missing, "Stage pruned");
            *reason = ActivationReason::MissingPrerequisite {
                prerequisite: missing.clone(),
            };
        }
    }

    let (normal, terminal): (Vec<&StageDescriptor>, Vec<&StageDescriptor>) = candidates
        .into_iter()
        .partition(|d| d.role() == StageRole::Normal);

    let stages = normal
        .into_iter()
        .chain(terminal)
        .map(|d| PlannedStage {
            name: d.name().to_string(),
            role: d.role(),
        })
        .collect();

    let decisions = reasons
        .into_iter()
        .map(|(d, reason)| ActivationDecision {
            stage: d.name().to_string(),
            activated: reason == ActivationReason::PredicateTrue,
            reason,
        })
        .collect();

    ExecutionPlan {
        run_id: context.run_id,
        stages,
        decisions,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
