//! Registry validation: lint rules and diagnostics.
//!
//! The registry itself only rejects structural collisions at registration
//! time. These rules catch catalogues that register fine but could never
//! produce a correctly ordered plan. Call [`validate_registry`] for advisory
//! diagnostics or [`validate_registry_or_raise`] to fail on the first
//! `Error`-severity issue.

use crate::registry::{StageRegistry, StageRole};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub stage: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, registry: &StageRegistry) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct PrerequisiteExistsRule;
impl LintRule for PrerequisiteExistsRule {
    fn name(&self) -> &str { "prerequisite_exists" }
    fn apply(&self, registry: &StageRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for stage in registry.iter() {
            for prereq in stage.prerequisites() {
                if !registry.has(prereq) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Stage '{}' requires '{prereq}', which is not registered",
                            stage.name()
                        ),
                        stage: Some(stage.name().to_string()),
                        fix: Some(format!("Register '{prereq}' or drop the prerequisite")),
                    });
                }
            }
        }
        diags
    }
}

struct SelfPrerequisiteRule;
impl LintRule for SelfPrerequisiteRule {
    fn name(&self) -> &str { "self_prerequisite" }
    fn apply(&self, registry: &StageRegistry) -> Vec<Diagnostic> {
        registry
            .iter()
            .filter(|s| s.prerequisites().iter().any(|p| p == s.name()))
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Stage '{}' lists itself as a prerequisite", s.name()),
                stage: Some(s.name().to_string()),
                fix: Some("Remove the self reference".into()),
            })
            .collect()
    }
}

struct PrerequisiteOrderRule;
impl LintRule for PrerequisiteOrderRule {
    fn name(&self) -> &str { "prerequisite_order" }
    fn apply(&self, registry: &StageRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (pos, stage) in registry.iter().enumerate() {
            for prereq in stage.prerequisites() {
                let Some(prereq_pos) = registry.position(prereq) else {
                    continue; // PrerequisiteExistsRule reports this
                };
                if prereq_pos > pos {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Stage '{}' is registered before its prerequisite '{prereq}'",
                            stage.name()
                        ),
                        stage: Some(stage.name().to_string()),
                        fix: Some(format!(
                            "Register '{prereq}' before '{}'",
                            stage.name()
                        )),
                    });
                }
            }
        }
        diags
    }
}

struct TerminalNotPrerequisiteRule;
impl LintRule for TerminalNotPrerequisiteRule {
    fn name(&self) -> &str { "terminal_not_prerequisite" }
    fn apply(&self, registry: &StageRegistry) -> Vec<Diagnostic> {
        let Some(terminal) = registry.terminal() else {
            return vec![];
        };
        registry
            .iter()
            .filter(|s| s.role() == StageRole::Normal)
            .filter(|s| s.prerequisites().iter().any(|p| p == terminal.name()))
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Stage '{}' requires terminal-mutating stage '{}', which always runs last",
                    s.name(),
                    terminal.name()
                ),
                stage: Some(s.name().to_string()),
                fix: Some("Drop the prerequisite or make the dependent the terminal stage".into()),
            })
            .collect()
    }
}

fn is_env_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

struct SwitchNameFormatRule;
impl LintRule for SwitchNameFormatRule {
    fn name(&self) -> &str { "switch_name_format" }
    fn apply(&self, registry: &StageRegistry) -> Vec<Diagnostic> {
        registry
            .iter()
            .filter_map(|s| s.switch().map(|sw| (s, sw)))
            .filter(|(_, sw)| !is_env_name(&sw.env))
            .map(|(s, sw)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Stage '{}' uses switch '{}', which is not an upper-case environment variable name",
                    s.name(),
                    sw.env
                ),
                stage: Some(s.name().to_string()),
                fix: Some("Use only A-Z, 0-9 and '_'".into()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate_registry(registry: &StageRegistry) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(PrerequisiteExistsRule),
        Box::new(SelfPrerequisiteRule),
        Box::new(PrerequisiteOrderRule),
        Box::new(TerminalNotPrerequisiteRule),
        Box::new(SwitchNameFormatRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(registry));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_registry_or_raise(
    registry: &StageRegistry,
) -> calibtrain_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate_registry(registry);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(calibtrain_types::CalibError::InvalidRegistry(
            messages.join("; "),
        ));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
