//! Pipeline error taxonomy.
//!
//! Every variant names the entity and phase it came from where one exists, and
//! carries enough structured context (columns, counts, sample values) to act
//! on without re-running.

use std::fmt;

use shapeshift_types::{Phase, Violation};

use crate::graph::DependencyKind;

/// Number of offending values kept on link errors and violations.
pub const SAMPLE_LIMIT: usize = 5;

/// Broad classification of a pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    CircularDependency,
    Loader,
    Link,
    ConstraintViolation,
    Infrastructure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::CircularDependency => "circular_dependency",
            Self::Loader => "loader",
            Self::Link => "link",
            Self::ConstraintViolation => "constraint_violation",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Fatal error of a run. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed or inconsistent configuration.
    #[error("[configuration] {}", format_issues(.entity, .phase, .issues))]
    Configuration {
        entity: Option<String>,
        phase: Option<Phase>,
        issues: Vec<String>,
    },
    /// An entity references a name that is not in the project.
    #[error("[configuration] entity '{entity}' references unknown entity '{reference}' via {via}")]
    MissingDependency {
        entity: String,
        reference: String,
        via: DependencyKind,
    },
    /// The entity graph has a cycle; `cycle` lists it in graph order.
    #[error("[circular_dependency] {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<String> },
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    ConstraintViolation(#[from] ConstraintViolationError),
    /// Unexpected failure inside the engine (Arrow kernels, store misuse).
    #[error("[infrastructure] {}{cause:#}", format_scope(.entity, .phase))]
    Infrastructure {
        entity: Option<String>,
        phase: Option<Phase>,
        cause: anyhow::Error,
    },
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure {
            entity: None,
            phase: None,
            cause: e,
        }
    }
}

impl PipelineError {
    /// Configuration error with a single issue.
    pub fn config(entity: &str, phase: Phase, issue: impl Into<String>) -> Self {
        Self::Configuration {
            entity: Some(entity.to_string()),
            phase: Some(phase),
            issues: vec![issue.into()],
        }
    }

    /// Fill in the entity and phase of an infrastructure error that has none.
    /// Other variants already carry their own scope and are returned as is.
    pub fn in_phase(self, entity: &str, phase: Phase) -> Self {
        match self {
            Self::Infrastructure {
                entity: scope_entity,
                phase: scope_phase,
                cause,
            } => Self::Infrastructure {
                entity: scope_entity.or_else(|| Some(entity.to_string())),
                phase: scope_phase.or(Some(phase)),
                cause,
            },
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::MissingDependency { .. } => {
                ErrorCategory::Configuration
            }
            Self::CircularDependency { .. } => ErrorCategory::CircularDependency,
            Self::Loader(_) => ErrorCategory::Loader,
            Self::Link(_) => ErrorCategory::Link,
            Self::ConstraintViolation(_) => ErrorCategory::ConstraintViolation,
            Self::Infrastructure { .. } => ErrorCategory::Infrastructure,
        }
    }

    /// Entity the error belongs to, if any.
    pub fn entity(&self) -> Option<&str> {
        match self {
            Self::Configuration { entity, .. } => entity.as_deref(),
            Self::MissingDependency { entity, .. } => Some(entity),
            Self::Infrastructure { entity, .. } => entity.as_deref(),
            Self::CircularDependency { .. } => None,
            Self::Loader(e) => Some(&e.entity),
            Self::Link(e) => Some(&e.entity),
            Self::ConstraintViolation(e) => Some(&e.entity),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Configuration { phase, .. } => *phase,
            Self::MissingDependency { .. } | Self::CircularDependency { .. } => {
                Some(Phase::Resolve)
            }
            Self::Loader(_) => Some(Phase::Extract),
            Self::Link(_) => Some(Phase::Link),
            Self::ConstraintViolation(e) => Some(e.phase),
            Self::Infrastructure { phase, .. } => *phase,
        }
    }
}

fn format_scope(entity: &Option<String>, phase: &Option<Phase>) -> String {
    let mut prefix = String::new();
    if let Some(entity) = entity {
        prefix.push_str(&format!("entity '{entity}' "));
    }
    if let Some(phase) = phase {
        prefix.push_str(&format!("({phase}) "));
    }
    prefix
}

fn format_issues(entity: &Option<String>, phase: &Option<Phase>, issues: &[String]) -> String {
    let prefix = format_scope(entity, phase);
    match issues {
        [single] => format!("{prefix}{single}"),
        _ => format!("{prefix}{} issue(s):\n  - {}", issues.len(), issues.join("\n  - ")),
    }
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("cycle detected: {} -> {first}", cycle.join(" -> ")),
        None => "cycle detected".to_string(),
    }
}

/// Extraction failed for an entity.
#[derive(Debug, thiserror::Error)]
#[error("[loader] entity '{entity}' failed to load from {source_desc}: {cause:#}")]
pub struct LoaderError {
    pub entity: String,
    /// Loader tag plus a short description of the source.
    pub source_desc: String,
    #[source]
    pub cause: anyhow::Error,
}

/// Why a foreign key could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailure {
    /// Child rows whose key matched no parent on a required foreign key.
    Unmatched,
    /// Child rows whose key matched more than one parent.
    Ambiguous,
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmatched => f.write_str("unmatched"),
            Self::Ambiguous => f.write_str("ambiguous"),
        }
    }
}

/// A foreign key could not be resolved against its parent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "[link] entity '{entity}' foreign key to '{target}' on [{}]: {count} {failure} row(s); sample values: [{}]",
    .local_keys.join(", "),
    .sample.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>().join(", ")
)]
pub struct LinkError {
    pub entity: String,
    pub target: String,
    pub local_keys: Vec<String>,
    pub failure: LinkFailure,
    pub count: usize,
    pub sample: Vec<String>,
}

/// One or more fatal constraint violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "[constraint_violation] entity '{entity}' ({phase}): {}",
    .violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
)]
pub struct ConstraintViolationError {
    pub entity: String,
    pub phase: Phase,
    pub violations: Vec<Violation>,
}
