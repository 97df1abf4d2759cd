//! Core engine for Shapeshift project runs: dependency ordering, the
//! per-entity pipeline, identity resolution and constraint checks.

pub mod config;
pub mod constraints;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod identity;
pub mod loader;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod result;
pub mod store;
pub mod table;

// Re-export public API for convenience
pub use config::{parse_project, parse_project_str, validate_project, ProjectSpec};
pub use constraints::{ConstraintCheck, ValidatorSet};
pub use dispatch::{DispatchResult, DispatchTarget, Dispatcher};
pub use error::{ErrorCategory, PipelineError};
pub use graph::{DependencyGraph, ProcessingOrder};
pub use loader::{LoadRequest, Loader};
pub use orchestrator::{check_project, dispatch_tables, run_project, run_project_with};
pub use registry::Registry;
pub use result::{CheckResult, RunOutput};
pub use table::EntityTable;
