//! Run and check result types.

use shapeshift_types::RunReport;

use crate::table::EntityTable;

/// Tables and diagnostics of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Processed tables, in processing order.
    pub tables: Vec<EntityTable>,
    pub report: RunReport,
}

impl RunOutput {
    pub fn table(&self, name: &str) -> Option<&EntityTable> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Result of checking a project without loading any data.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub project: String,
    pub entity_count: usize,
    /// Empty when the graph could not be ordered.
    pub processing_order: Vec<String>,
    pub issues: Vec<String>,
}

impl CheckResult {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}
