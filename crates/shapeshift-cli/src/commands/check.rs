use std::path::Path;

use anyhow::{Context, Result};

use shapeshift_engine::{check_project, parse_project, Registry};

/// Execute the `check` command: validate configuration and dependency order.
pub fn execute(project_path: &Path) -> Result<()> {
    let project = parse_project(project_path)
        .with_context(|| format!("Failed to parse project: {}", project_path.display()))?;
    println!("Project file:       OK");

    let result = check_project(&project, &Registry::builtin());
    println!("Entities:           {}", result.entity_count);

    if result.processing_order.is_empty() {
        println!("Dependency graph:   FAILED");
    } else {
        println!("Dependency graph:   OK");
    }

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        println!("\nIssues:");
        for issue in &result.issues {
            println!("  - {issue}");
        }
        anyhow::bail!("{} issue(s) found in '{}'", result.issues.len(), result.project)
    }
}
