use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use shapeshift_engine::dispatch::DispatchStatus;
use shapeshift_engine::{dispatch_tables, parse_project, run_project, DispatchTarget, Registry};

/// Execute the `run` command: parse, run and dispatch a project.
pub fn execute(
    project_path: &Path,
    entity: Option<&str>,
    output_dir: &Path,
    format: &str,
    report_path: Option<&Path>,
) -> Result<()> {
    // 1. Parse project YAML
    let project = parse_project(project_path)
        .with_context(|| format!("Failed to parse project: {}", project_path.display()))?;
    let registry = Registry::builtin();

    tracing::info!(
        project = %project.name,
        entities = project.entities.len(),
        format,
        "Project loaded"
    );

    // 2. Run
    let output = run_project(&project, &registry, entity)?;

    // 3. Dispatch
    let target = DispatchTarget::new(output_dir);
    let dispatched = dispatch_tables(&output, &registry, format, &target)?;

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&output.report)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
    }

    let report = &output.report;
    println!("Project '{}' completed.", report.project);
    println!("  Entities:        {}", report.entities.len());
    println!("  Warnings:        {}", report.warning_count());
    println!("  Duration:        {:.2}s", report.duration_secs);
    println!("  Output:          {} ({format})", output_dir.display());
    for entity in &report.entities {
        let status = dispatched
            .outcomes
            .iter()
            .find(|o| o.entity == entity.entity)
            .map_or("not dispatched".to_string(), |o| match &o.status {
                DispatchStatus::Written { rows } => format!("{rows} row(s) written"),
                DispatchStatus::Failed { error } => format!("FAILED: {error}"),
            });
        println!(
            "    {:<20} extracted {:>6}  final {:>6}  {status}",
            entity.entity, entity.rows_extracted, entity.rows_final
        );
        for warning in &entity.warnings {
            println!("      warning: {warning}");
        }
    }

    if !dispatched.is_success() {
        anyhow::bail!(
            "{} entity table(s) failed to dispatch",
            dispatched.failures().count()
        );
    }
    Ok(())
}
