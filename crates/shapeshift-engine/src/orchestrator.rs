//! Project orchestrator: validates, orders and runs entities, then hands the
//! resulting tables to a dispatcher.

use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use shapeshift_types::RunReport;

use crate::config::{validate_project, ProjectSpec};
use crate::constraints::ValidatorSet;
use crate::dispatch::{dispatch_all, DispatchResult, DispatchTarget};
use crate::error::PipelineError;
use crate::graph::DependencyGraph;
use crate::pipeline::EntityPipeline;
use crate::registry::Registry;
use crate::result::{CheckResult, RunOutput};
use crate::store::EntityTableStore;

/// Validate a project and compute its processing order without loading data.
pub fn check_project(project: &ProjectSpec, registry: &Registry) -> CheckResult {
    tracing::info!(project = %project.name, "Checking project configuration");

    let mut result = CheckResult {
        project: project.name.clone(),
        entity_count: project.entities.len(),
        ..CheckResult::default()
    };

    if let Err(e) = validate_project(project, registry) {
        match e {
            PipelineError::Configuration { issues, .. } => result.issues.extend(issues),
            other => result.issues.push(other.to_string()),
        }
    }

    match DependencyGraph::build(&project.entities).and_then(|g| g.processing_order()) {
        Ok(order) => result.processing_order = order.into_vec(),
        Err(e) => result.issues.push(e.to_string()),
    }

    tracing::info!(
        project = %project.name,
        issues = result.issues.len(),
        "Check complete"
    );
    result
}

/// Run every entity of `project`, or only `target` and its dependencies.
///
/// # Errors
///
/// Returns the first fatal error; no further entities are processed after it.
pub fn run_project(
    project: &ProjectSpec,
    registry: &Registry,
    target: Option<&str>,
) -> Result<RunOutput, PipelineError> {
    run_project_with(project, registry, &ValidatorSet::standard(), target)
}

/// [`run_project`] with a caller-supplied set of constraint checks.
///
/// # Errors
///
/// Returns the first fatal error; no further entities are processed after it.
pub fn run_project_with(
    project: &ProjectSpec,
    registry: &Registry,
    validators: &ValidatorSet,
    target: Option<&str>,
) -> Result<RunOutput, PipelineError> {
    let started_at = Utc::now();
    let start = Instant::now();
    tracing::info!(project = %project.name, target = ?target, "Starting run");

    validate_project(project, registry)?;
    let graph = DependencyGraph::build(&project.entities)?;
    let order = match target {
        Some(name) => graph.subgraph_for(name)?,
        None => graph.processing_order()?,
    };
    tracing::debug!(order = ?order.names(), "Processing order resolved");

    let pipeline = EntityPipeline::new(registry, validators, &project.base_dir);
    let mut store = EntityTableStore::new();
    let mut entities = Vec::with_capacity(order.len());

    for name in order.iter() {
        let Some(spec) = project.entity(name) else {
            return Err(anyhow::anyhow!("entity '{name}' is ordered but not defined").into());
        };
        let (table, report) = pipeline.process(spec, &store).inspect_err(|e| {
            tracing::error!(
                entity = name,
                phase = ?e.phase(),
                category = %e.category(),
                "Entity failed"
            );
        })?;
        store.insert(table)?;
        entities.push(report);
    }

    let duration_secs = start.elapsed().as_secs_f64();
    let report = RunReport {
        project: project.name.clone(),
        processing_order: order.into_vec(),
        entities,
        started_at,
        duration_secs,
    };
    tracing::info!(
        project = %project.name,
        entities = report.entities.len(),
        warnings = report.warning_count(),
        duration_secs,
        "Run complete"
    );

    Ok(RunOutput {
        tables: store.into_tables(),
        report,
    })
}

/// Write every table of a run with the dispatcher registered as `tag`.
///
/// # Errors
///
/// Fails only if the dispatcher cannot be built; per-entity write failures
/// are recorded in the returned [`DispatchResult`].
pub fn dispatch_tables(
    output: &RunOutput,
    registry: &Registry,
    tag: &str,
    target: &DispatchTarget,
) -> Result<DispatchResult> {
    let dispatcher = registry.dispatcher(tag, target)?;
    let result = dispatch_all(dispatcher.as_ref(), &output.tables);
    tracing::info!(
        format = tag,
        output_dir = %target.output_dir.display(),
        rows = result.rows_written(),
        failures = result.failures().count(),
        "Dispatch complete"
    );
    Ok(result)
}
