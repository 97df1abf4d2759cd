//! Link phase: resolve each foreign key against its already-processed parent.

use arrow::array::RecordBatch;
use shapeshift_types::{Checkpoint, EntitySpec, ForeignKeySpec, LinkReport, Phase, Violation};

use crate::constraints::{CheckContext, ValidatorSet};
use crate::error::{ConstraintViolationError, PipelineError};
use crate::identity;
use crate::store::EntityTableStore;
use crate::table::{self, EntityTable};

/// Result of linking all foreign keys of one entity.
pub(crate) struct Linked {
    pub batch: RecordBatch,
    pub columns: Vec<String>,
    pub reports: Vec<LinkReport>,
    pub warnings: Vec<Violation>,
}

/// Output column name for a foreign key.
pub fn fk_column(fk: &ForeignKeySpec, parent_public_id: Option<&str>) -> String {
    fk.alias
        .clone()
        .or_else(|| parent_public_id.map(str::to_string))
        .unwrap_or_else(|| format!("{}_id", fk.entity))
}

pub(crate) fn run(
    spec: &EntitySpec,
    batch: RecordBatch,
    store: &EntityTableStore,
    validators: &ValidatorSet,
) -> Result<Linked, PipelineError> {
    let entity = spec.name.as_str();
    let mut linked = Linked {
        batch,
        columns: Vec::with_capacity(spec.foreign_keys.len()),
        reports: Vec::with_capacity(spec.foreign_keys.len()),
        warnings: Vec::new(),
    };

    for fk in &spec.foreign_keys {
        let parent = store.require(&fk.entity)?;
        let column = fk_column(fk, parent.identity.public_id.as_deref());
        if table::has_column(&linked.batch, &column) {
            return Err(PipelineError::config(
                entity,
                Phase::Link,
                format!(
                    "foreign key to '{}' would write column '{column}', which already exists; set an alias",
                    fk.entity
                ),
            ));
        }
        let (batch, report, warnings) =
            link_one(entity, &linked.batch, parent, fk, &column, validators)?;
        tracing::debug!(
            entity,
            target = %fk.entity,
            column = %column,
            matched = report.matched,
            unmatched = report.unmatched,
            "Linked foreign key"
        );
        linked.batch = batch;
        linked.columns.push(column);
        linked.reports.push(report);
        linked.warnings.extend(warnings);
    }
    Ok(linked)
}

fn link_one(
    entity: &str,
    child: &RecordBatch,
    parent: &EntityTable,
    fk: &ForeignKeySpec,
    column: &str,
    validators: &ValidatorSet,
) -> Result<(RecordBatch, LinkReport, Vec<Violation>), PipelineError> {
    let remote = identity::remote_keys(fk, parent);
    let mut ctx = CheckContext {
        entity,
        fk,
        parent,
        remote_keys: &remote,
        child,
        linked: None,
        column,
    };

    let pre = validators.run(Checkpoint::PreMerge, &ctx);
    fail_on(entity, pre.fatal)?;

    let (batch, outcome) = identity::resolve_foreign_key(entity, child, parent, fk, column)?;

    ctx.linked = Some(&batch);
    let post = validators.run(Checkpoint::PostMerge, &ctx);
    fail_on(entity, post.fatal)?;

    let mut warnings = pre.warnings;
    warnings.extend(post.warnings);
    for warning in &warnings {
        tracing::warn!(entity, check = %warning.check, "{warning}");
    }
    Ok((batch, outcome.report(&fk.entity, column), warnings))
}

fn fail_on(entity: &str, violations: Vec<Violation>) -> Result<(), PipelineError> {
    if violations.is_empty() {
        return Ok(());
    }
    Err(ConstraintViolationError {
        entity: entity.to_string(),
        phase: Phase::Link,
        violations,
    }
    .into())
}
