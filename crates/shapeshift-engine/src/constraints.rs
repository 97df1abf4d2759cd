//! Constraint checks run around each foreign-key join.
//!
//! Checks are registered on a [`ValidatorSet`] and tagged with the checkpoint
//! they belong to. Whether a finding is fatal is decided by the set, not the
//! check: pre-merge findings are fatal when the cardinality needs a unique
//! parent, post-merge findings are fatal unless the foreign key is lenient.

use std::collections::HashMap;

use arrow::array::{Array, RecordBatch};
use shapeshift_types::{Cardinality, Checkpoint, ForeignKeySpec, Violation};

use crate::error::SAMPLE_LIMIT;
use crate::table::{self, EntityTable};

/// Everything a check may look at for one foreign key.
pub struct CheckContext<'a> {
    /// Entity being processed (the child).
    pub entity: &'a str,
    pub fk: &'a ForeignKeySpec,
    pub parent: &'a EntityTable,
    /// Effective parent key columns.
    pub remote_keys: &'a [String],
    /// Child rows before the join.
    pub child: &'a RecordBatch,
    /// Child rows after the join; `None` at the pre-merge checkpoint.
    pub linked: Option<&'a RecordBatch>,
    /// Foreign-key output column.
    pub column: &'a str,
}

pub trait ConstraintCheck: Send + Sync {
    fn name(&self) -> &'static str;

    fn checkpoint(&self) -> Checkpoint;

    /// Whether the check is relevant for a declared cardinality.
    fn applies_to(&self, _how: Cardinality) -> bool {
        true
    }

    fn check(&self, ctx: &CheckContext<'_>) -> Vec<Violation>;
}

/// Violations of one checkpoint, split by severity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckpointOutcome {
    pub fatal: Vec<Violation>,
    pub warnings: Vec<Violation>,
}

pub struct ValidatorSet {
    checks: Vec<Box<dyn ConstraintCheck>>,
}

impl Default for ValidatorSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl ValidatorSet {
    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn standard() -> Self {
        Self::empty()
            .with(UniqueParentKeys)
            .with(RowCountPreserved)
            .with(OneChildPerParent)
    }

    pub fn with(mut self, check: impl ConstraintCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn run(&self, checkpoint: Checkpoint, ctx: &CheckContext<'_>) -> CheckpointOutcome {
        let mut outcome = CheckpointOutcome::default();
        for check in &self.checks {
            if check.checkpoint() != checkpoint || !check.applies_to(ctx.fk.how) {
                continue;
            }
            let violations = check.check(ctx);
            if violations.is_empty() {
                continue;
            }
            let fatal = match checkpoint {
                Checkpoint::PreMerge => ctx.fk.how.requires_unique_parent(),
                Checkpoint::PostMerge => !ctx.fk.lenient,
            };
            tracing::debug!(
                entity = ctx.entity,
                check = check.name(),
                %checkpoint,
                fatal,
                count = violations.len(),
                "Constraint check reported violations"
            );
            if fatal {
                outcome.fatal.extend(violations);
            } else {
                outcome.warnings.extend(violations);
            }
        }
        outcome
    }
}

/// Parent business keys must not repeat.
pub struct UniqueParentKeys;

impl ConstraintCheck for UniqueParentKeys {
    fn name(&self) -> &'static str {
        "unique_parent_keys"
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::PreMerge
    }

    fn check(&self, ctx: &CheckContext<'_>) -> Vec<Violation> {
        let Ok(columns) = table::columns_by_name(&ctx.parent.batch, ctx.remote_keys) else {
            return Vec::new();
        };
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut duplicated = Vec::new();
        for row in 0..ctx.parent.num_rows() {
            let Some(key) = table::row_key(&columns, row) else {
                continue;
            };
            let count = seen.entry(key).or_insert(0);
            *count += 1;
            if *count == 2 {
                duplicated.push(table::display_key(&columns, row));
            }
        }
        if duplicated.is_empty() {
            return Vec::new();
        }
        vec![Violation {
            entity: ctx.parent.name.clone(),
            check: self.name().to_string(),
            columns: ctx.remote_keys.to_vec(),
            message: format!(
                "{} duplicated key value(s) referenced by '{}' as {}",
                duplicated.len(),
                ctx.entity,
                ctx.fk.how.as_str()
            ),
            count: duplicated.len(),
            sample: duplicated.into_iter().take(SAMPLE_LIMIT).collect(),
        }]
    }
}

/// A join must not add or drop child rows.
pub struct RowCountPreserved;

impl ConstraintCheck for RowCountPreserved {
    fn name(&self) -> &'static str {
        "row_count_preserved"
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::PostMerge
    }

    fn check(&self, ctx: &CheckContext<'_>) -> Vec<Violation> {
        let Some(linked) = ctx.linked else {
            return Vec::new();
        };
        let (before, after) = (ctx.child.num_rows(), linked.num_rows());
        if before == after {
            return Vec::new();
        }
        vec![Violation {
            entity: ctx.entity.to_string(),
            check: self.name().to_string(),
            columns: vec![ctx.column.to_string()],
            message: format!("row count changed from {before} to {after}"),
            count: before.abs_diff(after),
            sample: Vec::new(),
        }]
    }
}

/// Each parent is referenced by at most one child row.
pub struct OneChildPerParent;

impl ConstraintCheck for OneChildPerParent {
    fn name(&self) -> &'static str {
        "one_child_per_parent"
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::PostMerge
    }

    fn applies_to(&self, how: Cardinality) -> bool {
        how.requires_unique_child()
    }

    fn check(&self, ctx: &CheckContext<'_>) -> Vec<Violation> {
        let Some(linked) = ctx.linked else {
            return Vec::new();
        };
        let Ok(ids) = table::int64_column(linked, ctx.column) else {
            return Vec::new();
        };
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for row in 0..ids.len() {
            if ids.is_valid(row) {
                *counts.entry(ids.value(row)).or_insert(0) += 1;
            }
        }
        let mut repeated: Vec<i64> = counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(id, _)| id)
            .collect();
        if repeated.is_empty() {
            return Vec::new();
        }
        repeated.sort_unstable();
        vec![Violation {
            entity: ctx.entity.to_string(),
            check: self.name().to_string(),
            columns: vec![ctx.column.to_string()],
            message: format!(
                "{} parent '{}' row(s) referenced by more than one child under {}",
                repeated.len(),
                ctx.fk.entity,
                ctx.fk.how.as_str()
            ),
            count: repeated.len(),
            sample: repeated
                .iter()
                .take(SAMPLE_LIMIT)
                .map(ToString::to_string)
                .collect(),
        }]
    }
}
