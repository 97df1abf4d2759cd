//! Identity resolution: `system_id` assignment, foreign-key matching and
//! public id population.
//!
//! Business keys are only used to *discover* which parent a child row belongs
//! to. What gets stored in the child is always the parent's `system_id`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::compute::{cast_with_options, CastOptions};
use arrow::datatypes::DataType;
use shapeshift_types::{ForeignKeySpec, LinkReport, Phase};

use crate::error::{LinkError, LinkFailure, PipelineError, SAMPLE_LIMIT};
use crate::table::{self, EntityTable};

/// Append a dense `1..=N` Int64 identity column.
pub fn assign_system_ids(batch: &RecordBatch, column: &str) -> Result<RecordBatch> {
    if table::has_column(batch, column) {
        bail!("column '{column}' already exists");
    }
    let rows = batch.num_rows() as i64;
    let ids: ArrayRef = Arc::new(Int64Array::from_iter_values(1..=rows));
    table::append_column(batch, column, ids)
}

/// How the public id column of an entity is populated.
#[derive(Debug, Clone, Copy)]
pub enum PublicIdPolicy<'a> {
    /// Look up each row's rendered business key in a configured mapping.
    Mapping {
        keys: &'a [String],
        mapping: &'a BTreeMap<String, i64>,
    },
    /// The loader already produced the column; it is cast to Int64 and any
    /// non-null value that is not an integer fails.
    Provided,
    /// Assigned downstream; the column is added with all nulls.
    Deferred,
}

pub fn assign_public_id(
    batch: &RecordBatch,
    column: &str,
    policy: PublicIdPolicy<'_>,
) -> Result<RecordBatch> {
    match policy {
        PublicIdPolicy::Mapping { keys, mapping } => {
            if table::has_column(batch, column) {
                bail!("public id column '{column}' is both loaded and mapped");
            }
            let key_columns = table::columns_by_name(batch, keys)?;
            let ids: Int64Array = (0..batch.num_rows())
                .map(|row| mapping.get(&table::display_key(&key_columns, row)).copied())
                .collect();
            table::append_column(batch, column, Arc::new(ids))
        }
        PublicIdPolicy::Provided => {
            let existing = batch
                .column_by_name(column)
                .with_context(|| format!("public id column '{column}' not found"))?;
            let strict = CastOptions {
                safe: false,
                ..CastOptions::default()
            };
            let ids = cast_with_options(existing.as_ref(), &DataType::Int64, &strict)
                .with_context(|| format!("public id column '{column}' is not integer-like"))?;
            table::replace_column(batch, column, ids)
        }
        PublicIdPolicy::Deferred => {
            let ids: Int64Array = std::iter::repeat(None::<i64>)
                .take(batch.num_rows())
                .collect();
            table::append_column(batch, column, Arc::new(ids))
        }
    }
}

/// Counts from one resolved foreign key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkOutcome {
    pub matched: usize,
    pub unmatched: usize,
}

impl LinkOutcome {
    pub fn report(&self, target: &str, column: &str) -> LinkReport {
        LinkReport {
            target: target.to_string(),
            column: column.to_string(),
            matched: self.matched,
            unmatched: self.unmatched,
        }
    }
}

/// Parent columns a foreign key matches against, by their current names.
///
/// Defaults to the parent's keys. Explicit names may use either the parent's
/// configured or translated column names.
pub fn remote_keys(fk: &ForeignKeySpec, parent: &EntityTable) -> Vec<String> {
    if fk.remote_keys.is_empty() {
        parent.identity.keys.clone()
    } else {
        fk.remote_keys
            .iter()
            .map(|k| parent.resolve_column(k).to_string())
            .collect()
    }
}

enum ParentMatch {
    One(i64),
    Many,
}

/// Collects distinct rendered keys for error samples.
#[derive(Default)]
struct Offenders {
    count: usize,
    sample: Vec<String>,
}

impl Offenders {
    fn push(&mut self, value: String) {
        self.count += 1;
        if self.sample.len() < SAMPLE_LIMIT && !self.sample.contains(&value) {
            self.sample.push(value);
        }
    }
}

/// Match child rows to parent rows on business keys and append `column`
/// holding the matched parent `system_id`.
///
/// A null key part never matches. Unmatched rows are fatal on a required
/// foreign key and null-filled otherwise; rows matching several parents are
/// always fatal. The parent table is only read.
pub fn resolve_foreign_key(
    entity: &str,
    child: &RecordBatch,
    parent: &EntityTable,
    fk: &ForeignKeySpec,
    column: &str,
) -> Result<(RecordBatch, LinkOutcome), PipelineError> {
    let remote = remote_keys(fk, parent);
    if remote.is_empty() || remote.len() != fk.local_keys.len() {
        return Err(PipelineError::config(
            entity,
            Phase::Link,
            format!(
                "foreign key to '{}' needs the same non-zero number of local and remote keys (got {} and {})",
                fk.entity,
                fk.local_keys.len(),
                remote.len()
            ),
        ));
    }

    let parent_columns = table::columns_by_name(&parent.batch, &remote)
        .map_err(|e| PipelineError::config(entity, Phase::Link, format!("parent '{}': {e}", fk.entity)))?;
    let child_columns = table::columns_by_name(child, &fk.local_keys)
        .map_err(|e| PipelineError::config(entity, Phase::Link, e.to_string()))?;
    let parent_ids = parent.system_ids()?;

    let mut index: HashMap<String, ParentMatch> = HashMap::with_capacity(parent.num_rows());
    for row in 0..parent.num_rows() {
        let Some(key) = table::row_key(&parent_columns, row) else {
            continue;
        };
        index
            .entry(key)
            .and_modify(|m| *m = ParentMatch::Many)
            .or_insert(ParentMatch::One(parent_ids.value(row)));
    }

    let mut outcome = LinkOutcome::default();
    let mut unmatched = Offenders::default();
    let mut ambiguous = Offenders::default();
    let mut resolved = Vec::with_capacity(child.num_rows());
    for row in 0..child.num_rows() {
        let found = table::row_key(&child_columns, row).and_then(|key| index.get(&key));
        match found {
            Some(ParentMatch::One(id)) => {
                outcome.matched += 1;
                resolved.push(Some(*id));
            }
            Some(ParentMatch::Many) => {
                ambiguous.push(table::display_key(&child_columns, row));
                resolved.push(None);
            }
            None => {
                outcome.unmatched += 1;
                unmatched.push(table::display_key(&child_columns, row));
                resolved.push(None);
            }
        }
    }

    let failure = if ambiguous.count > 0 {
        Some((LinkFailure::Ambiguous, ambiguous))
    } else if fk.required && unmatched.count > 0 {
        Some((LinkFailure::Unmatched, unmatched))
    } else {
        None
    };
    if let Some((failure, offenders)) = failure {
        return Err(LinkError {
            entity: entity.to_string(),
            target: fk.entity.clone(),
            local_keys: fk.local_keys.clone(),
            failure,
            count: offenders.count,
            sample: offenders.sample,
        }
        .into());
    }

    let linked = table::append_column(child, column, Arc::new(Int64Array::from(resolved)))?;
    Ok((linked, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Identity;
    use arrow::array::{Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use proptest::prelude::*;

    fn strings(name: &str, values: Vec<Option<&str>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Utf8, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(values))]).unwrap()
    }

    fn site_table(names: Vec<Option<&str>>) -> EntityTable {
        let batch = assign_system_ids(&strings("site_name", names), "system_id").unwrap();
        EntityTable {
            name: "site".to_string(),
            batch,
            identity: Identity {
                system_id: "system_id".to_string(),
                keys: vec!["site_name".to_string()],
                public_id: None,
                foreign_keys: Vec::new(),
                renamed: Default::default(),
            },
        }
    }

    fn fk() -> ForeignKeySpec {
        ForeignKeySpec::new("site", &["site_ref"], &[])
    }

    #[test]
    fn test_system_ids_on_empty_batch() {
        let ids = assign_system_ids(&strings("a", vec![]), "system_id").unwrap();
        assert_eq!(ids.num_rows(), 0);
        assert_eq!(table::int64_column(&ids, "system_id").unwrap().len(), 0);
    }

    #[test]
    fn test_system_id_clash_rejected() {
        let batch = strings("system_id", vec![Some("x")]);
        assert!(assign_system_ids(&batch, "system_id").is_err());
    }

    #[test]
    fn test_resolve_writes_parent_system_id() {
        let parent = site_table(vec![Some("A"), Some("B")]);
        let child = strings("site_ref", vec![Some("B"), Some("A"), Some("B")]);
        let (linked, outcome) = resolve_foreign_key("sample", &child, &parent, &fk(), "site_id").unwrap();
        let ids = table::int64_column(&linked, "site_id").unwrap();
        assert_eq!(ids.values().to_vec(), vec![2, 1, 2]);
        assert_eq!(outcome, LinkOutcome { matched: 3, unmatched: 0 });
        assert_eq!(parent.num_rows(), 2);
    }

    #[test]
    fn test_unmatched_required_fails_with_sample() {
        let parent = site_table(vec![Some("A"), Some("B")]);
        let child = strings("site_ref", vec![Some("A"), Some("Z")]);
        let err = resolve_foreign_key("sample", &child, &parent, &fk(), "site_id").unwrap_err();
        match err {
            PipelineError::Link(link) => {
                assert_eq!(link.failure, LinkFailure::Unmatched);
                assert_eq!(link.target, "site");
                assert_eq!(link.count, 1);
                assert_eq!(link.sample, vec!["Z"]);
            }
            other => panic!("expected link error, got {other:?}"),
        }
    }

    #[test]
    fn test_unmatched_optional_is_null_filled() {
        let parent = site_table(vec![Some("A")]);
        let child = strings("site_ref", vec![Some("A"), Some("Z"), None]);
        let mut optional = fk();
        optional.required = false;
        let (linked, outcome) =
            resolve_foreign_key("sample", &child, &parent, &optional, "site_id").unwrap();
        let ids = table::int64_column(&linked, "site_id").unwrap();
        assert_eq!(ids.null_count(), 2);
        assert_eq!(outcome.unmatched, 2);
    }

    #[test]
    fn test_null_parent_key_never_matches() {
        let parent = site_table(vec![None, Some("A")]);
        let child = strings("site_ref", vec![Some("null")]);
        let err = resolve_foreign_key("sample", &child, &parent, &fk(), "site_id").unwrap_err();
        assert!(matches!(err, PipelineError::Link(_)));
    }

    #[test]
    fn test_ambiguous_parent_is_link_error() {
        let parent = site_table(vec![Some("X"), Some("X")]);
        let child = strings("site_ref", vec![Some("X")]);
        let mut many = fk();
        many.required = false;
        let err = resolve_foreign_key("sample", &child, &parent, &many, "site_id").unwrap_err();
        match err {
            PipelineError::Link(link) => assert_eq!(link.failure, LinkFailure::Ambiguous),
            other => panic!("expected link error, got {other:?}"),
        }
    }

    #[test]
    fn test_key_count_mismatch_is_configuration() {
        let parent = site_table(vec![Some("A")]);
        let child = strings("site_ref", vec![Some("A")]);
        let bad = ForeignKeySpec::new("site", &["site_ref", "other"], &[]);
        let err = resolve_foreign_key("sample", &child, &parent, &bad, "site_id").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn test_public_id_policies() {
        let batch = strings("site_name", vec![Some("A"), Some("B")]);
        let deferred = assign_public_id(&batch, "site_id", PublicIdPolicy::Deferred).unwrap();
        assert_eq!(table::int64_column(&deferred, "site_id").unwrap().null_count(), 2);

        let keys = vec!["site_name".to_string()];
        let mapping = BTreeMap::from([("B".to_string(), 42)]);
        let mapped = assign_public_id(
            &batch,
            "site_id",
            PublicIdPolicy::Mapping { keys: &keys, mapping: &mapping },
        )
        .unwrap();
        let ids = table::int64_column(&mapped, "site_id").unwrap();
        assert!(ids.is_null(0));
        assert_eq!(ids.value(1), 42);

        let provided = strings("site_id", vec![Some("7"), Some("8")]);
        let cast_back = assign_public_id(&provided, "site_id", PublicIdPolicy::Provided).unwrap();
        assert_eq!(table::int64_column(&cast_back, "site_id").unwrap().value(1), 8);
    }

    #[test]
    fn test_provided_public_id_rejects_non_integer() {
        let provided = strings("site_id", vec![Some("7"), None, Some("abc")]);
        let err = assign_public_id(&provided, "site_id", PublicIdPolicy::Provided).unwrap_err();
        assert!(format!("{err:#}").contains("'site_id' is not integer-like"));

        // nulls stay null
        let sparse = strings("site_id", vec![Some("7"), None]);
        let ids = assign_public_id(&sparse, "site_id", PublicIdPolicy::Provided).unwrap();
        assert!(table::int64_column(&ids, "site_id").unwrap().is_null(1));
    }

    proptest! {
        #[test]
        fn system_ids_are_dense(rows in 0usize..200) {
            let values: Vec<Option<&str>> = vec![Some("v"); rows];
            let batch = assign_system_ids(&strings("a", values), "system_id").unwrap();
            let ids = table::int64_column(&batch, "system_id").unwrap();
            let expected: Vec<i64> = (1..=rows as i64).collect();
            prop_assert_eq!(ids.values().to_vec(), expected);
        }

        #[test]
        fn unique_parent_keys_round_trip(n in 1usize..50, picks in prop::collection::vec(0usize..50, 0..30)) {
            let names: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
            let parent = site_table(names.iter().map(|s| Some(s.as_str())).collect());
            let refs: Vec<Option<&str>> = picks.iter().map(|p| Some(names[p % n].as_str())).collect();
            let child = strings("site_ref", refs);
            let (linked, outcome) = resolve_foreign_key("sample", &child, &parent, &fk(), "site_id").unwrap();
            prop_assert_eq!(outcome.matched, picks.len());
            let ids = table::int64_column(&linked, "site_id").unwrap();
            for (row, pick) in picks.iter().enumerate() {
                prop_assert_eq!(ids.value(row), (pick % n) as i64 + 1);
            }
        }
    }
}
