//! Extract phase: load, append, project, deduplicate, then assign identities.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use arrow::array::{new_null_array, Array, ArrayRef, RecordBatch};
use arrow::compute::{cast_with_options, concat_batches, CastOptions};
use arrow::datatypes::{FieldRef, Schema};
use serde_json::{Map, Value};
use shapeshift_types::entity::KIND_DATA;
use shapeshift_types::{DedupPolicy, EntitySpec, Phase, SourceRef, Violation};

use super::EntityPipeline;
use crate::error::{ConstraintViolationError, LoaderError, PipelineError, SAMPLE_LIMIT};
use crate::identity::{self, PublicIdPolicy};
use crate::loader::LoadRequest;
use crate::store::EntityTableStore;
use crate::table;

/// One source of rows: the entity itself or one of its `append` entries.
struct SourceDecl<'a> {
    kind: &'a str,
    source: Option<&'a SourceRef>,
    columns: &'a [String],
    values: &'a [Vec<Value>],
}

pub(crate) fn run(
    pipeline: &EntityPipeline<'_>,
    spec: &EntitySpec,
    store: &EntityTableStore,
) -> Result<RecordBatch, PipelineError> {
    let entity = spec.name.as_str();
    let primary = SourceDecl {
        kind: &spec.kind,
        source: spec.source.as_ref(),
        columns: &spec.columns,
        values: &spec.values,
    };
    let mut batch = load(pipeline, entity, &primary, store)?;

    if !spec.append.is_empty() {
        let mut parts = Vec::with_capacity(spec.append.len());
        for append in &spec.append {
            let decl = SourceDecl {
                kind: &append.kind,
                source: append.source.as_ref(),
                columns: &append.columns,
                values: &append.values,
            };
            parts.push(load(pipeline, entity, &decl, store)?);
        }
        batch = union(entity, &batch, &parts)?;
    }

    if !spec.columns.is_empty() && !spec.is_fixed() {
        batch = table::project(&batch, &spec.columns)
            .map_err(|e| PipelineError::config(entity, Phase::Extract, e.to_string()))?;
    }

    if table::has_column(&batch, &spec.system_id) {
        return Err(PipelineError::config(
            entity,
            Phase::Extract,
            format!(
                "loaded data already has a column named '{}'; pick another system_id name",
                spec.system_id
            ),
        ));
    }

    if let Some(policy) = spec.drop_duplicates {
        let before = batch.num_rows();
        batch = deduplicate(entity, &batch, &spec.keys, policy)?;
        tracing::debug!(
            entity,
            before,
            after = batch.num_rows(),
            ?policy,
            "Dropped duplicate keys"
        );
    }

    batch = identity::assign_system_ids(&batch, &spec.system_id)?;

    if let Some(column) = &spec.public_id {
        let policy = if !spec.public_id_mapping.is_empty() {
            PublicIdPolicy::Mapping {
                keys: &spec.keys,
                mapping: &spec.public_id_mapping,
            }
        } else if table::has_column(&batch, column) {
            PublicIdPolicy::Provided
        } else {
            PublicIdPolicy::Deferred
        };
        batch = identity::assign_public_id(&batch, column, policy)
            .map_err(|e| PipelineError::config(entity, Phase::Extract, format!("{e:#}")))?;
    }

    Ok(batch)
}

fn load(
    pipeline: &EntityPipeline<'_>,
    entity: &str,
    decl: &SourceDecl<'_>,
    store: &EntityTableStore,
) -> Result<RecordBatch, PipelineError> {
    if decl.kind == KIND_DATA {
        let Some(name) = decl.source.and_then(SourceRef::entity) else {
            return Err(PipelineError::config(
                entity,
                Phase::Extract,
                "'data' sources must name another entity as their source",
            ));
        };
        let source = store.require(name)?;
        let mut batch = table::drop_column(&source.batch, &source.identity.system_id)?;
        if !decl.columns.is_empty() {
            batch = table::project(&batch, decl.columns)
                .map_err(|e| PipelineError::config(entity, Phase::Extract, format!("source '{name}': {e}")))?;
        }
        return Ok(batch);
    }

    let Some(loader) = pipeline.registry.loader(decl.kind) else {
        return Err(PipelineError::config(
            entity,
            Phase::Extract,
            format!("no loader registered for type '{}'", decl.kind),
        ));
    };
    let empty = Map::new();
    let options = match decl.source {
        Some(SourceRef::Options(options)) => options,
        _ => &empty,
    };
    let request = LoadRequest {
        entity,
        kind: decl.kind,
        options,
        columns: decl.columns,
        values: decl.values,
        base_dir: pipeline.base_dir,
    };
    let batch = loader.load(&request).map_err(|cause| LoaderError {
        entity: entity.to_string(),
        source_desc: request.describe(),
        cause,
    })?;
    if decl.columns.is_empty() {
        Ok(batch)
    } else {
        table::project(&batch, decl.columns)
            .map_err(|e| PipelineError::config(entity, Phase::Extract, e.to_string()))
    }
}

/// Concatenate appended sources under the primary schema. Appended columns
/// are cast to the primary type; missing ones are null, extra ones dropped.
fn union(
    entity: &str,
    primary: &RecordBatch,
    parts: &[RecordBatch],
) -> Result<RecordBatch, PipelineError> {
    let fields: Vec<FieldRef> = primary
        .schema()
        .fields()
        .iter()
        .map(|f| Arc::new((**f).clone().with_nullable(true)))
        .collect();
    let schema = Arc::new(Schema::new(fields.clone()));

    let mut batches = Vec::with_capacity(parts.len() + 1);
    batches.push(table::build_batch(
        fields.clone(),
        primary.columns().to_vec(),
        primary.num_rows(),
    )?);
    let strict = CastOptions {
        safe: false,
        ..CastOptions::default()
    };
    for (index, part) in parts.iter().enumerate() {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.len());
        for field in &fields {
            let column = match part.column_by_name(field.name()) {
                Some(c) if c.data_type() == field.data_type() => Arc::clone(c),
                Some(c) => cast_with_options(c.as_ref(), field.data_type(), &strict).map_err(|e| {
                    PipelineError::config(
                        entity,
                        Phase::Extract,
                        format!(
                            "append[{index}]: column '{}' ({}) cannot be cast to {}: {e}",
                            field.name(),
                            c.data_type(),
                            field.data_type()
                        ),
                    )
                })?,
                None => new_null_array(field.data_type(), part.num_rows()),
            };
            columns.push(column);
        }
        batches.push(table::build_batch(fields.clone(), columns, part.num_rows())?);
    }

    let combined = concat_batches(&schema, &batches).context("Failed to union appended sources")?;
    tracing::debug!(
        entity,
        sources = batches.len(),
        rows = combined.num_rows(),
        "Unioned appended sources"
    );
    Ok(combined)
}

/// Keep one row per business key. Rows with a null key part are never
/// considered duplicates.
pub(crate) fn deduplicate(
    entity: &str,
    batch: &RecordBatch,
    keys: &[String],
    policy: DedupPolicy,
) -> Result<RecordBatch, PipelineError> {
    if keys.is_empty() {
        return Err(PipelineError::config(
            entity,
            Phase::Extract,
            "drop_duplicates needs 'keys'",
        ));
    }
    let key_columns = table::columns_by_name(batch, keys)
        .map_err(|e| PipelineError::config(entity, Phase::Extract, e.to_string()))?;
    let all_columns: Vec<&dyn Array> = batch.columns().iter().map(|c| &**c as &dyn Array).collect();

    let rows: Box<dyn Iterator<Item = usize>> = match policy {
        DedupPolicy::Last => Box::new((0..batch.num_rows()).rev()),
        DedupPolicy::First | DedupPolicy::Strict => Box::new(0..batch.num_rows()),
    };

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut keep: Vec<u32> = Vec::new();
    let mut conflicts: Vec<String> = Vec::new();
    for row in rows {
        let Some(key) = table::row_key(&key_columns, row) else {
            keep.push(row as u32);
            continue;
        };
        match seen.get(&key) {
            None => {
                seen.insert(key, row);
                keep.push(row as u32);
            }
            Some(&kept) if policy == DedupPolicy::Strict => {
                if table::display_key(&all_columns, kept) != table::display_key(&all_columns, row) {
                    let rendered = table::display_key(&key_columns, row);
                    if !conflicts.contains(&rendered) {
                        conflicts.push(rendered);
                    }
                }
            }
            Some(_) => {}
        }
    }

    if !conflicts.is_empty() {
        return Err(ConstraintViolationError {
            entity: entity.to_string(),
            phase: Phase::Extract,
            violations: vec![Violation {
                entity: entity.to_string(),
                check: "functional_dependency".to_string(),
                columns: keys.to_vec(),
                message: format!("{} key value(s) map to differing rows", conflicts.len()),
                count: conflicts.len(),
                sample: conflicts.into_iter().take(SAMPLE_LIMIT).collect(),
            }],
        }
        .into());
    }

    keep.sort_unstable();
    Ok(table::select_rows(batch, &keep)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use rstest::rstest;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("code", DataType::Utf8, true),
            Field::new("depth", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("A"), Some("B"), Some("A"), None, None])),
                Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5])),
            ],
        )
        .unwrap()
    }

    fn depths(batch: &RecordBatch) -> Vec<i64> {
        table::int64_column(batch, "depth").unwrap().values().to_vec()
    }

    #[rstest]
    #[case(DedupPolicy::First, vec![1, 2, 4, 5])]
    #[case(DedupPolicy::Last, vec![2, 3, 4, 5])]
    fn test_dedup_keeps_one_row_per_key(#[case] policy: DedupPolicy, #[case] expected: Vec<i64>) {
        let keys = vec!["code".to_string()];
        let deduped = deduplicate("site", &batch(), &keys, policy).unwrap();
        assert_eq!(depths(&deduped), expected);
    }

    #[test]
    fn test_strict_dedup_flags_conflicting_rows() {
        let keys = vec!["code".to_string()];
        let err = deduplicate("site", &batch(), &keys, DedupPolicy::Strict).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConstraintViolation);
        match err {
            PipelineError::ConstraintViolation(cv) => {
                assert_eq!(cv.violations[0].check, "functional_dependency");
                assert_eq!(cv.violations[0].sample, vec!["A"]);
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn test_strict_dedup_drops_exact_duplicates() {
        let keys = vec!["code".to_string(), "depth".to_string()];
        let doubled = concat_batches(&batch().schema(), &[batch(), batch()]).unwrap();
        let deduped = deduplicate("site", &doubled, &keys, DedupPolicy::Strict).unwrap();
        // Null-keyed rows are never collapsed.
        assert_eq!(depths(&deduped), vec![1, 2, 3, 4, 5, 4, 5]);
    }

    #[test]
    fn test_dedup_without_keys_is_configuration() {
        let err = deduplicate("site", &batch(), &[], DedupPolicy::First).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_union_casts_and_fills_missing_columns() {
        let part_schema = Arc::new(Schema::new(vec![Field::new("code", DataType::Utf8, true)]));
        let part = RecordBatch::try_new(
            part_schema,
            vec![Arc::new(StringArray::from(vec!["Z"]))],
        )
        .unwrap();
        let combined = union("site", &batch(), &[part]).unwrap();
        assert_eq!(combined.num_rows(), 6);
        let depth = table::int64_column(&combined, "depth").unwrap();
        assert!(depth.is_null(5));
    }

    #[test]
    fn test_union_rejects_values_that_do_not_fit_primary_type() {
        let part_schema = Arc::new(Schema::new(vec![
            Field::new("code", DataType::Utf8, true),
            Field::new("depth", DataType::Utf8, true),
        ]));
        let part = RecordBatch::try_new(
            part_schema,
            vec![
                Arc::new(StringArray::from(vec!["C", "D"])),
                Arc::new(StringArray::from(vec![Some("7"), Some("deep")])),
            ],
        )
        .unwrap();
        let err = union("site", &batch(), &[batch(), part]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(err.entity(), Some("site"));
        assert_eq!(err.phase(), Some(Phase::Extract));
        let msg = err.to_string();
        assert!(msg.contains("append[1]"), "{msg}");
        assert!(msg.contains("'depth'"), "{msg}");
    }
}
