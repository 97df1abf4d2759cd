//! Filter phase: AND-ed row predicates.
//!
//! Selection keeps `system_id` values as assigned by extract, so ids may
//! become sparse here but never repeat.

use anyhow::Context;
use arrow::array::{Array, BooleanArray, RecordBatch};
use arrow::compute::filter_record_batch;
use regex::Regex;
use serde_json::Value;
use shapeshift_types::{FilterSpec, Phase};

use crate::error::PipelineError;
use crate::table;

/// A filter bound to its column with any pattern compiled.
enum Predicate<'a> {
    Equals(&'a Value),
    NotEquals(&'a Value),
    In(&'a [Value]),
    NotIn(&'a [Value]),
    IsNull,
    NotNull,
    Matches(Regex),
    Range { min: Option<f64>, max: Option<f64> },
}

impl<'a> Predicate<'a> {
    fn compile(entity: &str, filter: &'a FilterSpec) -> Result<Self, PipelineError> {
        Ok(match filter {
            FilterSpec::Equals { value, .. } => Self::Equals(value),
            FilterSpec::NotEquals { value, .. } => Self::NotEquals(value),
            FilterSpec::In { values, .. } => Self::In(values),
            FilterSpec::NotIn { values, .. } => Self::NotIn(values),
            FilterSpec::IsNull { .. } => Self::IsNull,
            FilterSpec::NotNull { .. } => Self::NotNull,
            FilterSpec::Matches { pattern, .. } => Self::Matches(Regex::new(pattern).map_err(|e| {
                PipelineError::config(
                    entity,
                    Phase::Filter,
                    format!("invalid pattern for column '{}': {e}", filter.column()),
                )
            })?),
            FilterSpec::Range { min, max, .. } => Self::Range {
                min: *min,
                max: *max,
            },
        })
    }

    fn accepts(&self, array: &dyn Array, row: usize) -> bool {
        match self {
            Self::Equals(value) => cell_equals(array, row, value),
            Self::NotEquals(value) => !cell_equals(array, row, value),
            Self::In(values) => values.iter().any(|v| cell_equals(array, row, v)),
            Self::NotIn(values) => !values.iter().any(|v| cell_equals(array, row, v)),
            Self::IsNull => array.is_null(row),
            Self::NotNull => array.is_valid(row),
            Self::Matches(regex) => table::cell_string(array, row).is_some_and(|s| regex.is_match(&s)),
            Self::Range { min, max } => {
                if array.is_null(row) {
                    return false;
                }
                table::numeric_value(array, row).is_some_and(|v| {
                    min.map_or(true, |min| v >= min) && max.map_or(true, |max| v <= max)
                })
            }
        }
    }
}

/// Compare a cell to a configured scalar. Numbers compare numerically against
/// numeric columns; everything else compares by rendering.
fn cell_equals(array: &dyn Array, row: usize, value: &Value) -> bool {
    if array.is_null(row) {
        return value.is_null();
    }
    if let Some(expected) = value.as_f64() {
        if array.data_type().is_numeric() {
            return table::numeric_value(array, row) == Some(expected);
        }
    }
    table::cell_string(array, row) == table::scalar_to_string(value)
}

pub(crate) fn run(
    entity: &str,
    batch: &RecordBatch,
    filters: &[FilterSpec],
) -> Result<RecordBatch, PipelineError> {
    if filters.is_empty() {
        return Ok(batch.clone());
    }

    let mut bound = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = batch.column_by_name(filter.column()).ok_or_else(|| {
            PipelineError::config(
                entity,
                Phase::Filter,
                format!("{} filter references unknown column '{}'", filter.kind(), filter.column()),
            )
        })?;
        bound.push((column.as_ref(), Predicate::compile(entity, filter)?));
    }

    let mask: BooleanArray = (0..batch.num_rows())
        .map(|row| Some(bound.iter().all(|(array, p)| p.accepts(*array, row))))
        .collect();
    let filtered = filter_record_batch(batch, &mask).context("Failed to apply filters")?;
    tracing::debug!(
        entity,
        before = batch.num_rows(),
        after = filtered.num_rows(),
        filters = filters.len(),
        "Applied filters"
    );
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use arrow::array::{Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use rstest::rstest;
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("country", DataType::Utf8, true),
            Field::new("depth", DataType::Float64, true),
            Field::new("system_id", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("SE"), Some("NO"), None, Some("SE")])),
                Arc::new(Float64Array::from(vec![Some(1.0), Some(5.5), Some(10.0), None])),
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
            ],
        )
        .unwrap()
    }

    fn ids(batch: &RecordBatch) -> Vec<i64> {
        table::int64_column(batch, "system_id").unwrap().values().to_vec()
    }

    fn parse(yaml: &str) -> Vec<FilterSpec> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[rstest]
    #[case("[{type: equals, column: country, value: SE}]", vec![1, 4])]
    #[case("[{type: not_equals, column: country, value: SE}]", vec![2, 3])]
    #[case("[{type: in, column: country, values: ['NO', DK]}]", vec![2])]
    #[case("[{type: not_in, column: country, values: ['NO']}]", vec![1, 3, 4])]
    #[case("[{type: is_null, column: country}]", vec![3])]
    #[case("[{type: not_null, column: depth}]", vec![1, 2, 3])]
    #[case("[{type: matches, column: country, pattern: '^N'}]", vec![2])]
    #[case("[{type: range, column: depth, min: 2, max: 10}]", vec![2, 3])]
    #[case("[{type: equals, column: depth, value: 1}]", vec![1])]
    #[case("[{type: equals, column: country, value: SE}, {type: not_null, column: depth}]", vec![1])]
    fn test_filter_predicates(#[case] yaml: &str, #[case] expected: Vec<i64>) {
        let filtered = run("sample", &batch(), &parse(yaml)).unwrap();
        assert_eq!(ids(&filtered), expected);
    }

    #[test]
    fn test_unknown_column_is_configuration_error() {
        let err = run("sample", &batch(), &parse("[{type: is_null, column: nope}]")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let err = run(
            "sample",
            &batch(),
            &parse("[{type: matches, column: country, pattern: '('}]"),
        )
        .unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Filter));
    }

    #[test]
    fn test_filter_everything_keeps_schema() {
        let filtered = run("sample", &batch(), &parse("[{type: equals, column: country, value: XX}]")).unwrap();
        assert_eq!(filtered.num_rows(), 0);
        assert_eq!(filtered.schema(), batch().schema());
    }
}
