//! Entity tables and the `RecordBatch` helpers the pipeline phases share.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    LargeStringArray, RecordBatch, RecordBatchOptions, StringArray, UInt16Array, UInt32Array,
    UInt64Array, UInt8Array,
};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, FieldRef, Schema};
use arrow::util::display::array_value_to_string;

/// Identity metadata that travels with an entity's rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub system_id: String,
    pub keys: Vec<String>,
    pub public_id: Option<String>,
    /// Columns written by the link phase, holding parent `system_id`s.
    pub foreign_keys: Vec<String>,
    /// Configured column name to the name it was translated to.
    pub renamed: BTreeMap<String, String>,
}

/// Fully processed rows of one entity plus identity metadata.
#[derive(Debug, Clone)]
pub struct EntityTable {
    pub name: String,
    pub batch: RecordBatch,
    pub identity: Identity,
}

impl EntityTable {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn column_names(&self) -> Vec<String> {
        column_names(&self.batch)
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.batch.column_by_name(name)
    }

    /// The `system_id` column.
    pub fn system_ids(&self) -> Result<&Int64Array> {
        int64_column(&self.batch, &self.identity.system_id)
    }

    /// Current name of a column referenced by its configured name.
    pub fn resolve_column<'a>(&'a self, name: &'a str) -> &'a str {
        if has_column(&self.batch, name) {
            return name;
        }
        self.identity
            .renamed
            .get(name)
            .map_or(name, String::as_str)
    }
}

pub fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}

pub fn has_column(batch: &RecordBatch, name: &str) -> bool {
    batch.schema().index_of(name).is_ok()
}

/// Borrow a column as `Int64Array`.
pub fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("column '{name}' not found"))?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| anyhow!("column '{name}' is not Int64"))
}

/// Build a batch with an explicit row count so zero-column batches stay valid.
pub fn build_batch(
    fields: Vec<FieldRef>,
    columns: Vec<ArrayRef>,
    rows: usize,
) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), columns, &options)
        .context("Failed to build record batch")
}

/// Append a column at the end of the batch.
pub fn append_column(batch: &RecordBatch, name: &str, array: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<FieldRef> = schema.fields().iter().cloned().collect();
    fields.push(Arc::new(Field::new(name, array.data_type().clone(), true)));
    let mut columns = batch.columns().to_vec();
    columns.push(array);
    build_batch(fields, columns, batch.num_rows())
}

/// Replace an existing column in place, keeping its position.
pub fn replace_column(batch: &RecordBatch, name: &str, array: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let index = schema
        .index_of(name)
        .with_context(|| format!("column '{name}' not found"))?;
    let mut fields: Vec<FieldRef> = schema.fields().iter().cloned().collect();
    fields[index] = Arc::new(Field::new(name, array.data_type().clone(), true));
    let mut columns = batch.columns().to_vec();
    columns[index] = array;
    build_batch(fields, columns, batch.num_rows())
}

pub fn drop_column(batch: &RecordBatch, name: &str) -> Result<RecordBatch> {
    let keep: Vec<String> = column_names(batch)
        .into_iter()
        .filter(|c| c != name)
        .collect();
    project(batch, &keep)
}

/// Select columns by name, in the given order.
pub fn project(batch: &RecordBatch, names: &[String]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(names.len());
    let mut columns = Vec::with_capacity(names.len());
    for name in names {
        let index = schema
            .index_of(name)
            .with_context(|| format!("column '{name}' not found"))?;
        fields.push(Arc::clone(&schema.fields()[index]));
        columns.push(Arc::clone(batch.column(index)));
    }
    build_batch(fields, columns, batch.num_rows())
}

/// Rename columns by position-preserving mapping.
pub fn rename_columns<F>(batch: &RecordBatch, mut rename: F) -> Result<RecordBatch>
where
    F: FnMut(&str) -> String,
{
    let schema = batch.schema();
    let fields: Vec<FieldRef> = schema
        .fields()
        .iter()
        .map(|f| Arc::new((**f).clone().with_name(rename(f.name()))))
        .collect();
    build_batch(fields, batch.columns().to_vec(), batch.num_rows())
}

/// Gather rows by index into a new batch.
pub fn select_rows(batch: &RecordBatch, indices: &[u32]) -> Result<RecordBatch> {
    let idx = UInt32Array::from(indices.to_vec());
    let idx_ref = &idx as &dyn Array;
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
    for column in batch.columns() {
        let taken = take(column.as_ref(), idx_ref, None).context("Failed to select rows")?;
        arrays.push(taken);
    }
    build_batch(
        batch.schema().fields().iter().cloned().collect(),
        arrays,
        indices.len(),
    )
}

pub fn display_value(array: &dyn Array, row: usize) -> String {
    if array.is_null(row) {
        "null".to_string()
    } else {
        array_value_to_string(array, row).unwrap_or_else(|_| "<unprintable>".to_string())
    }
}

/// Rendered cell, `None` for nulls.
pub fn cell_string(array: &dyn Array, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        array_value_to_string(array, row).ok()
    }
}

/// Composite join key of a row; `None` if any part is null.
///
/// Each part is written as `<byte length>:<cell>`, so two rows share a key
/// only when every part matches.
pub fn row_key(columns: &[&dyn Array], row: usize) -> Option<String> {
    let mut key = String::new();
    for column in columns {
        let cell = cell_string(*column, row)?;
        key.push_str(&cell.len().to_string());
        key.push(':');
        key.push_str(&cell);
    }
    Some(key)
}

/// Human-readable composite key used in samples and public id mappings.
pub fn display_key(columns: &[&dyn Array], row: usize) -> String {
    columns
        .iter()
        .map(|c| display_value(*c, row))
        .collect::<Vec<_>>()
        .join("|")
}

/// Look up several columns by name.
pub fn columns_by_name<'a>(
    batch: &'a RecordBatch,
    names: &[String],
) -> Result<Vec<&'a dyn Array>> {
    names
        .iter()
        .map(|name| {
            batch
                .column_by_name(name)
                .map(|c| &**c as &dyn Array)
                .ok_or_else(|| anyhow!("column '{name}' not found"))
        })
        .collect()
}

pub fn string_value(array: &dyn Array, row: usize) -> Option<&str> {
    if let Some(values) = array.as_any().downcast_ref::<StringArray>() {
        Some(values.value(row))
    } else if let Some(values) = array.as_any().downcast_ref::<LargeStringArray>() {
        Some(values.value(row))
    } else {
        None
    }
}

pub fn numeric_value(array: &dyn Array, row: usize) -> Option<f64> {
    match array.data_type() {
        DataType::Int8 => array
            .as_any()
            .downcast_ref::<Int8Array>()
            .map(|arr| f64::from(arr.value(row))),
        DataType::Int16 => array
            .as_any()
            .downcast_ref::<Int16Array>()
            .map(|arr| f64::from(arr.value(row))),
        DataType::Int32 => array
            .as_any()
            .downcast_ref::<Int32Array>()
            .map(|arr| f64::from(arr.value(row))),
        DataType::Int64 => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .map(|arr| arr.value(row) as f64),
        DataType::UInt8 => array
            .as_any()
            .downcast_ref::<UInt8Array>()
            .map(|arr| f64::from(arr.value(row))),
        DataType::UInt16 => array
            .as_any()
            .downcast_ref::<UInt16Array>()
            .map(|arr| f64::from(arr.value(row))),
        DataType::UInt32 => array
            .as_any()
            .downcast_ref::<UInt32Array>()
            .map(|arr| f64::from(arr.value(row))),
        DataType::UInt64 => array
            .as_any()
            .downcast_ref::<UInt64Array>()
            .map(|arr| arr.value(row) as f64),
        DataType::Float32 => array
            .as_any()
            .downcast_ref::<Float32Array>()
            .map(|arr| f64::from(arr.value(row))),
        DataType::Float64 => array
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(|arr| arr.value(row)),
        DataType::Utf8 | DataType::LargeUtf8 => {
            string_value(array, row).and_then(|s| s.trim().parse::<f64>().ok())
        }
        _ => None,
    }
}

/// Render a configured scalar the way Arrow renders the matching cell.
pub fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("code", DataType::Utf8, true),
            Field::new("depth", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("A"), None, Some("C")])),
                Arc::new(Int64Array::from(vec![Some(10), Some(20), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_select_rows_keeps_schema() {
        let batch = sample_batch();
        let selected = select_rows(&batch, &[2, 0]).unwrap();
        assert_eq!(selected.num_rows(), 2);
        assert_eq!(selected.schema(), batch.schema());
        assert_eq!(display_value(selected.column(0).as_ref(), 0), "C");
    }

    #[test]
    fn test_select_no_rows() {
        let selected = select_rows(&sample_batch(), &[]).unwrap();
        assert_eq!(selected.num_rows(), 0);
        assert_eq!(selected.num_columns(), 2);
    }

    #[test]
    fn test_row_key_null_part_is_none() {
        let batch = sample_batch();
        let cols = columns_by_name(&batch, &["code".to_string(), "depth".to_string()]).unwrap();
        assert_eq!(row_key(&cols, 0), Some("1:A2:10".to_string()));
        assert_eq!(row_key(&cols, 1), None);
        assert_eq!(row_key(&cols, 2), None);
        assert_eq!(display_key(&cols, 1), "null|20");
    }

    #[test]
    fn test_row_key_parts_cannot_run_together() {
        let first = StringArray::from(vec!["a\u{1f}b", "a", "a:1"]);
        let second = StringArray::from(vec!["c", "b\u{1f}c", "c"]);
        let cols: Vec<&dyn Array> = vec![&first, &second];
        assert_ne!(row_key(&cols, 0), row_key(&cols, 1));

        let other_first = StringArray::from(vec!["a"]);
        let other_second = StringArray::from(vec!["1:c"]);
        let other: Vec<&dyn Array> = vec![&other_first, &other_second];
        assert_ne!(row_key(&cols, 2), row_key(&other, 0));
    }

    #[test]
    fn test_project_and_drop() {
        let batch = sample_batch();
        let projected = project(&batch, &["depth".to_string()]).unwrap();
        assert_eq!(column_names(&projected), vec!["depth"]);
        let dropped = drop_column(&batch, "depth").unwrap();
        assert_eq!(column_names(&dropped), vec!["code"]);
        assert!(project(&batch, &["nope".to_string()]).is_err());
    }

    #[test]
    fn test_project_to_zero_columns_keeps_rows() {
        let projected = project(&sample_batch(), &[]).unwrap();
        assert_eq!(projected.num_columns(), 0);
        assert_eq!(projected.num_rows(), 3);
    }

    #[test]
    fn test_append_and_replace_column() {
        let batch = sample_batch();
        let ids: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let appended = append_column(&batch, "system_id", ids).unwrap();
        assert_eq!(column_names(&appended), vec!["code", "depth", "system_id"]);
        assert_eq!(int64_column(&appended, "system_id").unwrap().value(2), 3);

        let codes: ArrayRef = Arc::new(StringArray::from(vec!["x", "y", "z"]));
        let replaced = replace_column(&appended, "code", codes).unwrap();
        assert_eq!(column_names(&replaced), vec!["code", "depth", "system_id"]);
        assert_eq!(display_value(replaced.column(0).as_ref(), 1), "y");
    }

    #[test]
    fn test_rename_columns() {
        let renamed = rename_columns(&sample_batch(), |name| name.to_uppercase()).unwrap();
        assert_eq!(column_names(&renamed), vec!["CODE", "DEPTH"]);
    }

    #[test]
    fn test_numeric_value_parses_strings() {
        let array = StringArray::from(vec!["1.5", "abc"]);
        assert_eq!(numeric_value(&array, 0), Some(1.5));
        assert_eq!(numeric_value(&array, 1), None);
    }

    #[test]
    fn test_scalar_to_string_matches_cell_rendering() {
        let batch = sample_batch();
        let depth = batch.column(1);
        assert_eq!(
            scalar_to_string(&serde_json::json!(10)),
            cell_string(depth.as_ref(), 0)
        );
        assert_eq!(scalar_to_string(&serde_json::Value::Null), None);
    }
}
