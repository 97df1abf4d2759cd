//! Loader contract and the built-in `fixed` and `csv` loaders.
//!
//! A loader turns one entity's source description into a whole table. It
//! runs synchronously and returns either every row or an error; the pipeline
//! wraps failures with the entity name and source description.

use std::fs::File;
use std::io::Seek;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow::compute::concat_batches;
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{Field, FieldRef};
use serde_json::{Map, Value};

use crate::table;

/// Inputs a loader receives for one entity.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub entity: &'a str,
    /// Loader tag (`type` of the entity).
    pub kind: &'a str,
    /// Loader options from a mapping `source`; empty otherwise.
    pub options: &'a Map<String, Value>,
    pub columns: &'a [String],
    pub values: &'a [Vec<Value>],
    /// Directory relative paths in options resolve against.
    pub base_dir: &'a Path,
}

impl LoadRequest<'_> {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    /// Short human description of the source used in errors and logs.
    pub fn describe(&self) -> String {
        match self.option_str("path") {
            Some(path) => format!("{} {path}", self.kind),
            None if !self.options.is_empty() => format!("{} {}", self.kind, Value::Object(self.options.clone())),
            None => self.kind.to_string(),
        }
    }
}

pub trait Loader: Send + Sync {
    fn load(&self, request: &LoadRequest<'_>) -> Result<RecordBatch>;
}

/// Rows given inline under `values`, named by `columns`.
///
/// Column types are inferred from the values: all integers give Int64, any
/// float gives Float64, all booleans give Boolean, anything else Utf8.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedLoader;

impl Loader for FixedLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<RecordBatch> {
        fixed_batch(request.columns, request.values)
    }
}

fn fixed_batch(columns: &[String], values: &[Vec<Value>]) -> Result<RecordBatch> {
    if columns.is_empty() && !values.is_empty() {
        bail!("fixed values need a 'columns' list");
    }
    for (i, row) in values.iter().enumerate() {
        if row.len() != columns.len() {
            bail!(
                "row {} has {} value(s), expected {} ({})",
                i + 1,
                row.len(),
                columns.len(),
                columns.join(", ")
            );
        }
    }

    let mut fields: Vec<FieldRef> = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (c, name) in columns.iter().enumerate() {
        let cells: Vec<&Value> = values.iter().map(|row| &row[c]).collect();
        let array = infer_array(&cells);
        fields.push(Arc::new(Field::new(name, array.data_type().clone(), true)));
        arrays.push(array);
    }
    table::build_batch(fields, arrays, values.len())
}

fn infer_array(cells: &[&Value]) -> ArrayRef {
    let present = || cells.iter().filter(|v| !v.is_null());
    let has_values = present().next().is_some();
    if has_values && present().all(|v| v.is_i64()) {
        Arc::new(cells.iter().map(|v| v.as_i64()).collect::<Int64Array>())
    } else if has_values && present().all(|v| v.is_number()) {
        Arc::new(cells.iter().map(|v| v.as_f64()).collect::<Float64Array>())
    } else if has_values && present().all(|v| v.is_boolean()) {
        Arc::new(cells.iter().map(|v| v.as_bool()).collect::<BooleanArray>())
    } else {
        Arc::new(
            cells
                .iter()
                .map(|v| table::scalar_to_string(v))
                .collect::<StringArray>(),
        )
    }
}

/// Delimited text file. Options: `path` (required, relative to the project
/// file), `delimiter` (single character, default `,`), `header` (default
/// true).
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvLoader;

const SCHEMA_INFER_ROWS: usize = 1000;

impl CsvLoader {
    fn resolve_path(request: &LoadRequest<'_>) -> Result<PathBuf> {
        let path = request
            .option_str("path")
            .context("csv source needs a 'path' option")?;
        let path = Path::new(path);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            request.base_dir.join(path)
        })
    }

    fn format(request: &LoadRequest<'_>) -> Result<Format> {
        let delimiter = match request.option_str("delimiter") {
            None => b',',
            Some(d) if d.len() == 1 => d.as_bytes()[0],
            Some(d) => bail!("csv delimiter must be a single byte, got {d:?}"),
        };
        let header = request.option_bool("header").unwrap_or(true);
        Ok(Format::default()
            .with_header(header)
            .with_delimiter(delimiter))
    }
}

impl Loader for CsvLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<RecordBatch> {
        let path = Self::resolve_path(request)?;
        let format = Self::format(request)?;
        let mut file =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;

        let (schema, _) = format
            .infer_schema(&mut file, Some(SCHEMA_INFER_ROWS))
            .with_context(|| format!("Failed to infer schema of {}", path.display()))?;
        file.rewind()?;
        let schema = Arc::new(schema);

        let reader = ReaderBuilder::new(Arc::clone(&schema))
            .with_format(format)
            .build(file)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        tracing::debug!(
            entity = request.entity,
            path = %path.display(),
            batches = batches.len(),
            "Read csv source"
        );
        concat_batches(&schema, &batches).context("Failed to combine csv batches")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use arrow::datatypes::DataType;
    use serde_json::json;
    use std::io::Write;

    fn request<'a>(
        options: &'a Map<String, Value>,
        columns: &'a [String],
        values: &'a [Vec<Value>],
        base_dir: &'a Path,
    ) -> LoadRequest<'a> {
        LoadRequest {
            entity: "site",
            kind: "csv",
            options,
            columns,
            values,
            base_dir,
        }
    }

    #[test]
    fn test_fixed_infers_column_types() {
        let columns = vec!["code".to_string(), "depth".to_string(), "ratio".to_string()];
        let values = vec![
            vec![json!("A"), json!(1), json!(0.5)],
            vec![json!(null), json!(2), json!(1)],
        ];
        let options = Map::new();
        let batch = FixedLoader
            .load(&request(&options, &columns, &values, Path::new(".")))
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(0).data_type(), &DataType::Utf8);
        assert_eq!(batch.column(1).data_type(), &DataType::Int64);
        assert_eq!(batch.column(2).data_type(), &DataType::Float64);
        assert!(batch.column(0).is_null(1));
    }

    #[test]
    fn test_fixed_rejects_ragged_rows() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let values = vec![vec![json!(1)]];
        let err = fixed_batch(&columns, &values).unwrap_err();
        assert!(err.to_string().contains("row 1 has 1 value(s), expected 2"));
    }

    #[test]
    fn test_fixed_empty_values_keep_columns() {
        let columns = vec!["a".to_string()];
        let batch = fixed_batch(&columns, &[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 1);
    }

    #[test]
    fn test_csv_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("sites.csv")).unwrap();
        writeln!(file, "site_name;depth\nA;1\nB;2").unwrap();

        let options = json!({"path": "sites.csv", "delimiter": ";"})
            .as_object()
            .cloned()
            .unwrap();
        let req = request(&options, &[], &[], dir.path());
        let batch = CsvLoader.load(&req).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(table::column_names(&batch), vec!["site_name", "depth"]);
        assert_eq!(req.describe(), "csv sites.csv");
    }

    #[test]
    fn test_csv_missing_file_mentions_path() {
        let dir = tempfile::tempdir().unwrap();
        let options = json!({"path": "nope.csv"}).as_object().cloned().unwrap();
        let err = CsvLoader
            .load(&request(&options, &[], &[], dir.path()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("nope.csv"));
    }

    #[test]
    fn test_csv_requires_path() {
        let options = Map::new();
        let err = CsvLoader
            .load(&request(&options, &[], &[], Path::new(".")))
            .unwrap_err();
        assert!(err.to_string().contains("'path'"));
    }
}
