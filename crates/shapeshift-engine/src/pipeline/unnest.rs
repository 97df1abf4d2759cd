//! Unnest phase: wide-to-long reshape.
//!
//! Each input row yields one output row per value column. The input
//! `system_id` is kept as a lineage column and a fresh dense `system_id` is
//! assigned to the melted rows.

use std::sync::Arc;

use anyhow::Context;
use arrow::array::{Array, ArrayRef, RecordBatch, StringArray, UInt32Array};
use arrow::compute::{cast, concat, take};
use arrow::datatypes::DataType;
use shapeshift_types::{Phase, UnnestSpec};

use crate::error::PipelineError;
use crate::identity;
use crate::table::{self, Identity};

/// Name of the column holding the pre-unnest `system_id`.
pub fn lineage_column(system_id: &str) -> String {
    format!("source_{system_id}")
}

/// Configuration problems detectable without data.
pub fn check_spec(spec: &UnnestSpec, system_id: &str) -> Vec<String> {
    let mut issues = Vec::new();
    if spec.value_vars.is_empty() {
        issues.push("unnest needs at least one value_vars column".to_string());
    }
    if spec.var_name == spec.value_name {
        issues.push(format!(
            "unnest var_name and value_name are both '{}'",
            spec.var_name
        ));
    }
    for name in [&spec.var_name, &spec.value_name] {
        if name == system_id || *name == lineage_column(system_id) {
            issues.push(format!("unnest output column '{name}' collides with an identity column"));
        }
    }
    for var in &spec.value_vars {
        if spec.id_vars.contains(var) {
            issues.push(format!("column '{var}' is listed in both id_vars and value_vars"));
        }
        if var == system_id {
            issues.push(format!("identity column '{var}' cannot be unnested"));
        }
    }
    issues
}

pub(crate) fn run(
    entity: &str,
    batch: &RecordBatch,
    identity: &mut Identity,
    spec: &UnnestSpec,
) -> Result<RecordBatch, PipelineError> {
    let config_err = |issue: String| PipelineError::config(entity, Phase::Unnest, issue);

    let issues = check_spec(spec, &identity.system_id);
    if !issues.is_empty() {
        return Err(PipelineError::Configuration {
            entity: Some(entity.to_string()),
            phase: Some(Phase::Unnest),
            issues,
        });
    }
    for name in spec.id_vars.iter().chain(&spec.value_vars) {
        if !table::has_column(batch, name) {
            return Err(config_err(format!("unnest references unknown column '{name}'")));
        }
    }
    let identity_columns: Vec<&String> = std::iter::once(&identity.system_id)
        .chain(identity.public_id.as_ref())
        .chain(&identity.foreign_keys)
        .collect();
    if let Some(var) = spec.value_vars.iter().find(|v| identity_columns.contains(v)) {
        return Err(config_err(format!("identity column '{var}' cannot be unnested")));
    }

    let retained: Vec<String> = table::column_names(batch)
        .into_iter()
        .filter(|c| spec.id_vars.contains(c) || identity_columns.contains(&c))
        .collect();
    for name in [&spec.var_name, &spec.value_name] {
        if retained.contains(name) {
            return Err(config_err(format!(
                "unnest output column '{name}' collides with a retained column"
            )));
        }
    }

    let value_type = common_type(batch, &spec.value_vars)?;
    let mut value_columns: Vec<ArrayRef> = Vec::with_capacity(spec.value_vars.len());
    for var in &spec.value_vars {
        let column = batch
            .column_by_name(var)
            .with_context(|| format!("column '{var}' not found"))?;
        let column = if column.data_type() == &value_type {
            Arc::clone(column)
        } else {
            cast(column.as_ref(), &value_type)
                .with_context(|| format!("Failed to cast '{var}' to {value_type}"))?
        };
        value_columns.push(column);
    }

    let rows = batch.num_rows();
    let width = spec.value_vars.len();
    let out_rows = rows * width;
    if u32::try_from(out_rows).is_err() {
        return Err(config_err(format!("unnest would produce {out_rows} rows")));
    }

    // Output row `i * width + j` comes from input row `i` and value column `j`.
    let source_rows: Vec<u32> = (0..rows)
        .flat_map(|i| std::iter::repeat(i as u32).take(width))
        .collect();
    let value_positions = UInt32Array::from_iter_values(
        (0..rows).flat_map(|i| (0..width).map(move |j| (j * rows + i) as u32)),
    );

    let base = table::select_rows(&table::project(batch, &retained)?, &source_rows)?;
    let stacked = concat(&value_columns.iter().map(|c| c.as_ref()).collect::<Vec<&dyn Array>>())
        .context("Failed to stack value columns")?;
    let values = take(stacked.as_ref(), &value_positions, None).context("Failed to melt values")?;
    let names: ArrayRef = Arc::new(StringArray::from_iter_values(
        (0..rows).flat_map(|_| spec.value_vars.iter().map(String::as_str))
            .collect::<Vec<_>>(),
    ));

    let mut melted = table::append_column(&base, &spec.var_name, names)?;
    melted = table::append_column(&melted, &spec.value_name, values)?;

    let lineage = lineage_column(&identity.system_id);
    if table::has_column(&melted, &lineage) {
        return Err(config_err(format!("lineage column '{lineage}' already exists")));
    }
    let system_id = identity.system_id.clone();
    melted = table::rename_columns(&melted, |c| {
        if c == system_id {
            lineage.clone()
        } else {
            c.to_string()
        }
    })?;
    melted = identity::assign_system_ids(&melted, &identity.system_id)?;

    identity.keys.retain(|k| retained.contains(k));
    tracing::debug!(
        entity,
        before = rows,
        after = melted.num_rows(),
        value_vars = width,
        "Unnested"
    );
    Ok(melted)
}

/// Shared type of the value columns, or Utf8 when they disagree.
fn common_type(batch: &RecordBatch, value_vars: &[String]) -> Result<DataType, PipelineError> {
    let mut types = value_vars.iter().filter_map(|v| batch.column_by_name(v)).map(|c| c.data_type());
    let Some(first) = types.next() else {
        return Ok(DataType::Utf8);
    };
    Ok(if types.all(|t| t == first) {
        first.clone()
    } else {
        DataType::Utf8
    })
}
