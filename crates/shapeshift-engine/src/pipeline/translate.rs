//! Translate phase: rename and reorder columns to the target schema.
//!
//! Purely structural. Applying a translation to its own output changes
//! nothing: a rename whose source is gone but whose target exists is skipped.

use std::collections::BTreeSet;

use arrow::array::RecordBatch;
use shapeshift_types::{Phase, TranslateSpec};

use crate::error::PipelineError;
use crate::table::{self, Identity};

/// Configuration problems detectable without data.
pub fn check_spec(spec: &TranslateSpec, system_id: &str) -> Vec<String> {
    let mut issues = Vec::new();
    let mut targets = BTreeSet::new();
    for (from, to) in &spec.rename {
        if from == to {
            continue;
        }
        if from == system_id {
            issues.push(format!("the system_id column '{from}' cannot be renamed"));
        }
        if to == system_id {
            issues.push(format!("'{from}' cannot be renamed onto the system_id column '{to}'"));
        }
        if spec.rename.get(to).is_some_and(|next| next != to) {
            issues.push(format!("rename chain '{from}' -> '{to}' -> '{}'", spec.rename[to]));
        }
        if !targets.insert(to.as_str()) {
            issues.push(format!("more than one column is renamed to '{to}'"));
        }
    }
    let mut seen = BTreeSet::new();
    for column in &spec.order {
        if !seen.insert(column.as_str()) {
            issues.push(format!("column '{column}' appears twice in order"));
        }
    }
    issues
}

pub(crate) fn run(
    entity: &str,
    batch: &RecordBatch,
    identity: &mut Identity,
    spec: &TranslateSpec,
) -> Result<RecordBatch, PipelineError> {
    let issues = check_spec(spec, &identity.system_id);
    if !issues.is_empty() {
        return Err(PipelineError::Configuration {
            entity: Some(entity.to_string()),
            phase: Some(Phase::Translate),
            issues,
        });
    }
    let config_err = |issue: String| PipelineError::config(entity, Phase::Translate, issue);

    let mut applied = Vec::new();
    for (from, to) in &spec.rename {
        if from == to {
            continue;
        }
        match (table::has_column(batch, from), table::has_column(batch, to)) {
            (true, false) => applied.push((from, to)),
            (true, true) => {
                return Err(config_err(format!(
                    "cannot rename '{from}' to '{to}': both columns exist"
                )))
            }
            (false, true) => {}
            (false, false) => {
                return Err(config_err(format!("cannot rename unknown column '{from}'")))
            }
        }
    }

    let mut renamed = table::rename_columns(batch, |c| {
        applied
            .iter()
            .find(|(from, _)| from.as_str() == c)
            .map_or_else(|| c.to_string(), |(_, to)| (*to).clone())
    })?;

    if !spec.order.is_empty() {
        let current = table::column_names(&renamed);
        if let Some(missing) = spec.order.iter().find(|c| !current.contains(c)) {
            return Err(config_err(format!("order references unknown column '{missing}'")));
        }
        let mut ordered = spec.order.clone();
        ordered.extend(current.into_iter().filter(|c| !spec.order.contains(c)));
        renamed = table::project(&renamed, &ordered)?;
    }

    let translate = |name: &mut String| {
        if let Some(to) = spec.rename.get(name.as_str()) {
            *name = to.clone();
        }
    };
    identity.keys.iter_mut().for_each(translate);
    identity.public_id.iter_mut().for_each(translate);
    identity.foreign_keys.iter_mut().for_each(translate);
    for (from, to) in applied {
        identity.renamed.insert(from.clone(), to.clone());
    }

    tracing::debug!(
        entity,
        renamed = identity.renamed.len(),
        columns = renamed.num_columns(),
        "Translated"
    );
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn input() -> (RecordBatch, Identity) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("site_name", DataType::Utf8, true),
            Field::new("site_ref", DataType::Utf8, true),
            Field::new("system_id", DataType::Int64, false),
            Field::new("site_id", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["A"])),
                Arc::new(StringArray::from(vec!["x"])),
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(Int64Array::from(vec![7])),
            ],
        )
        .unwrap();
        let identity = Identity {
            system_id: "system_id".to_string(),
            keys: vec!["site_name".to_string()],
            public_id: None,
            foreign_keys: vec!["site_id".to_string()],
            renamed: BTreeMap::new(),
        };
        (batch, identity)
    }

    fn spec(rename: &[(&str, &str)], order: &[&str]) -> TranslateSpec {
        TranslateSpec {
            rename: rename
                .iter()
                .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
                .collect(),
            order: order.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_rename_and_order() {
        let (batch, mut identity) = input();
        let spec = spec(&[("site_name", "name"), ("site_id", "location_id")], &["system_id", "name"]);
        let out = run("sample", &batch, &mut identity, &spec).unwrap();
        assert_eq!(
            table::column_names(&out),
            vec!["system_id", "name", "site_ref", "location_id"]
        );
        assert_eq!(identity.keys, vec!["name"]);
        assert_eq!(identity.foreign_keys, vec!["location_id"]);
        assert_eq!(identity.renamed.get("site_name").map(String::as_str), Some("name"));
    }

    #[test]
    fn test_translate_is_idempotent() {
        let (batch, mut identity) = input();
        let spec = spec(&[("site_name", "name")], &["name"]);
        let once = run("sample", &batch, &mut identity, &spec).unwrap();
        let twice = run("sample", &once, &mut identity, &spec).unwrap();
        assert_eq!(once, twice);
        assert_eq!(identity.keys, vec!["name"]);
    }

    #[test]
    fn test_invalid_renames_collected() {
        let bad = spec(
            &[("a", "b"), ("b", "c"), ("d", "c"), ("system_id", "sid")],
            &["x", "x"],
        );
        let issues = check_spec(&bad, "system_id");
        assert_eq!(issues.len(), 4, "{issues:?}");
        assert!(issues.iter().any(|i| i.contains("rename chain")));
        assert!(issues.iter().any(|i| i.contains("more than one")));
        assert!(issues.iter().any(|i| i.contains("system_id")));
        assert!(issues.iter().any(|i| i.contains("twice")));
    }

    #[test]
    fn test_rename_unknown_column_fails() {
        let (batch, mut identity) = input();
        let err = run("sample", &batch, &mut identity, &spec(&[("nope", "other")], &[])).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Translate));
    }

    #[test]
    fn test_rename_onto_existing_column_fails() {
        let (batch, mut identity) = input();
        let err = run("sample", &batch, &mut identity, &spec(&[("site_name", "site_ref")], &[])).unwrap_err();
        assert!(err.to_string().contains("both columns exist"));
    }
}
