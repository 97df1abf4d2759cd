//! Semantic validation of a resolved project.
//!
//! Everything checkable without data is checked here, and every issue is
//! collected before failing. Reference existence and cycles belong to the
//! dependency graph.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use shapeshift_types::entity::{KIND_DATA, KIND_FIXED};
use shapeshift_types::{AppendSpec, EntitySpec, FilterSpec, Phase, SourceRef};

use crate::config::types::ProjectSpec;
use crate::error::PipelineError;
use crate::pipeline::{translate, unnest};
use crate::registry::Registry;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid entity name regex"));

/// Validate a project against the loaders available in `registry`.
///
/// # Errors
///
/// Returns a [`PipelineError::Configuration`] listing every issue found.
pub fn validate_project(project: &ProjectSpec, registry: &Registry) -> Result<(), PipelineError> {
    let mut errors = Vec::new();

    if project.entities.is_empty() {
        errors.push("project declares no entities".to_string());
    }

    let mut seen = HashSet::new();
    for spec in &project.entities {
        if !seen.insert(spec.name.as_str()) {
            errors.push(format!("entity '{}' is declared more than once", spec.name));
        }
        for issue in entity_issues(spec, project, registry) {
            errors.push(format!("entity '{}': {issue}", spec.name));
        }
    }

    if !errors.is_empty() {
        return Err(PipelineError::Configuration {
            entity: None,
            phase: Some(Phase::Resolve),
            issues: errors,
        });
    }
    Ok(())
}

fn entity_issues(spec: &EntitySpec, project: &ProjectSpec, registry: &Registry) -> Vec<String> {
    let mut issues = Vec::new();

    if !NAME_RE.is_match(&spec.name) {
        issues.push("name must be snake_case (lowercase letters, digits, underscores)".to_string());
    }
    if spec.system_id.is_empty() {
        issues.push("system_id column name must not be empty".to_string());
    }
    if spec.public_id.as_deref() == Some(spec.system_id.as_str()) {
        issues.push(format!(
            "public_id and system_id cannot share the column name '{}'",
            spec.system_id
        ));
    }

    source_issues(&spec.kind, spec.source.as_ref(), &spec.columns, &spec.values, registry, "", &mut issues);
    for (i, append) in spec.append.iter().enumerate() {
        append_issues(append, i, registry, &mut issues);
    }

    if spec.drop_duplicates.is_some() && spec.keys.is_empty() {
        issues.push("drop_duplicates requires keys".to_string());
    }
    if !spec.public_id_mapping.is_empty() {
        if spec.keys.is_empty() {
            issues.push("public_id_mapping requires keys".to_string());
        }
        if spec.public_id.is_none() {
            issues.push("public_id_mapping requires a public_id column".to_string());
        }
    }
    if spec.keys.iter().any(|k| k == &spec.system_id) {
        issues.push(format!("keys cannot include the system_id column '{}'", spec.system_id));
    }
    if !spec.columns.is_empty() {
        for key in &spec.keys {
            if !spec.columns.contains(key) {
                issues.push(format!("key '{key}' is not among the declared columns"));
            }
        }
    }

    for fk in &spec.foreign_keys {
        if fk.local_keys.is_empty() {
            issues.push(format!("foreign key to '{}' has no local_keys", fk.entity));
            continue;
        }
        let remote_len = if fk.remote_keys.is_empty() {
            match project.entity(&fk.entity) {
                Some(target) => target.keys.len(),
                // unknown targets are reported by the dependency graph
                None => continue,
            }
        } else {
            fk.remote_keys.len()
        };
        if remote_len == 0 {
            issues.push(format!(
                "foreign key to '{}' has no remote_keys and the target declares no keys",
                fk.entity
            ));
        } else if remote_len != fk.local_keys.len() {
            issues.push(format!(
                "foreign key to '{}' pairs {} local key(s) with {remote_len} remote key(s)",
                fk.entity,
                fk.local_keys.len()
            ));
        }
        if fk.alias.as_deref() == Some(spec.system_id.as_str()) {
            issues.push(format!(
                "foreign key alias '{}' collides with the system_id column",
                spec.system_id
            ));
        }
    }

    filter_issues(spec, &mut issues);

    if let Some(unnest) = &spec.unnest {
        issues.extend(unnest::check_spec(unnest, &spec.system_id));
    }
    if let Some(translate) = &spec.translate {
        issues.extend(translate::check_spec(translate, &spec.system_id));
    }

    issues
}

fn source_issues(
    kind: &str,
    source: Option<&SourceRef>,
    columns: &[String],
    values: &[Vec<serde_json::Value>],
    registry: &Registry,
    prefix: &str,
    issues: &mut Vec<String>,
) {
    match (kind, source) {
        (KIND_DATA, Some(SourceRef::Entity(_))) => {}
        (KIND_DATA, _) => {
            issues.push(format!("{prefix}type 'data' needs source naming another entity"));
        }
        (KIND_FIXED, Some(_)) => {
            issues.push(format!("{prefix}type 'fixed' takes its rows from values, not source"));
        }
        (KIND_FIXED, None) => {
            if !registry.has_loader(KIND_FIXED) {
                issues.push(format!("{prefix}no loader registered for type 'fixed'"));
            }
            if columns.is_empty() {
                issues.push(format!("{prefix}type 'fixed' needs columns"));
            }
            for (i, row) in values.iter().enumerate() {
                if row.len() != columns.len() {
                    issues.push(format!(
                        "{prefix}values row {i} has {} value(s) but {} column(s) are declared",
                        row.len(),
                        columns.len()
                    ));
                }
            }
        }
        (other, source) => {
            if !registry.has_loader(other) {
                issues.push(format!(
                    "{prefix}no loader registered for type '{other}' (available: {})",
                    registry.loader_tags().join(", ")
                ));
            }
            if !matches!(source, Some(SourceRef::Options(_))) {
                issues.push(format!("{prefix}type '{other}' needs source options as a mapping"));
            }
        }
    }
}

fn append_issues(append: &AppendSpec, index: usize, registry: &Registry, issues: &mut Vec<String>) {
    let prefix = format!("append[{index}]: ");
    source_issues(
        &append.kind,
        append.source.as_ref(),
        &append.columns,
        &append.values,
        registry,
        &prefix,
        issues,
    );
}

fn filter_issues(spec: &EntitySpec, issues: &mut Vec<String>) {
    for filter in &spec.filters {
        let column = filter.column();
        if !spec.columns.is_empty()
            && !spec.columns.iter().any(|c| c == column)
            && column != spec.system_id
            && spec.public_id.as_deref() != Some(column)
        {
            issues.push(format!(
                "{} filter references column '{column}' which is not among the declared columns",
                filter.kind()
            ));
        }
        match filter {
            FilterSpec::Matches { pattern, .. } => {
                if let Err(e) = Regex::new(pattern) {
                    issues.push(format!("invalid regex '{pattern}' for column '{column}': {e}"));
                }
            }
            FilterSpec::Range { min: None, max: None, .. } => {
                issues.push(format!("range filter on '{column}' needs min or max"));
            }
            FilterSpec::Range {
                min: Some(min),
                max: Some(max),
                ..
            } if min > max => {
                issues.push(format!("range filter on '{column}' has min {min} above max {max}"));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_project_str;
    use std::path::Path;

    fn valid_yaml() -> &'static str {
        r#"
name: survey
entities:
  site:
    type: fixed
    keys: [code]
    columns: [code, name]
    values: [[A, Alpha], [B, Beta]]
  sample:
    type: fixed
    columns: [sample_code, site_ref, depth]
    values: [[s1, B, 1.5]]
    keys: [sample_code]
    drop_duplicates: first
    filters:
      - {type: matches, column: sample_code, pattern: "^s"}
    foreign_keys:
      - {entity: site, local_keys: [site_ref]}
"#
    }

    fn validate(yaml: &str) -> Result<(), PipelineError> {
        let project = parse_project_str(yaml, Path::new(".")).unwrap();
        validate_project(&project, &Registry::builtin())
    }

    fn issues(yaml: &str) -> Vec<String> {
        match validate(yaml).unwrap_err() {
            PipelineError::Configuration { issues, .. } => issues,
            other => panic!("expected configuration error, got {other}"),
        }
    }

    #[test]
    fn test_valid_project_passes() {
        assert!(validate(valid_yaml()).is_ok());
    }

    #[test]
    fn test_bad_entity_name() {
        let yaml = valid_yaml().replace("  site:", "  Site:").replace("entity: site", "entity: Site");
        let issues = issues(&yaml);
        assert!(issues.iter().any(|i| i.contains("'Site'") && i.contains("snake_case")));
    }

    #[test]
    fn test_unknown_loader_type() {
        let yaml = r#"
entities:
  site:
    type: parquet
    source: {path: sites.parquet}
"#;
        let issues = issues(yaml);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("no loader registered for type 'parquet'"));
        assert!(issues[0].contains("csv"));
    }

    #[test]
    fn test_fk_key_length_mismatch_uses_target_keys() {
        let yaml = valid_yaml().replace("local_keys: [site_ref]", "local_keys: [site_ref, depth]");
        let issues = issues(&yaml);
        assert!(issues
            .iter()
            .any(|i| i.contains("pairs 2 local key(s) with 1 remote key(s)")));
    }

    #[test]
    fn test_dedup_without_keys() {
        let yaml = valid_yaml().replace("    keys: [sample_code]\n", "");
        let issues = issues(&yaml);
        assert!(issues.iter().any(|i| i.contains("drop_duplicates requires keys")));
    }

    #[test]
    fn test_filter_column_and_regex_checked() {
        let yaml = valid_yaml().replace(
            r#"{type: matches, column: sample_code, pattern: "^s"}"#,
            r#"{type: matches, column: samplecode, pattern: "("}"#,
        );
        let issues = issues(&yaml);
        assert!(issues.iter().any(|i| i.contains("'samplecode'")));
        assert!(issues.iter().any(|i| i.contains("invalid regex")));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let yaml = r#"
entities:
  a:
    type: data
  b:
    type: fixed
    columns: [x, y]
    values: [[1]]
    public_id_mapping: {"1": 10}
    translate:
      rename: {x: y, y: z}
"#;
        let issues = issues(yaml);
        assert!(issues.iter().any(|i| i.contains("entity 'a'") && i.contains("needs source")));
        assert!(issues.iter().any(|i| i.contains("values row 0")));
        assert!(issues.iter().any(|i| i.contains("public_id_mapping requires keys")));
        assert!(issues.iter().any(|i| i.contains("rename chain")));
    }

    #[test]
    fn test_append_source_checked() {
        let yaml = r#"
entities:
  raw:
    type: fixed
    columns: [x]
    values: [[1]]
  combined:
    source: raw
    append:
      - {type: fixed, source: raw}
"#;
        let issues = issues(yaml);
        assert!(issues.iter().any(|i| i.contains("append[0]: type 'fixed'")));
    }
}
