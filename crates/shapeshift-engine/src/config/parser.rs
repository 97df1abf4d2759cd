//! Project YAML parsing: environment variable substitution, `@include` and
//! `@value` directives, then conversion to a [`ProjectSpec`].
//!
//! Directives may be written as a single-key mapping (`{"@include": path}`)
//! or as a string scalar (`"@value: entities.site.keys"`). Includes resolve
//! relative to the including file; values resolve against the root document
//! after all includes are in place. Nothing downstream of this module ever
//! sees a directive.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use shapeshift_types::EntitySpec;

use crate::config::types::ProjectSpec;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

static DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@[A-Za-z_]+\s*:").expect("valid directive regex"));

const INCLUDE: &str = "@include";
const VALUE: &str = "@value";
/// Bound on nested `@value` lookups.
const MAX_VALUE_DEPTH: usize = 32;

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                if !errors.iter().any(|e| e == var_name) {
                    errors.push(var_name.to_string());
                }
            }
        }
    }

    if !errors.is_empty() {
        bail!("Missing environment variable(s): {}", errors.join(", "));
    }

    Ok(result)
}

enum Directive<'a> {
    Include(&'a str),
    Value(&'a str),
}

fn directive(value: &Value) -> Option<Directive<'_>> {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix(INCLUDE).and_then(|r| r.trim_start().strip_prefix(':')) {
                Some(Directive::Include(rest.trim()))
            } else {
                s.strip_prefix(VALUE)
                    .and_then(|r| r.trim_start().strip_prefix(':'))
                    .map(|rest| Directive::Value(rest.trim()))
            }
        }
        Value::Mapping(map) if map.len() == 1 => {
            let (key, target) = map.iter().next()?;
            match (key.as_str()?, target.as_str()?) {
                (INCLUDE, path) => Some(Directive::Include(path.trim())),
                (VALUE, path) => Some(Directive::Value(path.trim())),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Read, substitute and parse one YAML file.
fn load_yaml_file(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read project file: {}", path.display()))?;
    let substituted = substitute_env_vars(&content)
        .with_context(|| format!("In {}", path.display()))?;
    serde_yaml::from_str(&substituted)
        .with_context(|| format!("Failed to parse YAML in {}", path.display()))
}

fn resolve_includes(value: Value, base_dir: &Path, stack: &mut Vec<PathBuf>) -> Result<Value> {
    if let Some(Directive::Include(relative)) = directive(&value) {
        let path = base_dir.join(relative);
        let canonical = fs::canonicalize(&path)
            .with_context(|| format!("Failed to resolve @include {}", path.display()))?;
        if stack.contains(&canonical) {
            let chain: Vec<String> = stack
                .iter()
                .chain(std::iter::once(&canonical))
                .map(|p| p.display().to_string())
                .collect();
            bail!("@include cycle: {}", chain.join(" -> "));
        }
        let included = load_yaml_file(&canonical)?;
        let dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
        stack.push(canonical);
        let resolved = resolve_includes(included, &dir, stack);
        stack.pop();
        return resolved;
    }

    match value {
        Value::Mapping(map) => {
            let mut out = Mapping::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, resolve_includes(item, base_dir, stack)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| resolve_includes(item, base_dir, stack))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        other => Ok(other),
    }
}

/// Follow a dotted path (`entities.site.keys`, `lists.0`) into `root`.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Mapping(map) => map.get(segment),
        Value::Sequence(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn resolve_values(value: &Value, root: &Value, trail: &mut Vec<String>) -> Result<Value> {
    if let Some(Directive::Value(path)) = directive(value) {
        if trail.iter().any(|p| p == path) || trail.len() >= MAX_VALUE_DEPTH {
            bail!("@value cycle: {} -> {path}", trail.join(" -> "));
        }
        let target = lookup(root, path).with_context(|| format!("@value path '{path}' not found"))?;
        trail.push(path.to_string());
        let resolved = resolve_values(target, root, trail);
        trail.pop();
        return resolved;
    }

    match value {
        Value::Mapping(map) => {
            let mut out = Mapping::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_values(item, root, trail)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(items) => items
            .iter()
            .map(|item| resolve_values(item, root, trail))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        other => Ok(other.clone()),
    }
}

fn find_unresolved(value: &Value, path: &str, found: &mut Vec<String>) {
    match value {
        Value::String(s) if DIRECTIVE_RE.is_match(s) => found.push(format!("{path}: {s}")),
        Value::Mapping(map) => {
            for (key, item) in map {
                let key_str = key.as_str().unwrap_or("?");
                let child = if path.is_empty() {
                    key_str.to_string()
                } else {
                    format!("{path}.{key_str}")
                };
                if key_str.starts_with('@') {
                    found.push(format!("{child}: unknown directive"));
                }
                find_unresolved(item, &child, found);
            }
        }
        Value::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                find_unresolved(item, &format!("{path}.{i}"), found);
            }
        }
        _ => {}
    }
}

/// Resolve every directive in `doc`. Includes resolve against `base_dir`.
///
/// # Errors
///
/// Fails on missing files, include or value cycles, unknown `@value` paths,
/// and any directive left over after resolution.
pub fn resolve_directives(doc: Value, base_dir: &Path, origin: Option<PathBuf>) -> Result<Value> {
    let mut stack: Vec<PathBuf> = origin.into_iter().collect();
    let included = resolve_includes(doc, base_dir, &mut stack)?;
    let resolved = resolve_values(&included, &included, &mut Vec::new())?;

    let mut unresolved = Vec::new();
    find_unresolved(&resolved, "", &mut unresolved);
    if !unresolved.is_empty() {
        bail!(
            "Unresolved directive(s) in project:\n  - {}",
            unresolved.join("\n  - ")
        );
    }
    Ok(resolved)
}

fn build_project(doc: Value, base_dir: &Path, fallback_name: &str) -> Result<ProjectSpec> {
    let Value::Mapping(mut root) = doc else {
        bail!("Project file must be a YAML mapping");
    };
    let name = root
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(fallback_name)
        .to_string();
    let entities = match root.remove("entities") {
        Some(Value::Mapping(map)) => map,
        None | Some(Value::Null) => Mapping::new(),
        Some(_) => bail!("'entities' must map entity names to their configuration"),
    };

    let mut specs = Vec::with_capacity(entities.len());
    let mut errors = Vec::new();
    for (key, value) in entities {
        let Some(entity) = key.as_str() else {
            errors.push(format!("entity key {key:?} is not a string"));
            continue;
        };
        let value = if value.is_null() {
            Value::Mapping(Mapping::new())
        } else {
            value
        };
        match serde_yaml::from_value::<EntitySpec>(value) {
            Ok(mut spec) => {
                spec.name = entity.to_string();
                specs.push(spec);
            }
            Err(e) => errors.push(format!("entity '{entity}': {e}")),
        }
    }
    if !errors.is_empty() {
        bail!("Project configuration is invalid:\n  - {}", errors.join("\n  - "));
    }

    Ok(ProjectSpec {
        name,
        base_dir: base_dir.to_path_buf(),
        entities: specs,
    })
}

/// Parse a project YAML string. Includes and loader paths resolve against
/// `base_dir`.
///
/// # Errors
///
/// Returns an error if substitution, YAML parsing, directive resolution or
/// entity deserialization fails.
pub fn parse_project_str(yaml_str: &str, base_dir: &Path) -> Result<ProjectSpec> {
    let substituted = substitute_env_vars(yaml_str)?;
    let doc: Value = serde_yaml::from_str(&substituted).context("Failed to parse project YAML")?;
    let resolved = resolve_directives(doc, base_dir, None)?;
    build_project(resolved, base_dir, "project")
}

/// Parse a project YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the project is invalid.
pub fn parse_project(path: &Path) -> Result<ProjectSpec> {
    let canonical = fs::canonicalize(path)
        .with_context(|| format!("Failed to read project file: {}", path.display()))?;
    let base_dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    let fallback = canonical
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("project")
        .to_string();

    let doc = load_yaml_file(&canonical)?;
    let resolved = resolve_directives(doc, &base_dir, Some(canonical.clone()))?;
    tracing::debug!(path = %canonical.display(), "Resolved project directives");
    build_project(resolved, &base_dir, &fallback)
}
