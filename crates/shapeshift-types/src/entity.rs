//! Per-entity configuration as it appears under `entities:` in a project file.
//!
//! Values here are plain data. They are deserialized once per run from the
//! fully resolved (directive-free) project document and only borrowed after
//! that.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Loader tag for entities derived from another entity's table.
pub const KIND_DATA: &str = "data";
/// Loader tag for entities whose rows are given inline.
pub const KIND_FIXED: &str = "fixed";
/// Default name of the generated local identity column.
pub const DEFAULT_SYSTEM_ID: &str = "system_id";

fn default_kind() -> String {
    KIND_DATA.to_string()
}

fn default_system_id() -> String {
    DEFAULT_SYSTEM_ID.to_string()
}

fn default_true() -> bool {
    true
}

/// Where an entity (or an appended source) gets its rows from.
///
/// A bare string names another entity; a mapping is handed to the loader
/// registered for the entity's `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceRef {
    Entity(String),
    Options(serde_json::Map<String, serde_json::Value>),
}

impl SourceRef {
    pub fn entity(&self) -> Option<&str> {
        match self {
            Self::Entity(name) => Some(name),
            Self::Options(_) => None,
        }
    }
}

/// Validated, immutable configuration of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySpec {
    /// Filled from the key of the `entities:` mapping.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(
        default = "default_system_id",
        alias = "surrogate_id",
        alias = "system_id_column"
    )]
    pub system_id: String,
    #[serde(default, alias = "public_id_column")]
    pub public_id: Option<String>,
    #[serde(default)]
    pub public_id_mapping: BTreeMap<String, i64>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
    #[serde(default)]
    pub unnest: Option<UnnestSpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub append: Vec<AppendSpec>,
    #[serde(default)]
    pub drop_duplicates: Option<DedupPolicy>,
    #[serde(default)]
    pub translate: Option<TranslateSpec>,
}

impl EntitySpec {
    /// Minimal spec with every optional field at its default.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            source: None,
            depends_on: Vec::new(),
            keys: Vec::new(),
            system_id: default_system_id(),
            public_id: None,
            public_id_mapping: BTreeMap::new(),
            columns: Vec::new(),
            values: Vec::new(),
            foreign_keys: Vec::new(),
            unnest: None,
            filters: Vec::new(),
            append: Vec::new(),
            drop_duplicates: None,
            translate: None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.kind == KIND_FIXED
    }

    /// Entity named by `source`, if the source is an entity reference.
    pub fn source_entity(&self) -> Option<&str> {
        self.source.as_ref().and_then(SourceRef::entity)
    }

    /// Entities referenced as sources, including appended sources.
    pub fn source_entities(&self) -> impl Iterator<Item = &str> {
        self.source_entity().into_iter().chain(
            self.append
                .iter()
                .filter_map(|a| a.source.as_ref().and_then(SourceRef::entity)),
        )
    }
}

/// Link from this entity's local columns to another entity's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeySpec {
    pub entity: String,
    pub local_keys: Vec<String>,
    /// Defaults to the target entity's `keys`.
    #[serde(default)]
    pub remote_keys: Vec<String>,
    #[serde(default)]
    pub how: Cardinality,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub lenient: bool,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ForeignKeySpec {
    pub fn new(entity: impl Into<String>, local_keys: &[&str], remote_keys: &[&str]) -> Self {
        Self {
            entity: entity.into(),
            local_keys: local_keys.iter().map(|s| (*s).to_string()).collect(),
            remote_keys: remote_keys.iter().map(|s| (*s).to_string()).collect(),
            how: Cardinality::default(),
            required: true,
            lenient: false,
            alias: None,
        }
    }
}

/// Declared cardinality of a foreign-key join, read child-to-parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl Cardinality {
    /// Parent keys must be unique (right side is "one").
    pub fn requires_unique_parent(self) -> bool {
        matches!(self, Self::ManyToOne | Self::OneToOne)
    }

    /// Each parent may be referenced by at most one child (left side is "one").
    pub fn requires_unique_child(self) -> bool {
        matches!(self, Self::OneToOne | Self::OneToMany)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManyToOne => "many_to_one",
            Self::OneToOne => "one_to_one",
            Self::OneToMany => "one_to_many",
            Self::ManyToMany => "many_to_many",
        }
    }
}

/// Wide-to-long reshape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnnestSpec {
    #[serde(default)]
    pub id_vars: Vec<String>,
    pub value_vars: Vec<String>,
    pub var_name: String,
    pub value_name: String,
}

/// Row predicate applied after extraction. All filters of an entity are AND-ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    Equals {
        column: String,
        value: serde_json::Value,
    },
    NotEquals {
        column: String,
        value: serde_json::Value,
    },
    In {
        column: String,
        values: Vec<serde_json::Value>,
    },
    NotIn {
        column: String,
        values: Vec<serde_json::Value>,
    },
    IsNull {
        column: String,
    },
    NotNull {
        column: String,
    },
    Matches {
        column: String,
        pattern: String,
    },
    Range {
        column: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

impl FilterSpec {
    pub fn column(&self) -> &str {
        match self {
            Self::Equals { column, .. }
            | Self::NotEquals { column, .. }
            | Self::In { column, .. }
            | Self::NotIn { column, .. }
            | Self::IsNull { column }
            | Self::NotNull { column }
            | Self::Matches { column, .. }
            | Self::Range { column, .. } => column,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Equals { .. } => "equals",
            Self::NotEquals { .. } => "not_equals",
            Self::In { .. } => "in",
            Self::NotIn { .. } => "not_in",
            Self::IsNull { .. } => "is_null",
            Self::NotNull { .. } => "not_null",
            Self::Matches { .. } => "matches",
            Self::Range { .. } => "range",
        }
    }
}

/// Additional source whose rows are unioned into the entity during extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppendSpec {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

/// Business-key deduplication applied during extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Keep the first row per key.
    First,
    /// Keep the last row per key.
    Last,
    /// Drop exact duplicates; a key mapping to differing rows is a violation.
    Strict,
}

/// Structural relabeling to the target schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslateSpec {
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub order: Vec<String>,
}
