//! Resolved project configuration.

use std::path::PathBuf;

use shapeshift_types::EntitySpec;

/// A fully resolved project: directive-free, entities in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSpec {
    pub name: String,
    /// Directory the project file lives in; relative loader paths resolve here.
    pub base_dir: PathBuf,
    pub entities: Vec<EntitySpec>,
}

impl ProjectSpec {
    pub fn entity(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.name.as_str())
    }
}
