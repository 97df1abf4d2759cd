//! Write-once store of processed entity tables.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::table::EntityTable;

/// Processed tables by entity name, plus insertion order.
///
/// Each name can be inserted once; after that the table is only read.
#[derive(Debug, Default)]
pub struct EntityTableStore {
    tables: HashMap<String, EntityTable>,
    order: Vec<String>,
}

impl EntityTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: EntityTable) -> Result<()> {
        if self.tables.contains_key(&table.name) {
            bail!("entity '{}' is already stored", table.name);
        }
        self.order.push(table.name.clone());
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EntityTable> {
        self.tables.get(name)
    }

    /// Table of a dependency; absence means the processing order was violated.
    pub fn require(&self, name: &str) -> Result<&EntityTable> {
        match self.tables.get(name) {
            Some(table) => Ok(table),
            None => bail!("entity '{name}' has not been processed yet"),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityTable> {
        self.order.iter().filter_map(|name| self.tables.get(name))
    }

    /// Consume the store, yielding tables in insertion order.
    pub fn into_tables(mut self) -> Vec<EntityTable> {
        self.order
            .iter()
            .filter_map(|name| self.tables.remove(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Identity;
    use arrow::array::RecordBatch;
    use arrow::datatypes::Schema;
    use std::sync::Arc;

    fn table(name: &str) -> EntityTable {
        EntityTable {
            name: name.to_string(),
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
            identity: Identity {
                system_id: "system_id".to_string(),
                keys: Vec::new(),
                public_id: None,
                foreign_keys: Vec::new(),
                renamed: Default::default(),
            },
        }
    }

    #[test]
    fn test_insert_is_write_once() {
        let mut store = EntityTableStore::new();
        store.insert(table("site")).unwrap();
        let err = store.insert(table("site")).unwrap_err();
        assert!(err.to_string().contains("already stored"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_require_missing() {
        let store = EntityTableStore::new();
        assert!(store.require("site").is_err());
        assert!(store.get("site").is_none());
    }

    #[test]
    fn test_iteration_keeps_insertion_order() {
        let mut store = EntityTableStore::new();
        for name in ["b", "a", "c"] {
            store.insert(table(name)).unwrap();
        }
        let names: Vec<&str> = store.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        let owned: Vec<String> = store.into_tables().into_iter().map(|t| t.name).collect();
        assert_eq!(owned, vec!["b", "a", "c"]);
    }
}
