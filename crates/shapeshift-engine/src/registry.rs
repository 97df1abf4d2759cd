//! Explicit registry of loader and dispatcher factories.
//!
//! Hosts start from [`Registry::builtin`] and register their own tags before
//! a run. There is no global state: the registry is passed to the
//! orchestrator by reference.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::dispatch::{CsvDispatcher, DispatchTarget, Dispatcher, JsonlDispatcher};
use crate::loader::{CsvLoader, FixedLoader, Loader};

pub type LoaderFactory = Box<dyn Fn() -> Box<dyn Loader> + Send + Sync>;
pub type DispatcherFactory =
    Box<dyn Fn(&DispatchTarget) -> Result<Box<dyn Dispatcher>> + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    loaders: BTreeMap<String, LoaderFactory>,
    dispatchers: BTreeMap<String, DispatcherFactory>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("loaders", &self.loader_tags())
            .field("dispatchers", &self.dispatcher_tags())
            .finish()
    }
}

impl Registry {
    /// Registry with no plugins at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loaders `fixed` and `csv`, dispatchers `csv` and `jsonl`.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_loader("fixed", || Box::new(FixedLoader));
        registry.register_loader("csv", || Box::new(CsvLoader));
        registry.register_dispatcher("csv", |target| {
            Ok(Box::new(CsvDispatcher::new(target.clone())?))
        });
        registry.register_dispatcher("jsonl", |target| {
            Ok(Box::new(JsonlDispatcher::new(target.clone())?))
        });
        registry
    }

    /// Register a loader tag; a later registration replaces an earlier one.
    pub fn register_loader<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn() -> Box<dyn Loader> + Send + Sync + 'static,
    {
        if self
            .loaders
            .insert(tag.to_string(), Box::new(factory))
            .is_some()
        {
            tracing::debug!(tag, "Replaced loader registration");
        }
    }

    pub fn register_dispatcher<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&DispatchTarget) -> Result<Box<dyn Dispatcher>> + Send + Sync + 'static,
    {
        if self
            .dispatchers
            .insert(tag.to_string(), Box::new(factory))
            .is_some()
        {
            tracing::debug!(tag, "Replaced dispatcher registration");
        }
    }

    pub fn has_loader(&self, tag: &str) -> bool {
        self.loaders.contains_key(tag)
    }

    pub fn loader(&self, tag: &str) -> Option<Box<dyn Loader>> {
        self.loaders.get(tag).map(|factory| factory())
    }

    pub fn dispatcher(&self, tag: &str, target: &DispatchTarget) -> Result<Box<dyn Dispatcher>> {
        match self.dispatchers.get(tag) {
            Some(factory) => factory(target),
            None => bail!(
                "no dispatcher registered for '{tag}' (available: {})",
                self.dispatcher_tags().join(", ")
            ),
        }
    }

    pub fn loader_tags(&self) -> Vec<&str> {
        self.loaders.keys().map(String::as_str).collect()
    }

    pub fn dispatcher_tags(&self) -> Vec<&str> {
        self.dispatchers.keys().map(String::as_str).collect()
    }
}
