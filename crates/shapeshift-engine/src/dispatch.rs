//! Dispatcher contract and the built-in file dispatchers.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arrow::csv::WriterBuilder;
use arrow::json::LineDelimitedWriter;
use serde::Serialize;

use crate::table::EntityTable;

/// Writes finished entity tables somewhere outside the engine.
pub trait Dispatcher: Send + Sync {
    /// Write one entity and return the number of rows written.
    fn dispatch_entity(&self, table: &EntityTable) -> Result<u64>;
}

/// Where a dispatcher built by a registry factory writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub output_dir: PathBuf,
}

impl DispatchTarget {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                self.output_dir.display()
            )
        })
    }

    fn file_for(&self, entity: &str, extension: &str) -> PathBuf {
        self.output_dir.join(format!("{entity}.{extension}"))
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// One `<entity>.csv` per entity, with a header row.
#[derive(Debug, Clone)]
pub struct CsvDispatcher {
    target: DispatchTarget,
}

impl CsvDispatcher {
    pub fn new(target: DispatchTarget) -> Result<Self> {
        target.prepare()?;
        Ok(Self { target })
    }
}

impl Dispatcher for CsvDispatcher {
    fn dispatch_entity(&self, table: &EntityTable) -> Result<u64> {
        let path = self.target.file_for(&table.name, "csv");
        let mut writer = WriterBuilder::new().with_header(true).build(create(&path)?);
        writer
            .write(&table.batch)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        writer.into_inner().flush()?;
        Ok(table.num_rows() as u64)
    }
}

/// One `<entity>.jsonl` per entity, one JSON object per row.
#[derive(Debug, Clone)]
pub struct JsonlDispatcher {
    target: DispatchTarget,
}

impl JsonlDispatcher {
    pub fn new(target: DispatchTarget) -> Result<Self> {
        target.prepare()?;
        Ok(Self { target })
    }
}

impl Dispatcher for JsonlDispatcher {
    fn dispatch_entity(&self, table: &EntityTable) -> Result<u64> {
        let path = self.target.file_for(&table.name, "jsonl");
        let mut writer = LineDelimitedWriter::new(create(&path)?);
        writer
            .write(&table.batch)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        writer.finish()?;
        writer.into_inner().flush()?;
        Ok(table.num_rows() as u64)
    }
}

/// Result of dispatching one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    Written { rows: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityDispatch {
    pub entity: String,
    #[serde(flatten)]
    pub status: DispatchStatus,
}

/// Per-entity outcomes of a dispatch pass, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub outcomes: Vec<EntityDispatch>,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityDispatch> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, DispatchStatus::Failed { .. }))
    }

    pub fn rows_written(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                DispatchStatus::Written { rows } => rows,
                DispatchStatus::Failed { .. } => 0,
            })
            .sum()
    }
}

/// Dispatch every table, continuing past failures.
pub fn dispatch_all<'a>(
    dispatcher: &dyn Dispatcher,
    tables: impl IntoIterator<Item = &'a EntityTable>,
) -> DispatchResult {
    let outcomes = tables
        .into_iter()
        .map(|table| {
            let status = match dispatcher.dispatch_entity(table) {
                Ok(rows) => {
                    tracing::info!(entity = %table.name, rows, "Dispatched entity");
                    DispatchStatus::Written { rows }
                }
                Err(e) => {
                    tracing::error!(entity = %table.name, error = %format!("{e:#}"), "Dispatch failed");
                    DispatchStatus::Failed {
                        error: format!("{e:#}"),
                    }
                }
            };
            EntityDispatch {
                entity: table.name.clone(),
                status,
            }
        })
        .collect();
    DispatchResult { outcomes }
}
