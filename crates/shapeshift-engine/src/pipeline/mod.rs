//! Per-entity pipeline: extract, filter, link, unnest, translate.

pub mod extract;
pub mod filter;
pub mod link;
pub mod translate;
pub mod unnest;

use std::path::Path;
use std::time::Instant;

use shapeshift_types::{EntityReport, EntitySpec, Phase};

use crate::constraints::ValidatorSet;
use crate::error::PipelineError;
use crate::registry::Registry;
use crate::store::EntityTableStore;
use crate::table::{EntityTable, Identity};

/// Runs the phases for one entity against already-processed dependencies.
pub struct EntityPipeline<'a> {
    pub registry: &'a Registry,
    pub validators: &'a ValidatorSet,
    /// Directory relative loader paths resolve against.
    pub base_dir: &'a Path,
}

impl<'a> EntityPipeline<'a> {
    pub fn new(registry: &'a Registry, validators: &'a ValidatorSet, base_dir: &'a Path) -> Self {
        Self {
            registry,
            validators,
            base_dir,
        }
    }

    /// Process one entity. Every dependency must already be in `store`.
    pub fn process(
        &self,
        spec: &EntitySpec,
        store: &EntityTableStore,
    ) -> Result<(EntityTable, EntityReport), PipelineError> {
        let entity = spec.name.as_str();
        let start = Instant::now();
        let mut report = EntityReport {
            entity: entity.to_string(),
            ..EntityReport::default()
        };
        let mut identity = Identity {
            system_id: spec.system_id.clone(),
            keys: spec.keys.clone(),
            public_id: spec.public_id.clone(),
            ..Identity::default()
        };

        let batch = extract::run(self, spec, store)
            .map_err(|e| e.in_phase(entity, Phase::Extract))?;
        report.rows_extracted = batch.num_rows();
        tracing::debug!(entity, phase = "extract", rows = batch.num_rows(), "Phase complete");

        let batch = filter::run(entity, &batch, &spec.filters)
            .map_err(|e| e.in_phase(entity, Phase::Filter))?;
        report.rows_after_filter = batch.num_rows();

        let linked = link::run(spec, batch, store, self.validators)
            .map_err(|e| e.in_phase(entity, Phase::Link))?;
        identity.foreign_keys = linked.columns;
        report.links = linked.reports;
        report.warnings = linked.warnings;
        let mut batch = linked.batch;

        if let Some(unnest) = &spec.unnest {
            batch = unnest::run(entity, &batch, &mut identity, unnest)
                .map_err(|e| e.in_phase(entity, Phase::Unnest))?;
        }
        if let Some(translate) = &spec.translate {
            batch = translate::run(entity, &batch, &mut identity, translate)
                .map_err(|e| e.in_phase(entity, Phase::Translate))?;
        }

        let table = EntityTable {
            name: spec.name.clone(),
            batch,
            identity,
        };
        report.rows_final = table.num_rows();
        report.columns = table.column_names();
        tracing::info!(
            entity,
            rows = report.rows_final,
            links = report.links.len(),
            warnings = report.warnings.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Entity processed"
        );
        Ok((table, report))
    }
}
