//! Shared Shapeshift entity configuration and run diagnostics types.
//!
//! This crate carries no behavior beyond accessors; everything that loads,
//! links or reshapes tables lives in `shapeshift-engine`.

pub mod diagnostics;
pub mod entity;

pub use diagnostics::{Checkpoint, EntityReport, LinkReport, Phase, RunReport, Violation};
pub use entity::{
    AppendSpec, Cardinality, DedupPolicy, EntitySpec, FilterSpec, ForeignKeySpec, SourceRef,
    TranslateSpec, UnnestSpec,
};
