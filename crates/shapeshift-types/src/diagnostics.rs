//! Run diagnostics: per-entity counts, link statistics and validator findings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage of an entity run an error or finding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Configuration resolution and validation, before any entity runs.
    Resolve,
    Extract,
    Filter,
    Link,
    Unnest,
    Translate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolve => "resolve",
            Self::Extract => "extract",
            Self::Filter => "filter",
            Self::Link => "link",
            Self::Unnest => "unnest",
            Self::Translate => "translate",
        };
        f.write_str(s)
    }
}

/// When a constraint check runs relative to a foreign-key join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    PreMerge,
    PostMerge,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreMerge => f.write_str("pre_merge"),
            Self::PostMerge => f.write_str("post_merge"),
        }
    }
}

/// One failed constraint check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub entity: String,
    pub check: String,
    pub columns: Vec<String>,
    pub message: String,
    /// Number of offending rows or values.
    pub count: usize,
    /// A few offending values, rendered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<String>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on '{}' [{}]: {}",
            self.check,
            self.entity,
            self.columns.join(", "),
            self.message
        )?;
        if !self.sample.is_empty() {
            write!(f, " (e.g. {})", self.sample.join(", "))?;
        }
        Ok(())
    }
}

/// Outcome of one foreign-key link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    pub target: String,
    pub column: String,
    pub matched: usize,
    pub unmatched: usize,
}

/// Counts and findings for one processed entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity: String,
    pub rows_extracted: usize,
    pub rows_after_filter: usize,
    pub rows_final: usize,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Violation>,
}

/// Externally observable diagnostics of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub project: String,
    pub processing_order: Vec<String>,
    pub entities: Vec<EntityReport>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
}

impl RunReport {
    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity == name)
    }

    pub fn warning_count(&self) -> usize {
        self.entities.iter().map(|e| e.warnings.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_display_includes_sample() {
        let v = Violation {
            entity: "site".to_string(),
            check: "unique_parent_keys".to_string(),
            columns: vec!["code".to_string()],
            message: "1 duplicated key value(s)".to_string(),
            count: 1,
            sample: vec!["X".to_string()],
        };
        assert_eq!(
            v.to_string(),
            "unique_parent_keys on 'site' [code]: 1 duplicated key value(s) (e.g. X)"
        );
    }

    #[test]
    fn phase_serializes_snake_case() {
        let json = serde_json::to_string(&Phase::Link).unwrap();
        assert_eq!(json, "\"link\"");
        assert_eq!(Checkpoint::PostMerge.to_string(), "post_merge");
    }

    #[test]
    fn report_counts_warnings_across_entities() {
        let warning = Violation {
            entity: "sample".to_string(),
            check: "one_child_per_parent".to_string(),
            columns: vec!["site_id".to_string()],
            message: "parent referenced twice".to_string(),
            count: 2,
            sample: Vec::new(),
        };
        let report = RunReport {
            project: "demo".to_string(),
            processing_order: vec!["site".to_string(), "sample".to_string()],
            entities: vec![
                EntityReport {
                    entity: "site".to_string(),
                    ..EntityReport::default()
                },
                EntityReport {
                    entity: "sample".to_string(),
                    warnings: vec![warning],
                    ..EntityReport::default()
                },
            ],
            started_at: Utc::now(),
            duration_secs: 0.0,
        };
        assert_eq!(report.warning_count(), 1);
        assert!(report.entity("sample").is_some());
        assert!(report.entity("missing").is_none());
    }
}
