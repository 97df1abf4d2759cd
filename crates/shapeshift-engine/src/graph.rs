//! Entity dependency graph and processing order.
//!
//! Edges point from a dependent entity to the entity it needs, and come from
//! three signals: explicit `depends_on`, foreign-key targets, and `source`
//! references (including appended sources). Names are validated before any
//! cycle detection so a typo is reported as a missing dependency rather than
//! as a malformed graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use shapeshift_types::{EntitySpec, Phase};

use crate::error::PipelineError;

/// Which configuration signal produced an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    DependsOn,
    ForeignKey,
    Source,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependsOn => f.write_str("depends_on"),
            Self::ForeignKey => f.write_str("foreign_key"),
            Self::Source => f.write_str("source"),
        }
    }
}

/// Entities in an order where each one follows everything it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOrder {
    names: Vec<String>,
}

impl ProcessingOrder {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    InProgress,
    Done,
}

/// Directed graph over entity names, in input order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `edges[i]` lists what entity `i` depends on, first signal wins.
    edges: Vec<Vec<(usize, DependencyKind)>>,
}

impl DependencyGraph {
    /// Build the graph, failing on duplicate names or references to unknown entities.
    pub fn build(specs: &[EntitySpec]) -> Result<Self, PipelineError> {
        let mut index = HashMap::with_capacity(specs.len());
        let mut duplicates = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                duplicates.push(format!("entity '{}' is defined more than once", spec.name));
            }
        }
        if !duplicates.is_empty() {
            return Err(PipelineError::Configuration {
                entity: None,
                phase: Some(Phase::Resolve),
                issues: duplicates,
            });
        }

        let mut edges: Vec<Vec<(usize, DependencyKind)>> = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            let references = spec
                .depends_on
                .iter()
                .map(|name| (name.as_str(), DependencyKind::DependsOn))
                .chain(
                    spec.foreign_keys
                        .iter()
                        .map(|fk| (fk.entity.as_str(), DependencyKind::ForeignKey)),
                )
                .chain(spec.source_entities().map(|name| (name, DependencyKind::Source)));

            for (reference, via) in references {
                let Some(&dep) = index.get(reference) else {
                    return Err(PipelineError::MissingDependency {
                        entity: spec.name.clone(),
                        reference: reference.to_string(),
                        via,
                    });
                };
                if !edges[i].iter().any(|(existing, _)| *existing == dep) {
                    edges[i].push((dep, via));
                }
            }
        }

        Ok(Self {
            nodes: specs.iter().map(|s| s.name.clone()).collect(),
            index,
            edges,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct dependencies of `name` with the signal that produced each edge.
    pub fn dependencies_of(&self, name: &str) -> Vec<(&str, DependencyKind)> {
        self.index
            .get(name)
            .map(|&i| {
                self.edges[i]
                    .iter()
                    .map(|&(dep, kind)| (self.nodes[dep].as_str(), kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entities that directly depend on `name`, in input order.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        let Some(&target) = self.index.get(name) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.iter().any(|&(dep, _)| dep == target))
            .map(|(i, _)| self.nodes[i].as_str())
            .collect()
    }

    /// First cycle found by a depth-first walk in input order.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut state = vec![Visit::New; self.nodes.len()];
        let mut path = Vec::new();
        for start in 0..self.nodes.len() {
            if state[start] == Visit::New {
                if let Some(cycle) = self.visit(start, &mut state, &mut path) {
                    return Some(cycle.into_iter().map(|i| self.nodes[i].clone()).collect());
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, state: &mut [Visit], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        state[node] = Visit::InProgress;
        path.push(node);
        for &(dep, _) in &self.edges[node] {
            match state[dep] {
                Visit::InProgress => {
                    let start = path.iter().position(|&n| n == dep)?;
                    return Some(path[start..].to_vec());
                }
                Visit::New => {
                    if let Some(cycle) = self.visit(dep, state, path) {
                        return Some(cycle);
                    }
                }
                Visit::Done => {}
            }
        }
        path.pop();
        state[node] = Visit::Done;
        None
    }

    /// Topological order; ties go to the entity defined first.
    pub fn processing_order(&self) -> Result<ProcessingOrder, PipelineError> {
        let n = self.nodes.len();
        let mut remaining_deps: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in self.edges.iter().enumerate() {
            for &(dep, _) in deps {
                dependents[dep].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = remaining_deps
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut names = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            names.push(self.nodes[i].clone());
            for &next in &dependents[i] {
                remaining_deps[next] -= 1;
                if remaining_deps[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if names.len() != n {
            let cycle = self.find_cycle().unwrap_or_else(|| {
                // Kahn leftovers always contain a cycle; fall back to listing them.
                self.nodes
                    .iter()
                    .filter(|name| !names.contains(name))
                    .cloned()
                    .collect()
            });
            return Err(PipelineError::CircularDependency { cycle });
        }

        Ok(ProcessingOrder { names })
    }

    /// `target` and everything it transitively depends on, in processing order.
    pub fn subgraph_for(&self, target: &str) -> Result<ProcessingOrder, PipelineError> {
        let Some(&root) = self.index.get(target) else {
            return Err(PipelineError::Configuration {
                entity: Some(target.to_string()),
                phase: Some(Phase::Resolve),
                issues: vec![format!("entity '{target}' is not defined")],
            });
        };

        let mut needed = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            if needed[i] {
                continue;
            }
            needed[i] = true;
            stack.extend(self.edges[i].iter().map(|&(dep, _)| dep));
        }

        let order = self.processing_order()?;
        Ok(ProcessingOrder {
            names: order
                .into_vec()
                .into_iter()
                .filter(|name| self.index.get(name).is_some_and(|&i| needed[i]))
                .collect(),
        })
    }
}

/// Build the graph and compute the processing order in one step.
pub fn build(specs: &[EntitySpec]) -> Result<ProcessingOrder, PipelineError> {
    DependencyGraph::build(specs)?.processing_order()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use shapeshift_types::entity::KIND_FIXED;
    use shapeshift_types::{ForeignKeySpec, SourceRef};

    fn entity(name: &str) -> EntitySpec {
        EntitySpec::new(name, KIND_FIXED)
    }

    fn depends(name: &str, deps: &[&str]) -> EntitySpec {
        let mut spec = entity(name);
        spec.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
        spec
    }

    #[test]
    fn test_empty_project_has_empty_order() {
        let order = build(&[]).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn test_ties_keep_input_order() {
        let specs = vec![entity("c"), entity("a"), entity("b")];
        let order = build(&specs).unwrap();
        assert_eq!(order.names(), ["c", "a", "b"]);
    }

    #[test]
    fn test_all_three_signals_create_edges() {
        let mut sample = entity("sample");
        sample.foreign_keys = vec![ForeignKeySpec::new("site", &["site_ref"], &["site_name"])];
        let mut derived = EntitySpec::new("derived", "data");
        derived.source = Some(SourceRef::Entity("sample".to_string()));
        let specs = vec![derived, depends("report", &["derived"]), sample, entity("site")];

        let order = build(&specs).unwrap();
        assert_eq!(order.names(), ["site", "sample", "derived", "report"]);

        let graph = DependencyGraph::build(&specs).unwrap();
        assert_eq!(
            graph.dependencies_of("sample"),
            vec![("site", DependencyKind::ForeignKey)]
        );
        assert_eq!(
            graph.dependencies_of("derived"),
            vec![("sample", DependencyKind::Source)]
        );
        assert_eq!(graph.dependents_of("sample"), vec!["derived"]);
    }

    #[test]
    fn test_duplicate_signals_collapse_to_one_edge() {
        let mut sample = depends("sample", &["site"]);
        sample.foreign_keys = vec![ForeignKeySpec::new("site", &["site_ref"], &["site_name"])];
        let graph = DependencyGraph::build(&[entity("site"), sample]).unwrap();
        assert_eq!(
            graph.dependencies_of("sample"),
            vec![("site", DependencyKind::DependsOn)]
        );
    }

    #[test]
    fn test_missing_reference_reported_before_cycle() {
        // a <-> b is cyclic, but the unknown name must win.
        let specs = vec![depends("a", &["b"]), depends("b", &["a", "ghost"])];
        let err = build(&specs).unwrap_err();
        match err {
            PipelineError::MissingDependency {
                entity,
                reference,
                via,
            } => {
                assert_eq!(entity, "b");
                assert_eq!(reference, "ghost");
                assert_eq!(via, DependencyKind::DependsOn);
            }
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let specs = vec![depends("a", &["b"]), depends("b", &["c"]), depends("c", &["a"])];
        let err = build(&specs).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::CircularDependency);
        match err {
            PipelineError::CircularDependency { cycle } => assert_eq!(cycle, ["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_excludes_acyclic_prefix() {
        let specs = vec![
            depends("root", &["x"]),
            depends("x", &["y"]),
            depends("y", &["x"]),
            entity("free"),
        ];
        match build(&specs).unwrap_err() {
            PipelineError::CircularDependency { cycle } => assert_eq!(cycle, ["x", "y"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        match build(&[depends("a", &["a"])]).unwrap_err() {
            PipelineError::CircularDependency { cycle } => assert_eq!(cycle, ["a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = build(&[entity("a"), entity("a")]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_subgraph_for_target() {
        let specs = vec![
            entity("site"),
            entity("unrelated"),
            depends("sample", &["site"]),
            depends("analysis", &["sample"]),
        ];
        let graph = DependencyGraph::build(&specs).unwrap();
        let order = graph.subgraph_for("sample").unwrap();
        assert_eq!(order.names(), ["site", "sample"]);
        assert!(graph.subgraph_for("nope").is_err());
    }
}
