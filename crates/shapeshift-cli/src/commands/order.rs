use std::path::Path;

use anyhow::{Context, Result};

use shapeshift_engine::{parse_project, DependencyGraph};

/// Execute the `order` command: print processing order with each entity's dependencies.
pub fn execute(project_path: &Path, entity: Option<&str>) -> Result<()> {
    let project = parse_project(project_path)
        .with_context(|| format!("Failed to parse project: {}", project_path.display()))?;

    let graph = DependencyGraph::build(&project.entities)?;
    let order = match entity {
        Some(name) => graph.subgraph_for(name)?,
        None => graph.processing_order()?,
    };

    for (i, name) in order.iter().enumerate() {
        let deps: Vec<String> = graph
            .dependencies_of(name)
            .into_iter()
            .map(|(dep, via)| format!("{dep} ({via})"))
            .collect();
        if deps.is_empty() {
            println!("{:>3}. {name}", i + 1);
        } else {
            println!("{:>3}. {name} <- {}", i + 1, deps.join(", "));
        }
    }
    Ok(())
}
