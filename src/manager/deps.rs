//! Start ordering for the services of one snap
//!
//! Builds a directed graph from the apps' After=/Before= relations and
//! performs a topological sort to determine start order. Relations naming
//! apps outside the given set are ignored. Unlike boot ordering, a cycle
//! here is an error: the snap declared an impossible order.

use std::collections::{BTreeMap, BTreeSet};

use crate::backend::AppInfo;

/// Dependency graph over app names
#[derive(Debug, Default)]
struct DepGraph {
    /// Edges: node -> nodes that must start BEFORE this node
    edges: BTreeMap<String, BTreeSet<String>>,
    nodes: BTreeSet<String>,
}

impl DepGraph {
    fn new(apps: &[AppInfo]) -> Self {
        let mut graph = Self::default();
        for app in apps {
            graph.nodes.insert(app.name.clone());
            graph.edges.entry(app.name.clone()).or_default();
        }

        for app in apps {
            // After=X means X must start before us
            for dep in &app.after {
                graph.add_edge(&app.name, dep);
            }
            // Before=X means X depends on us
            for dep in &app.before {
                graph.add_edge(dep, &app.name);
            }
        }
        graph
    }

    /// Add a directed edge: `from` depends on `to` (to must start first)
    fn add_edge(&mut self, from: &str, to: &str) {
        if from == to || !self.nodes.contains(from) || !self.nodes.contains(to) {
            return;
        }
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Kahn's algorithm, picking ready nodes by name for a stable order
    fn toposort(&self) -> Result<Vec<String>, CycleError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            result.push(node.to_string());

            for (dependent, deps) in &self.edges {
                if deps.contains(node) {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            let nodes = self
                .nodes
                .iter()
                .filter(|n| !result.contains(n))
                .cloned()
                .collect();
            return Err(CycleError { nodes });
        }

        Ok(result)
    }
}

/// Sort apps so that every app starts after the apps it depends on
pub fn sort_services(apps: &[AppInfo]) -> Result<Vec<AppInfo>, CycleError> {
    let order = DepGraph::new(apps).toposort()?;

    let by_name: BTreeMap<&str, &AppInfo> = apps.iter().map(|app| (app.name.as_str(), app)).collect();
    Ok(order
        .iter()
        .filter_map(|name| by_name.get(name.as_str()).map(|app| (*app).clone()))
        .collect())
}

/// Error when a dependency cycle is detected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub nodes: Vec<String>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dependency cycle detected involving: {}",
            self.nodes.join(", ")
        )
    }
}

impl std::error::Error for CycleError {}
