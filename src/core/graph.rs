//! SR-005: Dependency graph construction.
//!
//! Resolves declared dependency paths against the registry into an arena of
//! nodes indexed by `NodeId`, records reverse edges, and rejects cycles with
//! an iterative three-color DFS that reports the exact cycle path.
//! Layering uses Kahn's algorithm with path-ordered tie-breaking.

use super::error::StackError;
use super::registry::{relative, Registry};
use super::types::{Module, ScheduleOrder};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Index of a module in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// A resolved dependency edge.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    /// The module depended upon
    pub dependency: NodeId,
    /// Index into the dependent's `Module::dependencies`
    pub declaration: usize,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub module: Module,
    /// Outgoing edges in declaration order (may repeat a target)
    pub dependencies: Vec<Edge>,
    /// Distinct direct dependents, in discovery order
    pub dependents: Vec<NodeId>,
    /// Distinct direct dependencies, in declaration order
    distinct_dependencies: Vec<NodeId>,
}

/// Validated, acyclic module graph for one run.
#[derive(Debug, Clone)]
pub struct Graph {
    root: PathBuf,
    nodes: Vec<Node>,
    index: HashMap<PathBuf, NodeId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

/// Build a validated graph from the registry.
pub fn build_graph(registry: &Registry) -> Result<Graph, StackError> {
    let index: HashMap<PathBuf, NodeId> = registry
        .iter()
        .enumerate()
        .map(|(i, m)| (m.path.clone(), NodeId(i)))
        .collect();

    let mut nodes: Vec<Node> = Vec::with_capacity(registry.len());
    for module in registry.iter() {
        let mut dependencies = Vec::with_capacity(module.dependencies.len());
        for (declaration, dep) in module.dependencies.iter().enumerate() {
            match index.get(&dep.path) {
                Some(&target) => dependencies.push(Edge {
                    dependency: target,
                    declaration,
                }),
                None if dep.optional => {
                    warn!(
                        module = %module.path.display(),
                        dependency = %dep.path.display(),
                        "optional dependency not in stack, edge omitted"
                    );
                }
                None => {
                    return Err(StackError::ConfigResolution {
                        module: module.path.clone(),
                        dependency: dep.path.clone(),
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        let distinct_dependencies = dependencies
            .iter()
            .map(|e| e.dependency)
            .filter(|id| seen.insert(*id))
            .collect();

        nodes.push(Node {
            module: module.clone(),
            dependencies,
            dependents: Vec::new(),
            distinct_dependencies,
        });
    }

    for i in 0..nodes.len() {
        let deps = nodes[i].distinct_dependencies.clone();
        for dep in deps {
            nodes[dep.0].dependents.push(NodeId(i));
        }
    }

    if let Some(cycle) = find_cycle(&nodes) {
        return Err(StackError::Cycle {
            cycle: cycle
                .into_iter()
                .map(|id| nodes[id.0].module.path.clone())
                .collect(),
        });
    }

    let graph = Graph {
        root: registry.root().to_path_buf(),
        nodes,
        index,
    };
    debug!(modules = graph.len(), edges = graph.edge_count(), "graph built");
    Ok(graph)
}

/// Iterative DFS with three-color marking. Returns the first cycle found, as
/// the path from the re-entered node to the node closing the loop.
fn find_cycle(nodes: &[Node]) -> Option<Vec<NodeId>> {
    let mut color = vec![Color::Unvisited; nodes.len()];

    for start in 0..nodes.len() {
        if color[start] != Color::Unvisited {
            continue;
        }
        // (node, next edge to explore)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::InProgress;

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let Some(edge) = nodes[node].dependencies.get(next) else {
                color[node] = Color::Done;
                stack.pop();
                continue;
            };
            frame.1 += 1;

            let target = edge.dependency.0;
            match color[target] {
                Color::Unvisited => {
                    color[target] = Color::InProgress;
                    stack.push((target, 0));
                }
                Color::InProgress => {
                    let from = stack.iter().position(|(n, _)| *n == target).unwrap_or(0);
                    return Some(stack[from..].iter().map(|(n, _)| NodeId(*n)).collect());
                }
                Color::Done => {}
            }
        }
    }

    None
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn module(&self, id: NodeId) -> &Module {
        &self.nodes[id.0].module
    }

    pub fn id_of(&self, path: &Path) -> Option<NodeId> {
        self.index.get(path).copied()
    }

    /// Distinct direct dependencies.
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].distinct_dependencies
    }

    /// Distinct direct dependents.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].dependents
    }

    /// Modules that must finish before `id` may start, for the given order.
    pub fn prerequisites(&self, id: NodeId, order: ScheduleOrder) -> &[NodeId] {
        match order {
            ScheduleOrder::Forward => self.dependencies(id),
            ScheduleOrder::Reverse => self.dependents(id),
        }
    }

    /// Modules waiting on `id`, for the given order.
    pub fn successors(&self, id: NodeId, order: ScheduleOrder) -> &[NodeId] {
        match order {
            ScheduleOrder::Forward => self.dependents(id),
            ScheduleOrder::Reverse => self.dependencies(id),
        }
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.distinct_dependencies.len()).sum()
    }

    /// Module path relative to the stack root, for display.
    pub fn display_path(&self, id: NodeId) -> String {
        relative(&self.root, &self.module(id).path)
            .display()
            .to_string()
    }

    /// Topological layers: every module appears strictly after all of its
    /// dependencies. Layers are ordered by path.
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.distinct_dependencies.len())
            .collect();

        let mut current: Vec<NodeId> = self.ids().filter(|id| in_degree[id.0] == 0).collect();
        let mut layers = Vec::new();

        while !current.is_empty() {
            current.sort_by(|a, b| self.module(*a).path.cmp(&self.module(*b).path));
            let mut next = Vec::new();
            for id in &current {
                for dependent in self.dependents(*id) {
                    in_degree[dependent.0] -= 1;
                    if in_degree[dependent.0] == 0 {
                        next.push(*dependent);
                    }
                }
            }
            layers.push(std::mem::replace(&mut current, next));
        }

        layers
    }

    /// Modules in execution order for `order`.
    pub fn execution_order(&self, order: ScheduleOrder) -> Vec<NodeId> {
        let layers = self.layers();
        match order {
            ScheduleOrder::Forward => layers.into_iter().flatten().collect(),
            ScheduleOrder::Reverse => layers.into_iter().rev().flatten().collect(),
        }
    }

    /// Layered module paths; a pure function of the graph.
    pub fn dump(&self) -> Vec<Vec<PathBuf>> {
        self.layers()
            .into_iter()
            .map(|layer| {
                layer
                    .into_iter()
                    .map(|id| self.module(id).path.clone())
                    .collect()
            })
            .collect()
    }

    /// Layers as `{"Group 1": [...], ...}` with root-relative paths.
    pub fn module_groups(&self) -> IndexMap<String, Vec<String>> {
        self.layers()
            .into_iter()
            .enumerate()
            .map(|(i, layer)| {
                (
                    format!("Group {}", i + 1),
                    layer.into_iter().map(|id| self.display_path(id)).collect(),
                )
            })
            .collect()
    }

    /// Graphviz DOT rendering; edges point from a module to its dependency.
    pub fn to_dot(&self) -> String {
        let mut ids: Vec<NodeId> = self.ids().collect();
        ids.sort_by_key(|id| self.display_path(*id));

        let mut out = String::from("digraph {\n");
        for id in ids {
            let name = self.display_path(id);
            let _ = writeln!(out, "\t\"{}\" ;", name);
            let mut deps: Vec<String> = self
                .dependencies(id)
                .iter()
                .map(|d| self.display_path(*d))
                .collect();
            deps.sort();
            for dep in deps {
                let _ = writeln!(out, "\t\"{}\" -> \"{}\";", name, dep);
            }
        }
        out.push_str("}\n");
        out
    }
}
