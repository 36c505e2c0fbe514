//! Service dependency graph.
//!
//! Edges point from a dependent service to the service it depends on. The
//! graph is always scoped to the services a group targets; edges leaving
//! that set are ignored.
//!
//! Ordering is deterministic: whenever several services are eligible at the
//! same point, the one created first wins, then the lower identifier.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use railyard_id::ServiceId;
use thiserror::Error;

use crate::model::{DependencyType, Service, ServiceDependency};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The path starts and ends with the same service.
    #[error("dependency cycle detected: {}", names.join(" -> "))]
    CycleDetected {
        path: Vec<ServiceId>,
        names: Vec<String>,
    },
}

/// A service as seen by the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: ServiceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl GraphNode {
    fn sort_key(&self) -> (DateTime<Utc>, ServiceId) {
        (self.created_at, self.id)
    }
}

impl From<&Service> for GraphNode {
    fn from(service: &Service) -> Self {
        Self {
            id: service.id,
            name: service.name.clone(),
            created_at: service.created_at,
        }
    }
}

/// Builds [`DependencyGraph`]s.
pub struct GraphBuilder;

impl GraphBuilder {
    /// Builds the graph induced by `nodes` over `edges`.
    pub fn build(
        nodes: impl IntoIterator<Item = GraphNode>,
        edges: &[ServiceDependency],
    ) -> DependencyGraph {
        let nodes: BTreeMap<ServiceId, GraphNode> =
            nodes.into_iter().map(|n| (n.id, n)).collect();

        let mut upstream: BTreeMap<ServiceId, Vec<(ServiceId, DependencyType)>> =
            nodes.keys().map(|id| (*id, Vec::new())).collect();
        let mut downstream: BTreeMap<ServiceId, Vec<ServiceId>> =
            nodes.keys().map(|id| (*id, Vec::new())).collect();

        for edge in edges {
            if !nodes.contains_key(&edge.service_id) || !nodes.contains_key(&edge.depends_on) {
                continue;
            }
            if let Some(ups) = upstream.get_mut(&edge.service_id) {
                if ups.iter().any(|(id, _)| *id == edge.depends_on) {
                    continue;
                }
                ups.push((edge.depends_on, edge.dependency_type));
            }
            if let Some(downs) = downstream.get_mut(&edge.depends_on) {
                downs.push(edge.service_id);
            }
        }

        DependencyGraph {
            nodes,
            upstream,
            downstream,
        }
    }
}

/// Adjacency over a set of services.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<ServiceId, GraphNode>,
    upstream: BTreeMap<ServiceId, Vec<(ServiceId, DependencyType)>>,
    downstream: BTreeMap<ServiceId, Vec<ServiceId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &ServiceId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// In-scope services `id` depends on, with the edge type.
    pub fn upstream_of(&self, id: &ServiceId) -> &[(ServiceId, DependencyType)] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// In-scope services that depend on `id`.
    pub fn downstream_of(&self, id: &ServiceId) -> &[ServiceId] {
        self.downstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn sorted_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<&GraphNode> = self.nodes.values().collect();
        ids.sort_by_key(|n| n.sort_key());
        ids.into_iter().map(|n| n.id).collect()
    }

    fn names(&self, path: &[ServiceId]) -> Vec<String> {
        path.iter()
            .map(|id| {
                self.nodes
                    .get(id)
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| id.to_string())
            })
            .collect()
    }

    /// Three-color depth-first search.
    ///
    /// Reaching a gray (on-stack) node closes a cycle; the returned path runs
    /// from that node along dependency edges back to itself.
    pub fn validate_acyclic(&self) -> Result<(), GraphError> {
        let mut color: HashMap<ServiceId, Color> =
            self.nodes.keys().map(|id| (*id, Color::White)).collect();

        for root in self.sorted_ids() {
            if color[&root] == Color::White {
                if let Some(path) = self.visit(root, &mut color) {
                    let names = self.names(&path);
                    return Err(GraphError::CycleDetected { path, names });
                }
            }
        }
        Ok(())
    }

    /// Iterative so long chains cannot exhaust the thread stack.
    fn visit(
        &self,
        root: ServiceId,
        color: &mut HashMap<ServiceId, Color>,
    ) -> Option<Vec<ServiceId>> {
        // (service, index of the next upstream edge to follow)
        let mut frames: Vec<(ServiceId, usize)> = vec![(root, 0)];
        color.insert(root, Color::Gray);

        while let Some((id, cursor)) = frames.last_mut() {
            let id = *id;
            let Some((next, _)) = self.upstream_of(&id).get(*cursor) else {
                color.insert(id, Color::Black);
                frames.pop();
                continue;
            };
            *cursor += 1;

            match color.get(next).copied().unwrap_or(Color::Black) {
                Color::Gray => {
                    let start = frames.iter().position(|(s, _)| s == next).unwrap_or(0);
                    let mut path: Vec<ServiceId> = frames[start..].iter().map(|(s, _)| *s).collect();
                    path.push(*next);
                    return Some(path);
                }
                Color::White => {
                    color.insert(*next, Color::Gray);
                    frames.push((*next, 0));
                }
                Color::Black => {}
            }
        }
        None
    }

    /// Kahn's algorithm; dependencies come before their dependents.
    pub fn topological_order(&self) -> Result<Vec<ServiceId>, GraphError> {
        self.validate_acyclic()?;

        let mut in_degree: HashMap<ServiceId, usize> = self
            .upstream
            .iter()
            .map(|(id, ups)| (*id, ups.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<(DateTime<Utc>, ServiceId)>> = self
            .nodes
            .values()
            .filter(|n| in_degree[&n.id] == 0)
            .map(|n| Reverse(n.sort_key()))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id);
            for dependent in self.downstream_of(&id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(node) = self.nodes.get(dependent) {
                            ready.push(Reverse(node.sort_key()));
                        }
                    }
                }
            }
        }

        Ok(order)
    }

    /// Rank layers: layer 0 has no in-scope dependencies, layer `n` depends
    /// only on layers below `n`. Each layer is sorted deterministically.
    pub fn layers(&self) -> Result<Vec<Vec<ServiceId>>, GraphError> {
        self.validate_acyclic()?;

        let mut in_degree: HashMap<ServiceId, usize> = self
            .upstream
            .iter()
            .map(|(id, ups)| (*id, ups.len()))
            .collect();

        let mut current: Vec<ServiceId> = self
            .sorted_ids()
            .into_iter()
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut layers = Vec::new();
        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.downstream_of(id) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }
            let mut next: Vec<ServiceId> = next.into_iter().collect();
            next.sort_by_key(|id| self.nodes.get(id).map(GraphNode::sort_key));
            layers.push(std::mem::replace(&mut current, next));
        }

        Ok(layers)
    }

    /// Layer index per service.
    pub fn ranks(&self) -> Result<HashMap<ServiceId, u32>, GraphError> {
        Ok(self
            .layers()?
            .into_iter()
            .enumerate()
            .flat_map(|(rank, layer)| layer.into_iter().map(move |id| (id, rank as u32)))
            .collect())
    }
}

/// Checks whether adding `service -> depends_on` to `edges` closes a cycle.
///
/// Returns the cycle (starting and ending at `service`) if it would.
pub fn would_create_cycle(
    edges: &[ServiceDependency],
    service: ServiceId,
    depends_on: ServiceId,
) -> Option<Vec<ServiceId>> {
    if service == depends_on {
        return Some(vec![service, service]);
    }

    let mut adjacency: HashMap<ServiceId, Vec<ServiceId>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.service_id)
            .or_default()
            .push(edge.depends_on);
    }

    // Search from the new upstream back to `service` along existing edges.
    let mut parent: HashMap<ServiceId, ServiceId> = HashMap::new();
    let mut stack = vec![depends_on];
    let mut seen = BTreeSet::from([depends_on]);
    while let Some(current) = stack.pop() {
        if current == service {
            let mut path = vec![service];
            let mut cursor = service;
            while let Some(prev) = parent.get(&cursor) {
                path.push(*prev);
                cursor = *prev;
            }
            // path is service <- ... <- depends_on; flip to follow edges.
            path.reverse();
            let mut cycle = vec![service];
            cycle.extend(path);
            return Some(cycle);
        }
        for next in adjacency.get(&current).into_iter().flatten() {
            if seen.insert(*next) {
                parent.insert(*next, current);
                stack.push(*next);
            }
        }
    }
    None
}
