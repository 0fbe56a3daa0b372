//! Dependency Graph
//!
//! The graph records typed edges between property ids, the owner relation,
//! and for every property the set of asynchronous properties it must wait on.
//! It does no scheduling of its own: the engine asks it who depends on whom
//! and then talks to the properties itself.
//!
//! # Async closure
//!
//! When a value edge `from -> to` is inserted:
//!
//! 1. If `from` is asynchronous, `to` must wait for `from`.
//! 2. Otherwise `to` inherits whatever `from` already waits on.
//!
//! An asynchronous property therefore shields its dependents from its own
//! predecessors: it resolves them itself before it recomputes. A synchronous
//! property passes everything through.
//!
//! All maps are insertion-ordered so traversals are deterministic for a fixed
//! build order.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use super::edge::{Dependency, DependencyOptions, NodeKind, PropertyId};
use crate::error::ConfigError;

/// Directed multigraph over property ids.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Vertex metadata.
    nodes: IndexMap<PropertyId, NodeKind>,

    /// Outgoing edges, keyed by `from` then `to`.
    edges: IndexMap<PropertyId, IndexMap<PropertyId, Dependency>>,

    /// Reverse index (`to` -> every `from`), used for removal.
    incoming: IndexMap<PropertyId, IndexSet<PropertyId>>,

    /// Asynchronous properties each property must wait on.
    async_dependencies: IndexMap<PropertyId, IndexSet<PropertyId>>,

    /// Owner -> owned.
    owners: IndexMap<PropertyId, SmallVec<[PropertyId; 4]>>,

    /// Reject value edges into properties that already have dependents.
    strict_build_order: bool,
}

impl DependencyGraph {
    /// Create a new empty graph with strict build order.
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            edges: IndexMap::new(),
            incoming: IndexMap::new(),
            async_dependencies: IndexMap::new(),
            owners: IndexMap::new(),
            strict_build_order: true,
        }
    }

    /// Enable or disable the bottom-up build check.
    pub fn with_strict_build_order(mut self, strict: bool) -> Self {
        self.strict_build_order = strict;
        self
    }

    /// Record what kind of vertex `id` is.
    pub fn register_node(&mut self, id: PropertyId, kind: NodeKind) {
        self.nodes.insert(id, kind);
    }

    /// Whether `id` was registered.
    pub fn contains(&self, id: &PropertyId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get the number of registered vertices.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(IndexMap::len).sum()
    }

    fn kind(&self, id: &PropertyId) -> NodeKind {
        self.nodes.get(id).copied().unwrap_or_default()
    }

    fn has_outgoing(&self, id: &PropertyId) -> bool {
        self.edges.get(id).is_some_and(|out| !out.is_empty())
    }

    /// Add (or merge into) the edge `from -> to`.
    pub fn add_dependency(
        &mut self,
        from: &PropertyId,
        to: &PropertyId,
        options: DependencyOptions,
    ) -> Result<(), ConfigError> {
        if options.is_empty() {
            return Ok(());
        }

        // attribute edges (triggers, validation, visibility) may be added late
        if options.value
            && self.strict_build_order
            && !self.kind(to).container
            && self.has_outgoing(to)
        {
            return Err(ConfigError::NotBottomUp {
                from: from.clone(),
                to: to.clone(),
            });
        }

        let adds_value = options.value;
        let out = self.edges.entry(from.clone()).or_default();
        match out.get_mut(to) {
            Some(existing) => existing.options.merge(&options),
            None => {
                out.insert(
                    to.clone(),
                    Dependency {
                        from: from.clone(),
                        to: to.clone(),
                        options,
                    },
                );
            }
        }
        self.incoming
            .entry(to.clone())
            .or_default()
            .insert(from.clone());

        if adds_value {
            let inherited: Vec<PropertyId> = if self.kind(from).asynchronous {
                vec![from.clone()]
            } else {
                self.async_dependencies
                    .get(from)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default()
            };
            if !inherited.is_empty() {
                self.inherit_async_dependencies(to, inherited);
            }
        }

        Ok(())
    }

    /// Fan-in: add `from -> to` for every `from`.
    pub fn add_dependencies<'a, I>(
        &mut self,
        froms: I,
        to: &PropertyId,
        options: &DependencyOptions,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a PropertyId>,
    {
        for from in froms {
            self.add_dependency(from, to, options.clone())?;
        }
        Ok(())
    }

    /// Record that `owner` contains `owned`, optionally with a value edge
    /// `owned -> owner`.
    pub fn add_owner_dependency(
        &mut self,
        owner: &PropertyId,
        owned: &PropertyId,
        with_value_dependency: bool,
    ) -> Result<(), ConfigError> {
        if with_value_dependency {
            self.add_dependency(owned, owner, DependencyOptions::value())?;
        }
        let entries = self.owners.entry(owner.clone()).or_default();
        if !entries.contains(owned) {
            entries.push(owned.clone());
        }
        Ok(())
    }

    /// Clear the flags in `options` on the edge `from -> to`, dropping the
    /// edge once nothing is left. Returns whether an edge was touched.
    ///
    /// Async closures are not shrunk.
    pub fn remove_dependency_options(
        &mut self,
        from: &PropertyId,
        to: &PropertyId,
        options: &DependencyOptions,
    ) -> bool {
        let Some(out) = self.edges.get_mut(from) else {
            return false;
        };
        let Some(edge) = out.get_mut(to) else {
            return false;
        };
        edge.options.remove(options);
        if edge.options.is_empty() {
            out.shift_remove(to);
            if let Some(sources) = self.incoming.get_mut(to) {
                sources.shift_remove(from);
            }
        }
        true
    }

    /// Remove `id` together with everything it owns, transitively.
    ///
    /// Returns the removed ids, owner first.
    pub fn remove_property(&mut self, id: &PropertyId) -> Vec<PropertyId> {
        let mut removed = Vec::new();
        let mut stack = vec![id.clone()];

        while let Some(current) = stack.pop() {
            if removed.contains(&current) {
                continue;
            }
            if let Some(owned) = self.owners.shift_remove(&current) {
                stack.extend(owned.into_iter().rev());
            }
            for entries in self.owners.values_mut() {
                entries.retain(|owned| *owned != current);
            }

            if let Some(out) = self.edges.shift_remove(&current) {
                for to in out.keys() {
                    if let Some(sources) = self.incoming.get_mut(to) {
                        sources.shift_remove(&current);
                    }
                }
            }
            if let Some(sources) = self.incoming.shift_remove(&current) {
                for from in &sources {
                    if let Some(out) = self.edges.get_mut(from) {
                        out.shift_remove(&current);
                    }
                }
            }

            self.async_dependencies.shift_remove(&current);
            for closure in self.async_dependencies.values_mut() {
                closure.shift_remove(&current);
            }
            self.nodes.shift_remove(&current);
            removed.push(current);
        }

        removed
    }

    /// Extend `to`'s async closure. Newly added entries flow further down
    /// through synchronous value dependents, which matters when a container
    /// gains an asynchronous element after its dependents were declared.
    fn inherit_async_dependencies(&mut self, to: &PropertyId, inherited: Vec<PropertyId>) {
        let mut queue = vec![(to.clone(), inherited)];

        while let Some((node, candidates)) = queue.pop() {
            let added: Vec<PropertyId> = {
                let closure = self.async_dependencies.entry(node.clone()).or_default();
                candidates
                    .into_iter()
                    .filter(|candidate| *candidate != node && closure.insert(candidate.clone()))
                    .collect()
            };
            if added.is_empty() || self.kind(&node).asynchronous {
                continue;
            }
            if let Some(out) = self.edges.get(&node) {
                for edge in out.values().filter(|edge| edge.options.value) {
                    queue.push((edge.to.clone(), added.clone()));
                }
            }
        }
    }

    /// Get the asynchronous properties `id` must wait on, if any.
    pub fn async_dependencies(&self, id: &PropertyId) -> Option<&IndexSet<PropertyId>> {
        self.async_dependencies
            .get(id)
            .filter(|closure| !closure.is_empty())
    }

    /// Get the outgoing edges of `id`, in insertion order.
    pub fn dependencies_of(&self, id: &PropertyId) -> impl Iterator<Item = &Dependency> {
        self.edges.get(id).into_iter().flat_map(IndexMap::values)
    }

    /// Get the edge `from -> to`, if any.
    pub fn dependency(&self, from: &PropertyId, to: &PropertyId) -> Option<&Dependency> {
        self.edges.get(from).and_then(|out| out.get(to))
    }

    /// Get the ids owned by `owner`.
    pub fn owned_by(&self, owner: &PropertyId) -> &[PropertyId] {
        self.owners
            .get(owner)
            .map(|entries| entries.as_slice())
            .unwrap_or_default()
    }

    /// Depth-first walk of the outgoing edges reachable from `start`.
    ///
    /// `apply` is called for each followed edge before descending into its
    /// target. `filter` restricts which edges are followed. With
    /// `prevent_cycles`, every reachable vertex is applied exactly once even
    /// when several paths reach it; without it a vertex is applied once per
    /// path, but never re-entered while it is already on the current path.
    pub fn traverse_depth_first<F>(
        &self,
        start: &PropertyId,
        mut apply: F,
        filter: Option<&dyn Fn(&Dependency) -> bool>,
        prevent_cycles: bool,
    ) where
        F: FnMut(&Dependency),
    {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        visited.insert(start);
        path.push(start);
        self.visit(
            start,
            &mut apply,
            filter,
            prevent_cycles,
            &mut visited,
            &mut path,
        );
    }

    fn visit<'a>(
        &'a self,
        at: &'a PropertyId,
        apply: &mut dyn FnMut(&Dependency),
        filter: Option<&dyn Fn(&Dependency) -> bool>,
        prevent_cycles: bool,
        visited: &mut HashSet<&'a PropertyId>,
        path: &mut Vec<&'a PropertyId>,
    ) {
        let Some(out) = self.edges.get(at) else {
            return;
        };
        for edge in out.values() {
            if filter.is_some_and(|accept| !accept(edge)) {
                continue;
            }
            if prevent_cycles {
                if !visited.insert(&edge.to) {
                    continue;
                }
            } else if path.contains(&&edge.to) {
                continue;
            }

            apply(edge);

            path.push(&edge.to);
            self.visit(&edge.to, apply, filter, prevent_cycles, visited, path);
            path.pop();
        }
    }

    /// Find the first dependency cycle, if there is one.
    ///
    /// Returns the ids along the cycle with the repeated id appended, e.g.
    /// `[a, b, c, a]`.
    pub fn find_cyclic_dependencies(&self) -> Option<Vec<PropertyId>> {
        let mut done = HashSet::new();
        for start in self.edges.keys() {
            if done.contains(start) {
                continue;
            }
            let mut path = IndexSet::new();
            if let Some(cycle) = self.find_cycle_from(start, &mut path, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_from<'a>(
        &'a self,
        node: &'a PropertyId,
        path: &mut IndexSet<&'a PropertyId>,
        done: &mut HashSet<&'a PropertyId>,
    ) -> Option<Vec<PropertyId>> {
        if let Some(position) = path.get_index_of(node) {
            let mut cycle: Vec<PropertyId> = path
                .iter()
                .skip(position)
                .map(|id| (*id).clone())
                .collect();
            cycle.push(node.clone());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }

        path.insert(node);
        if let Some(out) = self.edges.get(node) {
            for to in out.keys() {
                if let Some(cycle) = self.find_cycle_from(to, path, done) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        done.insert(node);
        None
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> PropertyId {
        PropertyId::from(raw)
    }

    fn collect(graph: &DependencyGraph, start: &str, prevent_cycles: bool) -> Vec<String> {
        let mut seen = Vec::new();
        graph.traverse_depth_first(
            &id(start),
            |edge| seen.push(edge.to.to_string()),
            None,
            prevent_cycles,
        );
        seen
    }

    #[test]
    fn repeated_edges_are_merged() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::visible())
            .unwrap();

        assert_eq!(graph.edge_count(), 1);
        let edge = graph.dependency(&id("a"), &id("b")).unwrap();
        assert!(edge.options.value);
        assert!(edge.options.visible);
    }

    #[test]
    fn value_edge_into_property_with_dependents_is_rejected() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(&id("b"), &id("c"), DependencyOptions::value())
            .unwrap();

        let err = graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::NotBottomUp {
                from: id("a"),
                to: id("b")
            }
        );

        // attribute edges and containers are exempt
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::validation())
            .unwrap();
        graph.register_node(id("list"), NodeKind::container());
        graph
            .add_dependency(&id("list"), &id("c"), DependencyOptions::value())
            .unwrap();
        graph
            .add_owner_dependency(&id("list"), &id("item"), true)
            .unwrap();
    }

    #[test]
    fn lenient_graph_accepts_any_order() {
        let mut graph = DependencyGraph::new().with_strict_build_order(false);
        graph
            .add_dependency(&id("b"), &id("c"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap();
        assert_eq!(collect(&graph, "a", true), vec!["b", "c"]);
    }

    #[test]
    fn async_closure_flows_through_sync_properties() {
        let mut graph = DependencyGraph::new();
        graph.register_node(id("a"), NodeKind::asynchronous());
        graph.register_node(id("b"), NodeKind::synchronous());
        graph.register_node(id("c"), NodeKind::asynchronous());
        graph.register_node(id("d"), NodeKind::synchronous());

        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("b"), &id("c"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("c"), &id("d"), DependencyOptions::value())
            .unwrap();

        let closure = |raw: &str| -> Vec<String> {
            graph
                .async_dependencies(&id(raw))
                .map(|set| set.iter().map(ToString::to_string).collect())
                .unwrap_or_default()
        };
        assert!(closure("a").is_empty());
        assert_eq!(closure("b"), vec!["a"]);
        assert_eq!(closure("c"), vec!["a"]);
        // c is asynchronous and resolves `a` itself
        assert_eq!(closure("d"), vec!["c"]);
    }

    #[test]
    fn non_value_edges_do_not_extend_the_closure() {
        let mut graph = DependencyGraph::new();
        graph.register_node(id("a"), NodeKind::asynchronous());
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::visible())
            .unwrap();
        assert!(graph.async_dependencies(&id("b")).is_none());
    }

    #[test]
    fn async_element_added_late_reaches_existing_dependents() {
        let mut graph = DependencyGraph::new();
        graph.register_node(id("list"), NodeKind::container());
        graph
            .add_dependency(&id("list"), &id("total"), DependencyOptions::value())
            .unwrap();

        graph.register_node(id("list[0]"), NodeKind::asynchronous());
        graph
            .add_owner_dependency(&id("list"), &id("list[0]"), true)
            .unwrap();

        let total: Vec<_> = graph
            .async_dependencies(&id("total"))
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(total, vec![id("list[0]")]);
    }

    #[test]
    fn diamond_is_visited_once_with_cycle_prevention() {
        // a -> b -> d, a -> c -> d
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("a"), &id("c"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("b"), &id("d"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("c"), &id("d"), DependencyOptions::value())
            .unwrap();

        assert_eq!(collect(&graph, "a", true), vec!["b", "d", "c"]);
        assert_eq!(collect(&graph, "a", false), vec!["b", "d", "c", "d"]);
    }

    #[test]
    fn filter_selects_edge_kinds() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("a"), &id("c"), DependencyOptions::validation())
            .unwrap();

        let mut values = Vec::new();
        let only_values: &dyn Fn(&Dependency) -> bool = &|edge| edge.options.value;
        graph.traverse_depth_first(
            &id("a"),
            |edge| values.push(edge.to.clone()),
            Some(only_values),
            true,
        );
        assert_eq!(values, vec![id("b")]);
    }

    #[test]
    fn traversal_terminates_on_cycles() {
        let mut graph = DependencyGraph::new().with_strict_build_order(false);
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("b"), &id("a"), DependencyOptions::value())
            .unwrap();

        assert_eq!(collect(&graph, "a", true), vec!["b"]);
        assert_eq!(collect(&graph, "a", false), vec!["b"]);
    }

    #[test]
    fn finds_cycle_path() {
        let mut graph = DependencyGraph::new().with_strict_build_order(false);
        graph
            .add_dependency(&id("x"), &id("a"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("a"), &id("b"), DependencyOptions::value())
            .unwrap();
        graph
            .add_dependency(&id("b"), &id("c"), DependencyOptions::validation())
            .unwrap();
        assert_eq!(graph.find_cyclic_dependencies(), None);

        graph
            .add_dependency(&id("c"), &id("a"), DependencyOptions::value())
            .unwrap();
        assert_eq!(
            graph.find_cyclic_dependencies(),
            Some(vec![id("a"), id("b"), id("c"), id("a")])
        );
    }

    #[test]
    fn removing_an_owner_cascades() {
        let mut graph = DependencyGraph::new();
        graph.register_node(id("list"), NodeKind::container());
        graph.register_node(id("row"), NodeKind::synchronous());
        graph.register_node(id("row.cell"), NodeKind::asynchronous());
        graph
            .add_owner_dependency(&id("row"), &id("row.cell"), true)
            .unwrap();
        graph
            .add_owner_dependency(&id("list"), &id("row"), true)
            .unwrap();
        graph
            .add_dependency(&id("list"), &id("count"), DependencyOptions::value())
            .unwrap();
        assert!(graph.async_dependencies(&id("count")).is_some());

        let removed = graph.remove_property(&id("row"));

        assert_eq!(removed, vec![id("row"), id("row.cell")]);
        assert!(!graph.contains(&id("row.cell")));
        assert!(graph.owned_by(&id("list")).is_empty());
        assert!(graph.dependency(&id("row"), &id("list")).is_none());
        assert!(graph.async_dependencies(&id("count")).is_none());
        assert_eq!(collect(&graph, "list", true), vec!["count"]);
    }

    #[test]
    fn removing_trigger_flag_drops_edge() {
        let mut graph = DependencyGraph::new();
        let trigger = DependencyOptions::custom("update_trigger");
        graph
            .add_dependency(&id("button"), &id("total"), trigger.clone())
            .unwrap();
        assert!(graph.remove_dependency_options(&id("button"), &id("total"), &trigger));
        assert_eq!(graph.edge_count(), 0);
        assert!(!graph.remove_dependency_options(&id("button"), &id("total"), &trigger));
    }
}
