//! Spanning-tree splitting of a linear factor graph.
//!
//! The graph `A·x = b` is split into a spanning-tree subgraph `A1·x = b1`,
//! which elimination solves exactly, and the loop-closing remainder
//! `A2·x = b2`. Unary factors always join the tree; multi-variable factors
//! join it when they connect variables not yet connected by the tree.
//!
//! # Tree selection
//!
//! - `Natural`: candidates in factor order
//! - `Bfs`: candidates in breadth-first order from the smallest key
//! - `Kruskal`: candidates by decreasing weight, so the strongest
//!   constraints are solved exactly

use crate::core::{GaussianFactorGraph, Key, Ordering};
use crate::error::{PcgError, PcgResult};
use petgraph::algo::connected_components;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{Bfs, DfsPostOrder};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Order in which candidate factors are offered to the spanning tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpanningTreeKind {
    /// Factor order of the input graph
    #[default]
    Natural,
    /// Breadth-first traversal of the variable graph
    Bfs,
    /// Maximum-weight spanning tree
    Kruskal,
}

/// Weight of a factor when building a `Kruskal` tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubgraphWeight {
    /// All factors weigh the same; ties keep factor order
    #[default]
    Equal,
    /// Frobenius norm of the factor's Jacobian blocks
    LhsFrobenius,
}

/// Configuration for spanning-tree selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubgraphBuilderConfig {
    pub tree: SpanningTreeKind,
    pub weight: SubgraphWeight,
}

impl SubgraphBuilderConfig {
    pub fn with_tree(mut self, tree: SpanningTreeKind) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_weight(mut self, weight: SubgraphWeight) -> Self {
        self.weight = weight;
        self
    }
}

/// Factor indices of the tree and loop subgraphs plus the tree ordering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subgraph {
    /// Factors of the spanning tree, in input order
    pub tree: Vec<usize>,
    /// Loop-closing factors, in input order
    pub loops: Vec<usize>,
    /// Leaves-to-root elimination ordering of the tree
    pub ordering: Ordering,
}

impl Subgraph {
    /// Materialize `(Ab1, Ab2)` from the full graph
    pub fn split(
        &self,
        graph: &GaussianFactorGraph,
    ) -> PcgResult<(GaussianFactorGraph, GaussianFactorGraph)> {
        Ok((graph.subset(&self.tree)?, graph.subset(&self.loops)?))
    }
}

impl fmt::Display for Subgraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Subgraph: {} tree factors, {} loop factors, {} variables",
            self.tree.len(),
            self.loops.len(),
            self.ordering.len()
        )
    }
}

/// Splits factor graphs into spanning tree and loop-closing subgraphs
#[derive(Debug, Clone, Default)]
pub struct SubgraphBuilder {
    config: SubgraphBuilderConfig,
}

impl SubgraphBuilder {
    pub fn new(config: SubgraphBuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SubgraphBuilderConfig {
        &self.config
    }

    /// Select a spanning tree of `graph`
    ///
    /// Fails with `DisconnectedGraph` when the variable graph has more than
    /// one connected component.
    pub fn build(&self, graph: &GaussianFactorGraph) -> PcgResult<Subgraph> {
        let keys: Vec<Key> = graph.keys().into_iter().collect();
        if keys.is_empty() {
            return Err(PcgError::InvalidInput(
                "Cannot build a spanning tree of an empty graph".into(),
            ));
        }
        let slot: BTreeMap<Key, usize> = keys.iter().enumerate().map(|(i, &k)| (k, i)).collect();

        let multi: Vec<usize> = (0..graph.len())
            .filter(|&i| graph.factors()[i].terms().len() > 1)
            .collect();
        let variables = variable_graph(graph, &keys, &slot, &multi);
        let components = connected_components(&variables);
        if components > 1 {
            return Err(PcgError::DisconnectedGraph { components });
        }

        let mut in_tree = vec![false; graph.len()];
        for (i, factor) in graph.factors().iter().enumerate() {
            if factor.terms().len() == 1 {
                in_tree[i] = true;
            }
        }

        let mut sets: UnionFind<usize> = UnionFind::new(keys.len());
        let mut tree_edges: Vec<usize> = Vec::new();
        for i in self.candidates(graph, &variables, multi) {
            let slots: Vec<usize> = graph.factors()[i].keys().map(|k| slot[&k]).collect();
            let mut roots: Vec<usize> = slots.iter().map(|&s| sets.find(s)).collect();
            roots.sort_unstable();
            roots.dedup();
            if roots.len() == slots.len() {
                for &s in &slots[1..] {
                    sets.union(slots[0], s);
                }
                in_tree[i] = true;
                tree_edges.push(i);
            }
        }

        let spanning_tree = variable_graph(graph, &keys, &slot, &tree_edges);
        let ordering = tree_ordering(&spanning_tree)?;
        let (tree, loops): (Vec<usize>, Vec<usize>) =
            (0..graph.len()).partition(|&i| in_tree[i]);

        debug!(
            "spanning tree: {} factors, {} loop closures over {} variables",
            tree.len(),
            loops.len(),
            keys.len()
        );

        Ok(Subgraph {
            tree,
            loops,
            ordering,
        })
    }

    /// Multi-variable factors in the order they are offered to the tree
    fn candidates(
        &self,
        graph: &GaussianFactorGraph,
        variables: &UnGraph<Key, usize>,
        multi: Vec<usize>,
    ) -> Vec<usize> {
        match self.config.tree {
            SpanningTreeKind::Natural => multi,
            SpanningTreeKind::Kruskal => {
                let weight = |i: usize| match self.config.weight {
                    SubgraphWeight::Equal => 1.0,
                    SubgraphWeight::LhsFrobenius => graph.factors()[i].frobenius_norm(),
                };
                let mut sorted = multi;
                sorted.sort_by(|&a, &b| weight(b).total_cmp(&weight(a)));
                sorted
            }
            SpanningTreeKind::Bfs => bfs_factor_order(variables, graph.len()),
        }
    }
}

/// Undirected variable graph with one node per key, in key order
///
/// Each factor in `factors` links its first variable to every other one and
/// labels those edges with its index.
fn variable_graph(
    graph: &GaussianFactorGraph,
    keys: &[Key],
    slot: &BTreeMap<Key, usize>,
    factors: &[usize],
) -> UnGraph<Key, usize> {
    let mut variables = UnGraph::with_capacity(keys.len(), factors.len());
    for &key in keys {
        variables.add_node(key);
    }
    for &i in factors {
        let slots: Vec<usize> = graph.factors()[i].keys().map(|k| slot[&k]).collect();
        for &s in &slots[1..] {
            variables.add_edge(NodeIndex::new(slots[0]), NodeIndex::new(s), i);
        }
    }
    variables
}

/// Factors in the order a breadth-first walk from the smallest key meets them
fn bfs_factor_order(variables: &UnGraph<Key, usize>, num_factors: usize) -> Vec<usize> {
    let mut order = Vec::new();
    let mut seen = vec![false; num_factors];
    let mut bfs = Bfs::new(variables, NodeIndex::new(0));
    while let Some(node) = bfs.next(variables) {
        let mut incident: Vec<usize> = variables.edges(node).map(|e| *e.weight()).collect();
        incident.sort_unstable();
        for i in incident {
            if !seen[i] {
                seen[i] = true;
                order.push(i);
            }
        }
    }
    order
}

/// Leaves-to-root ordering of the tree rooted at the smallest key
///
/// Depth-first post-order puts every variable after all of its descendants,
/// so eliminating a variable only leaves a factor on its parent.
fn tree_ordering(tree: &UnGraph<Key, usize>) -> PcgResult<Ordering> {
    let mut dfs = DfsPostOrder::new(tree, NodeIndex::new(0));
    let mut keys = Vec::with_capacity(tree.node_count());
    while let Some(node) = dfs.next(tree) {
        keys.push(tree[node]);
    }
    Ordering::new(keys)
}
