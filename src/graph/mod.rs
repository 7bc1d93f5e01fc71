//! Resource graph.
//!
//! This module turns resource declarations into a directed acyclic graph of
//! resource instances. Edges come from `${...}` references in attribute
//! values and from explicit `depends_on` entries.

mod address;
mod builder;
pub mod reference;
pub(crate) mod toposort;

pub use address::ResourceAddress;
pub use builder::GraphBuilder;
pub use reference::{Reference, Resolved};

use std::collections::{BTreeSet, HashMap};

use crate::config::{Attributes, LifecycleConfig};

/// One resource instance in the desired configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Instance address.
    pub address: ResourceAddress,
    /// Provider that manages this resource.
    pub provider: String,
    /// Desired attributes after `count` substitution; may hold references.
    pub attributes: Attributes,
    /// Instances this one depends on.
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Lifecycle options.
    pub lifecycle: LifecycleConfig,
}

impl ResourceNode {
    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        self.address.resource_type()
    }
}

/// An acyclic dependency graph of resource instances.
///
/// Nodes keep declaration order; `in_dependency_order` yields them so that
/// every node follows its dependencies, breaking ties by declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<ResourceAddress, usize>,
    order: Vec<usize>,
}

impl ResourceGraph {
    /// Creates an empty graph (used for destroy plans).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Looks up a node by address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceNode> {
        self.index.get(address).map(|i| &self.nodes[*i])
    }

    /// Returns true if the graph has a node at `address`.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Returns the declaration position of a node.
    #[must_use]
    pub fn position(&self, address: &ResourceAddress) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates nodes so that dependencies come first.
    pub fn in_dependency_order(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().map(|i| &self.nodes[*i])
    }

    /// Returns the nodes that depend directly on `address`.
    #[must_use]
    pub fn dependents(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.contains(address))
            .map(|n| &n.address)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use serde_json::json;

    #[test]
    fn test_dependents_and_lookup() {
        let graph = GraphBuilder::new()
            .build(&[
                ResourceConfig::new("null_resource", "a"),
                ResourceConfig::new("null_resource", "b").with_attribute("a", json!("${null_resource.a.id}")),
                ResourceConfig::new("null_resource", "c").with_depends_on("null_resource.a"),
            ])
            .unwrap();

        let a = ResourceAddress::new("null_resource", "a");
        let dependents: Vec<String> = graph.dependents(&a).iter().map(ToString::to_string).collect();
        assert_eq!(dependents, vec!["null_resource.b", "null_resource.c"]);
        assert_eq!(graph.position(&a), Some(0));
        assert!(graph.contains(&a));
        assert!(!ResourceGraph::empty().contains(&a));
    }

    #[test]
    fn test_dependency_order_respects_edges() {
        let graph = GraphBuilder::new()
            .build(&[
                ResourceConfig::new("null_resource", "lb").with_depends_on("null_resource.vm"),
                ResourceConfig::new("null_resource", "vm").with_count(2).with_depends_on("null_resource.net"),
                ResourceConfig::new("null_resource", "net"),
            ])
            .unwrap();

        let ordered: Vec<&ResourceAddress> = graph.in_dependency_order().map(|n| &n.address).collect();
        for node in graph.nodes() {
            let pos = ordered.iter().position(|a| **a == node.address).unwrap();
            for dep in &node.dependencies {
                let dep_pos = ordered.iter().position(|a| *a == dep).unwrap();
                assert!(dep_pos < pos, "{dep} must precede {}", node.address);
            }
        }
    }
}
