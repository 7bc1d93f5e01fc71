//! Resource graph builder.
//!
//! Expands `count`, discovers reference and `depends_on` edges, and rejects
//! configurations with unresolved references or dependency cycles.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::{Attributes, ResourceConfig};
use crate::error::ConfigError;

use super::address::ResourceAddress;
use super::reference::{expressions_in, substitute_count, Expression};
use super::toposort::stable_order;
use super::{ResourceGraph, ResourceNode};

/// Builds a [`ResourceGraph`] from resource declarations.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed addresses or references,
    /// duplicate declarations, unresolved references, or cycles.
    pub fn build(&self, resources: &[ResourceConfig]) -> Result<ResourceGraph, ConfigError> {
        let declared = Self::collect_declarations(resources)?;

        let mut nodes = Vec::new();
        for decl in resources {
            let base = ResourceAddress::parse(&decl.declared_address())?;
            let provider = decl
                .provider
                .clone()
                .unwrap_or_else(|| base.implied_provider().to_string());

            for (address, attributes) in Self::expand(decl, &base) {
                let dependencies = Self::dependencies_of(&address, &attributes, decl, &declared)?;

                nodes.push(ResourceNode {
                    address,
                    provider: provider.clone(),
                    attributes,
                    dependencies,
                    lifecycle: decl.lifecycle.clone(),
                });
            }
        }

        let graph = Self::assemble(nodes)?;
        debug!("Built resource graph with {} nodes", graph.len());
        Ok(graph)
    }

    /// Maps each declared `type.name` to its count.
    fn collect_declarations(
        resources: &[ResourceConfig],
    ) -> Result<HashMap<ResourceAddress, Option<u32>>, ConfigError> {
        let mut declared = HashMap::new();

        for decl in resources {
            let base = ResourceAddress::parse(&decl.declared_address())?;
            if declared.insert(base.clone(), decl.count).is_some() {
                return Err(ConfigError::DuplicateAddress {
                    address: base.to_string(),
                });
            }
        }

        Ok(declared)
    }

    /// Expands a declaration into its instances.
    fn expand(decl: &ResourceConfig, base: &ResourceAddress) -> Vec<(ResourceAddress, Attributes)> {
        match decl.count {
            None => vec![(base.clone(), decl.attributes.clone())],
            Some(count) => (0..count)
                .map(|i| {
                    let attributes = decl
                        .attributes
                        .iter()
                        .map(|(k, v)| (k.clone(), substitute_count(v, i)))
                        .collect();
                    (
                        ResourceAddress::indexed(base.resource_type(), base.name(), i),
                        attributes,
                    )
                })
                .collect(),
        }
    }

    /// Computes the outgoing edges of one instance.
    fn dependencies_of(
        address: &ResourceAddress,
        attributes: &Attributes,
        decl: &ResourceConfig,
        declared: &HashMap<ResourceAddress, Option<u32>>,
    ) -> Result<BTreeSet<ResourceAddress>, ConfigError> {
        let mut dependencies = BTreeSet::new();

        for (key, value) in attributes {
            let expressions = expressions_in(value).map_err(|message| {
                ConfigError::invalid_reference(address.to_string(), format!("attribute '{key}'"), message)
            })?;

            for expression in expressions {
                let reference = match expression {
                    Expression::Resource(reference) => reference,
                    Expression::CountIndex => {
                        return Err(ConfigError::invalid_reference(
                            address.to_string(),
                            "${count.index}",
                            "count.index used in a resource without count",
                        ));
                    }
                };

                let target = Self::resolve_target(address, &reference.target, &reference.expression(), declared)?;
                dependencies.insert(target);
            }
        }

        for text in &decl.depends_on {
            let target = ResourceAddress::parse(text)?;
            dependencies.extend(Self::resolve_depends_on(address, &target, declared)?);
        }

        if dependencies.contains(address) {
            return Err(ConfigError::Cycle {
                cycle: format!("{address} -> {address}"),
            });
        }

        Ok(dependencies)
    }

    /// Checks that a reference target names exactly one declared instance.
    fn resolve_target(
        from: &ResourceAddress,
        target: &ResourceAddress,
        expression: &str,
        declared: &HashMap<ResourceAddress, Option<u32>>,
    ) -> Result<ResourceAddress, ConfigError> {
        let Some(count) = declared.get(&target.base()) else {
            return Err(ConfigError::UnresolvedReference {
                from: from.to_string(),
                target: target.to_string(),
            });
        };

        match (count, target.index()) {
            (None, None) => Ok(target.clone()),
            (None, Some(_)) => Err(ConfigError::invalid_reference(
                from.to_string(),
                expression,
                format!("{} does not use count and cannot be indexed", target.base()),
            )),
            (Some(_), None) => Err(ConfigError::invalid_reference(
                from.to_string(),
                expression,
                format!("{target} uses count; reference a single instance like {target}[0]"),
            )),
            (Some(n), Some(i)) if i >= *n => Err(ConfigError::UnresolvedReference {
                from: from.to_string(),
                target: target.to_string(),
            }),
            (Some(_), Some(_)) => Ok(target.clone()),
        }
    }

    /// Resolves a `depends_on` entry; a counted target without index means every instance.
    fn resolve_depends_on(
        from: &ResourceAddress,
        target: &ResourceAddress,
        declared: &HashMap<ResourceAddress, Option<u32>>,
    ) -> Result<Vec<ResourceAddress>, ConfigError> {
        match (declared.get(&target.base()), target.index()) {
            (Some(Some(n)), None) => Ok((0..*n)
                .map(|i| ResourceAddress::indexed(target.resource_type(), target.name(), i))
                .collect()),
            _ => Self::resolve_target(from, target, &target.to_string(), declared).map(|t| vec![t]),
        }
    }

    /// Indexes the nodes and verifies the graph is acyclic.
    fn assemble(nodes: Vec<ResourceNode>) -> Result<ResourceGraph, ConfigError> {
        let index: HashMap<ResourceAddress, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.address.clone(), i))
            .collect();

        let prerequisites: Vec<Vec<usize>> = nodes
            .iter()
            .map(|n| n.dependencies.iter().filter_map(|d| index.get(d).copied()).collect())
            .collect();

        let order = stable_order(&prerequisites).map_err(|cycle| ConfigError::Cycle {
            cycle: cycle
                .iter()
                .map(|i| nodes[*i].address.to_string())
                .collect::<Vec<_>>()
                .join(" -> "),
        })?;

        Ok(ResourceGraph { nodes, index, order })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vnet() -> ResourceConfig {
        ResourceConfig::new("azurerm_virtual_network", "main")
            .with_attribute("address_space", json!(["10.0.0.0/16"]))
    }

    fn subnet() -> ResourceConfig {
        ResourceConfig::new("azurerm_subnet", "internal")
            .with_attribute("virtual_network_id", json!("${azurerm_virtual_network.main.id}"))
    }

    #[test]
    fn test_reference_creates_edge() {
        let graph = GraphBuilder::new().build(&[subnet(), vnet()]).unwrap();
        let subnet_addr = ResourceAddress::new("azurerm_subnet", "internal");
        let vnet_addr = ResourceAddress::new("azurerm_virtual_network", "main");

        let node = graph.get(&subnet_addr).unwrap();
        assert!(node.dependencies.contains(&vnet_addr));
        assert_eq!(node.provider, "azurerm");

        let ordered: Vec<String> = graph.in_dependency_order().map(|n| n.address.to_string()).collect();
        assert_eq!(ordered, vec!["azurerm_virtual_network.main", "azurerm_subnet.internal"]);
    }

    #[test]
    fn test_unresolved_reference() {
        let err = GraphBuilder::new().build(&[subnet()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let a = ResourceConfig::new("null_resource", "a").with_attribute("x", json!("${null_resource.b.id}"));
        let b = ResourceConfig::new("null_resource", "b").with_attribute("x", json!("${null_resource.c.id}"));
        let c = ResourceConfig::new("null_resource", "c").with_depends_on("null_resource.a");

        let err = GraphBuilder::new().build(&[a, b, c]).unwrap_err();
        let ConfigError::Cycle { cycle } = err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert!(cycle.contains("null_resource.a"));
        assert!(cycle.contains("null_resource.b"));
        assert!(cycle.contains("null_resource.c"));
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let a = ResourceConfig::new("null_resource", "a").with_attribute("x", json!("${null_resource.a.id}"));
        let err = GraphBuilder::new().build(&[a]).unwrap_err();
        assert!(matches!(err, ConfigError::Cycle { .. }));
    }

    #[test]
    fn test_duplicate_address() {
        let err = GraphBuilder::new().build(&[vnet(), vnet()]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAddress { .. }));
    }

    #[test]
    fn test_count_expansion_and_indexed_references() {
        let nic = ResourceConfig::new("azurerm_network_interface", "nic")
            .with_count(2)
            .with_attribute("name", json!("nic-${count.index}"));
        let vm = ResourceConfig::new("azurerm_virtual_machine", "web")
            .with_count(2)
            .with_attribute("nic_id", json!("${azurerm_network_interface.nic[1].id}"))
            .with_attribute("slot", json!("${count.index}"));
        let lb = ResourceConfig::new("azurerm_lb", "front").with_depends_on("azurerm_virtual_machine.web");

        let graph = GraphBuilder::new().build(&[nic, vm, lb]).unwrap();
        assert_eq!(graph.len(), 5);

        let vm1 = graph
            .get(&ResourceAddress::indexed("azurerm_virtual_machine", "web", 1))
            .unwrap();
        assert_eq!(vm1.attributes["slot"], json!(1));
        assert!(vm1
            .dependencies
            .contains(&ResourceAddress::indexed("azurerm_network_interface", "nic", 1)));

        let nic0 = graph
            .get(&ResourceAddress::indexed("azurerm_network_interface", "nic", 0))
            .unwrap();
        assert_eq!(nic0.attributes["name"], json!("nic-0"));

        let lb = graph.get(&ResourceAddress::new("azurerm_lb", "front")).unwrap();
        assert_eq!(lb.dependencies.len(), 2);
    }

    #[test]
    fn test_count_index_as_reference_index() {
        let nic = ResourceConfig::new("azurerm_network_interface", "web").with_count(2);
        let vm = ResourceConfig::new("azurerm_linux_virtual_machine", "web")
            .with_count(2)
            .with_attribute("nic", json!("${azurerm_network_interface.web[${count.index}].id}"));

        let graph = GraphBuilder::new().build(&[nic, vm]).unwrap();

        for i in 0..2 {
            let vm = graph
                .get(&ResourceAddress::indexed("azurerm_linux_virtual_machine", "web", i))
                .unwrap();
            let expected = ResourceAddress::indexed("azurerm_network_interface", "web", i);
            assert_eq!(vm.dependencies, BTreeSet::from([expected.clone()]));
            assert_eq!(vm.attributes["nic"], json!(format!("${{{expected}.id}}")));
        }
    }

    #[test]
    fn test_count_index_as_reference_index_without_count() {
        let nic = ResourceConfig::new("azurerm_network_interface", "web").with_count(2);
        let vm = ResourceConfig::new("azurerm_linux_virtual_machine", "web")
            .with_attribute("nic", json!("${azurerm_network_interface.web[${count.index}].id}"));

        let err = GraphBuilder::new().build(&[nic, vm]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference { .. }));
    }

    #[test]
    fn test_counted_reference_requires_index() {
        let nic = ResourceConfig::new("azurerm_network_interface", "nic").with_count(2);
        let vm = ResourceConfig::new("azurerm_virtual_machine", "web")
            .with_attribute("nic_id", json!("${azurerm_network_interface.nic.id}"));

        let err = GraphBuilder::new().build(&[nic, vm]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference { .. }));
    }

    #[test]
    fn test_index_out_of_range() {
        let nic = ResourceConfig::new("azurerm_network_interface", "nic").with_count(1);
        let vm = ResourceConfig::new("azurerm_virtual_machine", "web")
            .with_attribute("nic_id", json!("${azurerm_network_interface.nic[3].id}"));

        let err = GraphBuilder::new().build(&[nic, vm]).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_count_index_without_count() {
        let a = ResourceConfig::new("null_resource", "a").with_attribute("i", json!("${count.index}"));
        let err = GraphBuilder::new().build(&[a]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference { .. }));
    }

    #[test]
    fn test_explicit_provider() {
        let a = ResourceConfig::new("azurerm_lb", "front").with_provider("null");
        let graph = GraphBuilder::new().build(&[a]).unwrap();
        assert_eq!(graph.nodes()[0].provider, "null");
    }
}
