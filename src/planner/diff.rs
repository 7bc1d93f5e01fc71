//! Diff engine for comparing desired configuration against stored state.
//!
//! Nodes are diffed in dependency order so that a reference can be classified
//! by what is planned for its target: values of resources being created or
//! replaced are only known after apply, values of resources left unchanged
//! come from their stored record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::config::Attributes;
use crate::error::{ConfigError, PlanError, ProvisioError, Result};
use crate::graph::reference::{lookup_path, resolve};
use crate::graph::{Reference, ResourceAddress, ResourceGraph, ResourceNode, Resolved};
use crate::provider::{ProviderRegistry, ResourceSchema};
use crate::state::{StateRecord, StateSnapshot};

/// Engine for computing change sets.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    registry: &'a ProviderRegistry,
}

/// What happens to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be changed (in place, or replaced when `replace` is set).
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoOp,
}

/// Identity of the stored record a change was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorState {
    /// Provider identifier.
    pub id: String,
    /// Record serial at plan time.
    pub serial: u64,
}

/// A single attribute difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub field: String,
    /// Stored value.
    pub old_value: Option<Value>,
    /// Desired value; `None` when removed or unknown.
    pub new_value: Option<Value>,
    /// The desired value is only known after apply.
    #[serde(default)]
    pub unknown: bool,
    /// Changing this attribute requires replacement.
    #[serde(default)]
    pub forces_replace: bool,
}

/// The computed change for one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource type.
    pub resource_type: String,
    /// Provider name.
    pub provider: String,
    /// Action.
    pub action: ChangeAction,
    /// The update requires delete-then-create.
    #[serde(default)]
    pub replace: bool,
    /// Stored attributes.
    pub before: Option<Attributes>,
    /// Desired attributes whose values are known at plan time.
    pub after: Option<Attributes>,
    /// Desired attributes only known after apply.
    #[serde(default)]
    pub unknown: BTreeSet<String>,
    /// Per-attribute differences (empty for NoOp).
    #[serde(default)]
    pub attribute_changes: Vec<AttributeChange>,
    /// Raw desired attributes, resolved again at apply time.
    #[serde(default)]
    pub config: Attributes,
    /// Configured dependencies.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Dependencies recorded by the last apply.
    #[serde(default)]
    pub recorded_dependencies: BTreeSet<ResourceAddress>,
    /// Attributes whose changes are ignored.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    /// Stored record the change was computed against.
    pub prior: Option<PriorState>,
}

/// All changes of one diff, in dependency order followed by orphans.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Changes.
    pub changes: Vec<Change>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine that looks up schemas in `registry`.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes the changes that bring `snapshot` to the desired `graph`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown providers, unsupported types
    /// or unresolved references, and a plan error if a protected resource
    /// would be replaced or destroyed.
    pub fn compute_diff(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<ChangeSet> {
        let mut changes: Vec<Change> = Vec::with_capacity(graph.len());
        let mut planned: HashMap<ResourceAddress, usize> = HashMap::new();

        for node in graph.in_dependency_order() {
            let (_, schema) = self.registry.resolve(&node.provider, &node.address)?;
            let prior = snapshot.records.get(&node.address);

            let change = Self::diff_node(node, prior, &schema, &changes, &planned, snapshot)?;

            if change.replace && node.lifecycle.prevent_destroy {
                return Err(ProvisioError::Plan(PlanError::PreventDestroy {
                    address: node.address.to_string(),
                    action: String::from("replace"),
                }));
            }

            debug!(
                "{}: {}{}",
                change.address,
                change.action,
                if change.replace { " (replace)" } else { "" }
            );
            planned.insert(change.address.clone(), changes.len());
            changes.push(change);
        }

        for (address, record) in &snapshot.records {
            if !graph.contains(address) {
                debug!("Found orphaned resource: {address}");
                changes.push(Self::delete_change(record));
            }
        }

        Ok(ChangeSet::from_changes(changes))
    }

    /// Computes a change set that deletes every stored resource.
    ///
    /// # Errors
    ///
    /// Returns a plan error if a resource still configured with
    /// `prevent_destroy` would be destroyed.
    pub fn compute_destroy(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<ChangeSet> {
        let mut changes = Vec::with_capacity(snapshot.len());

        for (address, record) in &snapshot.records {
            if graph.get(address).is_some_and(|n| n.lifecycle.prevent_destroy) {
                return Err(ProvisioError::Plan(PlanError::PreventDestroy {
                    address: address.to_string(),
                    action: String::from("destroy"),
                }));
            }
            changes.push(Self::delete_change(record));
        }

        Ok(ChangeSet::from_changes(changes))
    }

    fn delete_change(record: &StateRecord) -> Change {
        Change {
            address: record.address.clone(),
            resource_type: record.resource_type.clone(),
            provider: record.provider.clone(),
            action: ChangeAction::Delete,
            replace: false,
            before: Some(record.attributes.clone()),
            after: None,
            unknown: BTreeSet::new(),
            attribute_changes: Vec::new(),
            config: Attributes::new(),
            dependencies: BTreeSet::new(),
            recorded_dependencies: record.dependencies.clone(),
            ignore_changes: Vec::new(),
            prior: Some(PriorState {
                id: record.id.clone(),
                serial: record.serial,
            }),
        }
    }

    fn diff_node(
        node: &ResourceNode,
        prior: Option<&StateRecord>,
        schema: &ResourceSchema,
        changes: &[Change],
        planned: &HashMap<ResourceAddress, usize>,
        snapshot: &StateSnapshot,
    ) -> Result<Change> {
        let (mut after, mut unknown) = Self::resolve_desired(node, changes, planned, snapshot)?;

        let mut change = Change {
            address: node.address.clone(),
            resource_type: node.resource_type().to_string(),
            provider: node.provider.clone(),
            action: ChangeAction::Create,
            replace: false,
            before: None,
            after: None,
            unknown: BTreeSet::new(),
            attribute_changes: Vec::new(),
            config: node.attributes.clone(),
            dependencies: node.dependencies.clone(),
            recorded_dependencies: BTreeSet::new(),
            ignore_changes: node.lifecycle.ignore_changes.clone(),
            prior: None,
        };

        let Some(prior) = prior else {
            change.attribute_changes = after
                .iter()
                .map(|(k, v)| AttributeChange {
                    field: k.clone(),
                    old_value: None,
                    new_value: Some(v.clone()),
                    unknown: false,
                    forces_replace: false,
                })
                .chain(unknown.iter().map(|k| AttributeChange {
                    field: k.clone(),
                    old_value: None,
                    new_value: None,
                    unknown: true,
                    forces_replace: false,
                }))
                .collect();
            change.attribute_changes.sort_by(|a, b| a.field.cmp(&b.field));
            change.after = Some(after);
            change.unknown = unknown;
            return Ok(change);
        };

        for key in &node.lifecycle.ignore_changes {
            unknown.remove(key);
            match prior.attributes.get(key) {
                Some(stored) => {
                    after.insert(key.clone(), stored.clone());
                }
                None => {
                    after.remove(key);
                }
            }
        }

        let keys: BTreeSet<&String> = after
            .keys()
            .chain(unknown.iter())
            .chain(prior.attributes.keys())
            .collect();

        for key in keys {
            let old_value = prior.attributes.get(key);
            let is_unknown = unknown.contains(key);
            let new_value = after.get(key);

            if !is_unknown && old_value == new_value {
                continue;
            }

            let forces_replace = schema.requires_replace(key);
            change.replace |= forces_replace;
            change.attribute_changes.push(AttributeChange {
                field: key.clone(),
                old_value: old_value.cloned(),
                new_value: new_value.cloned(),
                unknown: is_unknown,
                forces_replace,
            });
        }

        change.action = if change.attribute_changes.is_empty() {
            ChangeAction::NoOp
        } else {
            ChangeAction::Update
        };
        change.before = Some(prior.attributes.clone());
        change.after = Some(after);
        change.unknown = unknown;
        change.recorded_dependencies = prior.dependencies.clone();
        change.prior = Some(PriorState {
            id: prior.id.clone(),
            serial: prior.serial,
        });

        Ok(change)
    }

    /// Resolves the desired attributes of `node` at plan time.
    fn resolve_desired(
        node: &ResourceNode,
        changes: &[Change],
        planned: &HashMap<ResourceAddress, usize>,
        snapshot: &StateSnapshot,
    ) -> Result<(Attributes, BTreeSet<String>)> {
        let from = &node.address;
        let mut lookup = |reference: &Reference| -> std::result::Result<Resolved, ConfigError> {
            let unresolved = || ConfigError::UnresolvedReference {
                from: from.to_string(),
                target: reference.to_string(),
            };

            let dependency = planned
                .get(&reference.target)
                .map(|i| &changes[*i])
                .ok_or_else(unresolved)?;

            match (dependency.action, dependency.replace) {
                (ChangeAction::Create, _) | (ChangeAction::Update, true) => Ok(Resolved::Unknown),
                (ChangeAction::Update, false) => Ok(Self::known_after_update(dependency, snapshot, &reference.path)),
                (ChangeAction::NoOp, _) => snapshot
                    .records
                    .get(&reference.target)
                    .and_then(|r| r.value_of(&reference.path))
                    .map(Resolved::Known)
                    .ok_or_else(unresolved),
                (ChangeAction::Delete, _) => Err(unresolved()),
            }
        };

        let mut after = Attributes::new();
        let mut unknown = BTreeSet::new();

        for (key, value) in &node.attributes {
            match resolve(value, from, &mut lookup)? {
                Resolved::Known(v) => {
                    after.insert(key.clone(), v);
                }
                Resolved::Unknown => {
                    unknown.insert(key.clone());
                }
            }
        }

        Ok((after, unknown))
    }

    /// Values that survive an in-place update: the identifier and any desired
    /// attribute that is already known. Outputs may change and are unknown.
    fn known_after_update(dependency: &Change, snapshot: &StateSnapshot, path: &[String]) -> Resolved {
        let Some((first, rest)) = path.split_first() else {
            return Resolved::Unknown;
        };

        if first == "id" && rest.is_empty() {
            if let Some(record) = snapshot.records.get(&dependency.address) {
                return Resolved::Known(Value::String(record.id.clone()));
            }
        }

        dependency
            .after
            .as_ref()
            .filter(|_| !dependency.unknown.contains(first))
            .and_then(|after| after.get(first))
            .and_then(|v| lookup_path(v, rest))
            .map_or(Resolved::Unknown, |v| Resolved::Known(v.clone()))
    }
}

impl ChangeSet {
    /// Builds a change set and its counters.
    #[must_use]
    pub fn from_changes(changes: Vec<Change>) -> Self {
        let mut set = Self {
            changes,
            ..Self::default()
        };

        for change in &set.changes {
            match (change.action, change.replace) {
                (ChangeAction::Create, _) => set.creates += 1,
                (ChangeAction::Update, false) => set.updates += 1,
                (ChangeAction::Update, true) => set.replaces += 1,
                (ChangeAction::Delete, _) => set.deletes += 1,
                (ChangeAction::NoOp, _) => set.unchanged += 1,
            }
        }

        set
    }

    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.action == ChangeAction::NoOp)
    }

    /// Looks up the change for an address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&Change> {
        self.changes.iter().find(|c| &c.address == address)
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("null"), ToString::to_string);

        let new = if self.unknown {
            String::from("(known after apply)")
        } else {
            render(&self.new_value)
        };

        write!(f, "{}: {} -> {}", self.field, render(&self.old_value), new)?;
        if self.forces_replace {
            write!(f, " # forces replacement")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ResourceConfig};
    use crate::graph::GraphBuilder;
    use chrono::Utc;
    use serde_json::json;

    fn graph(resources: &[ResourceConfig]) -> ResourceGraph {
        GraphBuilder::new().build(resources).unwrap()
    }

    fn stored(address: &str, id: &str, attributes: Attributes, deps: &[&str]) -> StateRecord {
        let address = ResourceAddress::parse(address).unwrap();
        StateRecord {
            resource_type: address.resource_type().to_string(),
            provider: String::from("null"),
            id: id.to_string(),
            attributes,
            outputs: Attributes::from([(String::from("ip"), json!("10.0.0.4"))]),
            dependencies: deps.iter().map(|d| ResourceAddress::parse(d).unwrap()).collect(),
            serial: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            address,
        }
    }

    fn snapshot(records: Vec<StateRecord>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        for r in records {
            snapshot.records.insert(r.address.clone(), r);
        }
        snapshot
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    fn a_and_b() -> Vec<ResourceConfig> {
        vec![
            ResourceConfig::new("null_resource", "a").with_attribute("size", json!(1)),
            ResourceConfig::new("null_resource", "b").with_attribute("a_id", json!("${null_resource.a.id}")),
        ]
    }

    #[test]
    fn test_create_from_empty_state() {
        let registry = ProviderRegistry::with_builtin();
        let set = DiffEngine::new(&registry)
            .compute_diff(&graph(&a_and_b()), &StateSnapshot::new())
            .unwrap();

        assert_eq!(set.creates, 2);
        let b = &set.changes[1];
        assert_eq!(b.action, ChangeAction::Create);
        assert!(b.unknown.contains("a_id"));
        assert!(b.attribute_changes[0].unknown);
    }

    #[test]
    fn test_unchanged_is_noop() {
        let registry = ProviderRegistry::with_builtin();
        let state = snapshot(vec![
            stored("null_resource.a", "a-1", attrs(&[("size", json!(1))]), &[]),
            stored("null_resource.b", "b-1", attrs(&[("a_id", json!("a-1"))]), &["null_resource.a"]),
        ]);

        let set = DiffEngine::new(&registry).compute_diff(&graph(&a_and_b()), &state).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.unchanged, 2);
        assert_eq!(set.changes[1].prior.as_ref().unwrap().id, "b-1");
    }

    #[test]
    fn test_in_place_update_keeps_id_known() {
        let registry = ProviderRegistry::with_builtin();
        let state = snapshot(vec![
            stored("null_resource.a", "a-1", attrs(&[("size", json!(0))]), &[]),
            stored("null_resource.b", "b-1", attrs(&[("a_id", json!("a-1"))]), &["null_resource.a"]),
        ]);

        let set = DiffEngine::new(&registry).compute_diff(&graph(&a_and_b()), &state).unwrap();
        let a = set.get(&ResourceAddress::new("null_resource", "a")).unwrap();
        assert_eq!(a.action, ChangeAction::Update);
        assert!(!a.replace);
        assert_eq!(a.attribute_changes[0].old_value, Some(json!(0)));

        let b = set.get(&ResourceAddress::new("null_resource", "b")).unwrap();
        assert_eq!(b.action, ChangeAction::NoOp);
    }

    #[test]
    fn test_force_new_attribute_replaces_and_propagates_unknown() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![
            ResourceConfig::new("null_resource", "a").with_attribute("triggers", json!({"v": 2})),
            ResourceConfig::new("null_resource", "b").with_attribute("a_id", json!("${null_resource.a.id}")),
        ];
        let state = snapshot(vec![
            stored("null_resource.a", "a-1", attrs(&[("triggers", json!({"v": 1}))]), &[]),
            stored("null_resource.b", "b-1", attrs(&[("a_id", json!("a-1"))]), &["null_resource.a"]),
        ]);

        let set = DiffEngine::new(&registry).compute_diff(&graph(&resources), &state).unwrap();
        assert_eq!(set.replaces, 1);
        assert!(set.changes[0].attribute_changes[0].forces_replace);

        let b = &set.changes[1];
        assert_eq!(b.action, ChangeAction::Update);
        assert!(b.attribute_changes[0].unknown);
    }

    #[test]
    fn test_removed_attribute_is_update() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![ResourceConfig::new("null_resource", "a")];
        let state = snapshot(vec![stored("null_resource.a", "a-1", attrs(&[("size", json!(1))]), &[])]);

        let set = DiffEngine::new(&registry).compute_diff(&graph(&resources), &state).unwrap();
        let change = &set.changes[0];
        assert_eq!(change.action, ChangeAction::Update);
        assert_eq!(change.attribute_changes[0].new_value, None);
    }

    #[test]
    fn test_ignore_changes() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![
            ResourceConfig::new("null_resource", "a")
                .with_attribute("tags", json!({"owner": "new"}))
                .with_lifecycle(LifecycleConfig {
                    prevent_destroy: false,
                    ignore_changes: vec![String::from("tags")],
                }),
        ];
        let state = snapshot(vec![stored("null_resource.a", "a-1", attrs(&[("tags", json!({"owner": "old"}))]), &[])]);

        let set = DiffEngine::new(&registry).compute_diff(&graph(&resources), &state).unwrap();
        assert_eq!(set.changes[0].action, ChangeAction::NoOp);
    }

    #[test]
    fn test_orphan_is_deleted() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![ResourceConfig::new("null_resource", "a")];
        let state = snapshot(vec![
            stored("null_resource.a", "a-1", Attributes::new(), &[]),
            stored("null_resource.gone", "g-1", Attributes::new(), &["null_resource.a"]),
        ]);

        let set = DiffEngine::new(&registry).compute_diff(&graph(&resources), &state).unwrap();
        assert_eq!(set.deletes, 1);
        let orphan = set.changes.last().unwrap();
        assert_eq!(orphan.action, ChangeAction::Delete);
        assert_eq!(orphan.recorded_dependencies.len(), 1);
    }

    #[test]
    fn test_reference_to_missing_output_of_unchanged_dependency() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![
            ResourceConfig::new("null_resource", "a"),
            ResourceConfig::new("null_resource", "b").with_attribute("x", json!("${null_resource.a.nope}")),
        ];
        let state = snapshot(vec![stored("null_resource.a", "a-1", Attributes::new(), &[])]);

        let err = DiffEngine::new(&registry).compute_diff(&graph(&resources), &state).unwrap_err();
        assert!(matches!(err, ProvisioError::Config(ConfigError::UnresolvedReference { .. })));
    }

    #[test]
    fn test_reference_to_output_of_unchanged_dependency() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![
            ResourceConfig::new("null_resource", "a"),
            ResourceConfig::new("null_resource", "b").with_attribute("url", json!("http://${null_resource.a.ip}/")),
        ];
        let state = snapshot(vec![stored("null_resource.a", "a-1", Attributes::new(), &[])]);

        let set = DiffEngine::new(&registry).compute_diff(&graph(&resources), &state).unwrap();
        assert_eq!(set.changes[1].after.as_ref().unwrap()["url"], json!("http://10.0.0.4/"));
    }

    #[test]
    fn test_prevent_destroy() {
        let registry = ProviderRegistry::with_builtin();
        let protected = LifecycleConfig {
            prevent_destroy: true,
            ignore_changes: Vec::new(),
        };
        let resources = vec![
            ResourceConfig::new("null_resource", "a")
                .with_attribute("triggers", json!(2))
                .with_lifecycle(protected),
        ];
        let state = snapshot(vec![stored("null_resource.a", "a-1", attrs(&[("triggers", json!(1))]), &[])]);
        let engine = DiffEngine::new(&registry);

        let err = engine.compute_diff(&graph(&resources), &state).unwrap_err();
        assert!(matches!(err, ProvisioError::Plan(PlanError::PreventDestroy { .. })));

        let err = engine.compute_destroy(&graph(&resources), &state).unwrap_err();
        assert!(matches!(err, ProvisioError::Plan(PlanError::PreventDestroy { .. })));
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![ResourceConfig::new("azurerm_subnet", "internal")];

        let err = DiffEngine::new(&registry)
            .compute_diff(&graph(&resources), &StateSnapshot::new())
            .unwrap_err();
        assert!(matches!(err, ProvisioError::Config(ConfigError::UnknownProvider { .. })));
    }
}
