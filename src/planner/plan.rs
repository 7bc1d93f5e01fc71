//! Execution plan types and construction.
//!
//! A plan turns a change set into ordered steps. Each step names the steps it
//! must wait for, so the executor can run independent steps in parallel.
//!
//! Ordering rules:
//!
//! - a create, update or no-op waits for the apply step of each dependency
//! - a replaced resource is deleted before it is created again
//! - a delete waits for the deletes of everything that depended on the
//!   resource at its last apply
//! - an orphan delete also waits for the apply of surviving resources that
//!   used to depend on it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use crate::config::Attributes;
use crate::error::{PlanError, ProvisioError, Result};
use crate::graph::ResourceAddress;
use crate::graph::toposort::stable_order;
use crate::state::StateSnapshot;

use super::diff::{AttributeChange, Change, ChangeAction, ChangeSet, PriorState};

/// Current version of the saved plan format.
pub const PLAN_FORMAT_VERSION: u32 = 1;

/// An ordered, dependency-annotated set of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Saved plan format version.
    pub format_version: u32,
    /// Unique plan identifier.
    pub id: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the configuration the plan was computed from.
    pub config_hash: String,
    /// Lineage of the state the plan was computed against.
    pub lineage: String,
    /// Serial of the state the plan was computed against.
    pub state_serial: u64,
    /// Whether this is a destroy plan.
    #[serde(default)]
    pub destroy: bool,
    /// Steps in execution order.
    pub steps: Vec<PlannedStep>,
}

/// A single step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Action to perform.
    pub action: ChangeAction,
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource type.
    pub resource_type: String,
    /// Provider name.
    pub provider: String,
    /// Step is one half of a replacement.
    #[serde(default)]
    pub replace: bool,
    /// Raw desired attributes, resolved at apply time.
    #[serde(default)]
    pub config: Attributes,
    /// Dependencies to record with the resource.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Attributes whose changes are ignored.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    /// Stored record the step expects to find.
    pub prior: Option<PriorState>,
    /// Attribute differences, for display.
    #[serde(default)]
    pub changes: Vec<AttributeChange>,
    /// Indices of steps that must complete first.
    #[serde(default)]
    pub wait_for: Vec<usize>,
}

impl Plan {
    /// Builds a plan from a change set.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the ordering constraints are circular.
    pub fn from_change_set(
        set: &ChangeSet,
        config_hash: &str,
        snapshot: &StateSnapshot,
        destroy: bool,
    ) -> Result<Self> {
        let mut steps: Vec<PlannedStep> = Vec::with_capacity(set.changes.len());
        let mut apply_step: HashMap<&ResourceAddress, usize> = HashMap::new();
        let mut delete_step: HashMap<&ResourceAddress, usize> = HashMap::new();

        for change in &set.changes {
            match (change.action, change.replace) {
                (ChangeAction::Update, true) => {
                    delete_step.insert(&change.address, steps.len());
                    steps.push(PlannedStep::from_change(change, ChangeAction::Delete));
                    apply_step.insert(&change.address, steps.len());
                    steps.push(PlannedStep::from_change(change, ChangeAction::Create));
                }
                (ChangeAction::Delete, _) => {
                    delete_step.insert(&change.address, steps.len());
                    steps.push(PlannedStep::from_change(change, ChangeAction::Delete));
                }
                (action, false) => {
                    apply_step.insert(&change.address, steps.len());
                    steps.push(PlannedStep::from_change(change, action));
                }
                (action, true) => {
                    return Err(ProvisioError::internal(format!(
                        "{} cannot be combined with replace for {}",
                        action, change.address
                    )));
                }
            }
        }

        for change in &set.changes {
            if let Some(&apply) = apply_step.get(&change.address) {
                for dependency in &change.dependencies {
                    if let Some(&waits) = apply_step.get(dependency) {
                        steps[apply].wait_for.push(waits);
                    }
                }
                if let Some(&delete) = delete_step.get(&change.address) {
                    steps[apply].wait_for.push(delete);
                }
            }

            // Whatever depended on this resource must be gone or moved off it first.
            for old_dependency in &change.recorded_dependencies {
                let Some(&delete) = delete_step.get(old_dependency) else {
                    continue;
                };
                if let Some(&dependent_delete) = delete_step.get(&change.address) {
                    steps[delete].wait_for.push(dependent_delete);
                }
                let orphan = !apply_step.contains_key(old_dependency);
                if orphan {
                    if let Some(&dependent_apply) = apply_step.get(&change.address) {
                        steps[delete].wait_for.push(dependent_apply);
                    }
                }
            }
        }

        for step in &mut steps {
            step.wait_for.sort_unstable();
            step.wait_for.dedup();
        }

        let prerequisites: Vec<Vec<usize>> = steps.iter().map(|s| s.wait_for.clone()).collect();
        let order = stable_order(&prerequisites).map_err(|cycle| {
            let path: Vec<String> = cycle
                .iter()
                .map(|i| format!("{} {}", steps[*i].action, steps[*i].address))
                .collect();
            ProvisioError::Plan(PlanError::Cycle {
                cycle: path.join(" -> "),
            })
        })?;

        let steps = Self::reorder(steps, &order);
        debug!("Built plan with {} steps", steps.len());

        Ok(Self {
            format_version: PLAN_FORMAT_VERSION,
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            lineage: snapshot.lineage.clone(),
            state_serial: snapshot.serial,
            destroy,
            steps,
        })
    }

    fn reorder(steps: Vec<PlannedStep>, order: &[usize]) -> Vec<PlannedStep> {
        let mut position = vec![0; order.len()];
        for (new, old) in order.iter().enumerate() {
            position[*old] = new;
        }

        let mut slots: Vec<Option<PlannedStep>> = steps.into_iter().map(Some).collect();
        order
            .iter()
            .filter_map(|old| slots[*old].take())
            .map(|mut step| {
                step.wait_for = step.wait_for.iter().map(|w| position[*w]).collect();
                step.wait_for.sort_unstable();
                step
            })
            .collect()
    }

    /// Returns true if no step changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.action == ChangeAction::NoOp)
    }

    /// Returns true if applying would rewrite the dependency set of an
    /// unchanged resource in `snapshot`.
    ///
    /// Such a plan calls no provider but still has to be applied, or the
    /// delete order of a later destroy comes from stale dependencies.
    #[must_use]
    pub fn changes_recorded_dependencies(&self, snapshot: &StateSnapshot) -> bool {
        self.steps
            .iter()
            .filter(|s| s.action == ChangeAction::NoOp)
            .any(|s| {
                snapshot
                    .records
                    .get(&s.address)
                    .is_some_and(|r| r.dependencies != s.dependencies)
            })
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the number of resources to create (excluding replacements).
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(|s| s.action == ChangeAction::Create && !s.replace)
    }

    /// Returns the number of in-place updates.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(|s| s.action == ChangeAction::Update)
    }

    /// Returns the number of replacements.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.count(|s| s.action == ChangeAction::Delete && s.replace)
    }

    /// Returns the number of resources to delete (excluding replacements).
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(|s| s.action == ChangeAction::Delete && !s.replace)
    }

    fn count(&self, predicate: impl Fn(&PlannedStep) -> bool) -> usize {
        self.steps.iter().filter(|s| predicate(s)).count()
    }

    /// Returns the steps that wait for step `index`.
    #[must_use]
    pub fn dependent_steps(&self, index: usize) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.wait_for.contains(&index))
            .map(|(i, _)| i)
            .collect()
    }

    /// One-line summary of the plan.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create_count(),
            self.update_count(),
            self.replace_count(),
            self.delete_count()
        )
    }

    /// Writes the plan as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| invalid_file(format!("serialize: {e}")))?;
        std::fs::write(path, content)?;
        debug!("Saved plan {} to {}", self.id, path.display());
        Ok(())
    }

    /// Reads a plan saved with [`Plan::save_to_file`].
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidPlanFile`] if the file is not a valid plan.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid_file(format!("cannot read {}: {e}", path.display())))?;
        let plan: Self = serde_json::from_str(&content).map_err(|e| invalid_file(e.to_string()))?;
        plan.check_well_formed()?;
        Ok(plan)
    }

    fn check_well_formed(&self) -> Result<()> {
        if self.format_version != PLAN_FORMAT_VERSION {
            return Err(invalid_file(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        for (index, step) in self.steps.iter().enumerate() {
            if let Some(bad) = step.wait_for.iter().find(|w| **w >= index) {
                return Err(invalid_file(format!(
                    "step {index} ({}) waits for step {bad} which does not precede it",
                    step.address
                )));
            }
        }

        Ok(())
    }
}

fn invalid_file(message: String) -> ProvisioError {
    ProvisioError::Plan(PlanError::InvalidPlanFile { message })
}

impl PlannedStep {
    fn from_change(change: &Change, action: ChangeAction) -> Self {
        let prior = if action == ChangeAction::Create {
            None
        } else {
            change.prior.clone()
        };

        Self {
            action,
            address: change.address.clone(),
            resource_type: change.resource_type.clone(),
            provider: change.provider.clone(),
            replace: change.replace,
            config: change.config.clone(),
            dependencies: change.dependencies.clone(),
            ignore_changes: change.ignore_changes.clone(),
            prior,
            changes: change.attribute_changes.clone(),
            wait_for: Vec::new(),
        }
    }

    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.action, self.replace) {
            (ChangeAction::Create, true) => format!("Re-create {}", self.address),
            (ChangeAction::Delete, true) => format!("Delete {} for replacement", self.address),
            (ChangeAction::Create, false) => format!("Create {}", self.address),
            (ChangeAction::Update, _) => format!("Update {} in place", self.address),
            (ChangeAction::Delete, false) => format!("Delete {}", self.address),
            (ChangeAction::NoOp, _) => format!("No change for {}", self.address),
        }
    }
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())?;
        if !self.wait_for.is_empty() {
            let waits: Vec<String> = self.wait_for.iter().map(ToString::to_string).collect();
            write!(f, " (after {})", waits.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes. Infrastructure matches the configuration.");
        }

        writeln!(f, "Plan {} ({}):", self.id, self.summary())?;
        for (i, step) in self.steps.iter().enumerate() {
            if step.action == ChangeAction::NoOp {
                continue;
            }
            writeln!(f, "  {i}. {step}")?;
            for change in &step.changes {
                writeln!(f, "       {change}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ResourceConfig};
    use crate::graph::GraphBuilder;
    use crate::planner::diff::DiffEngine;
    use crate::provider::ProviderRegistry;
    use crate::state::StateRecord;
    use serde_json::json;

    fn addr(text: &str) -> ResourceAddress {
        ResourceAddress::parse(text).unwrap()
    }

    fn record(address: &str, attributes: &[(&str, serde_json::Value)], deps: &[&str]) -> StateRecord {
        let address = addr(address);
        StateRecord {
            resource_type: address.resource_type().to_string(),
            provider: String::from("null"),
            id: format!("{}-id", address.name()),
            attributes: attributes.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect(),
            outputs: Attributes::new(),
            dependencies: deps.iter().map(|d| addr(d)).collect(),
            serial: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            address,
        }
    }

    fn snapshot(records: Vec<StateRecord>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        snapshot.serial = 7;
        for r in records {
            snapshot.records.insert(r.address.clone(), r);
        }
        snapshot
    }

    fn plan(resources: &[ResourceConfig], state: &StateSnapshot) -> Plan {
        let registry = ProviderRegistry::with_builtin();
        let graph = GraphBuilder::new().build(resources).unwrap();
        let set = DiffEngine::new(&registry).compute_diff(&graph, state).unwrap();
        Plan::from_change_set(&set, "hash", state, false).unwrap()
    }

    fn position(plan: &Plan, action: ChangeAction, address: &str) -> usize {
        let address = addr(address);
        plan.steps
            .iter()
            .position(|s| s.action == action && s.address == address)
            .unwrap()
    }

    #[test]
    fn test_independent_creates_keep_declaration_order() {
        let resources = vec![
            ResourceConfig::new("null_resource", "a"),
            ResourceConfig::new("null_resource", "b"),
        ];
        let plan = plan(&resources, &StateSnapshot::new());

        let order: Vec<String> = plan.steps.iter().map(|s| format!("{} {}", s.action, s.address)).collect();
        assert_eq!(order, vec!["create null_resource.a", "create null_resource.b"]);
        assert!(plan.steps.iter().all(|s| s.wait_for.is_empty()));
    }

    #[test]
    fn test_dependency_order() {
        let resources = vec![
            ResourceConfig::new("null_resource", "web").with_attribute("subnet", json!("${null_resource.subnet.id}")),
            ResourceConfig::new("null_resource", "subnet").with_attribute("vnet", json!("${null_resource.vnet.id}")),
            ResourceConfig::new("null_resource", "vnet"),
        ];
        let plan = plan(&resources, &StateSnapshot::new());

        let vnet = position(&plan, ChangeAction::Create, "null_resource.vnet");
        let subnet = position(&plan, ChangeAction::Create, "null_resource.subnet");
        let web = position(&plan, ChangeAction::Create, "null_resource.web");
        assert!(vnet < subnet && subnet < web);
        assert_eq!(plan.steps[web].wait_for, vec![subnet]);
    }

    #[test]
    fn test_replace_deletes_before_create() {
        let resources = vec![ResourceConfig::new("null_resource", "a").with_attribute("triggers", json!(2))];
        let state = snapshot(vec![record("null_resource.a", &[("triggers", json!(1))], &[])]);
        let plan = plan(&resources, &state);

        assert_eq!(plan.replace_count(), 1);
        let delete = position(&plan, ChangeAction::Delete, "null_resource.a");
        let create = position(&plan, ChangeAction::Create, "null_resource.a");
        assert!(delete < create);
        assert_eq!(plan.steps[create].wait_for, vec![delete]);
        assert!(plan.steps[create].prior.is_none());
        assert!(plan.steps[delete].prior.is_some());
    }

    #[test]
    fn test_deletes_run_in_reverse_dependency_order() {
        let state = snapshot(vec![
            record("null_resource.vnet", &[], &[]),
            record("null_resource.subnet", &[], &["null_resource.vnet"]),
            record("null_resource.nic", &[], &["null_resource.subnet"]),
        ]);
        let plan = plan(&[], &state);

        assert_eq!(plan.delete_count(), 3);
        let vnet = position(&plan, ChangeAction::Delete, "null_resource.vnet");
        let subnet = position(&plan, ChangeAction::Delete, "null_resource.subnet");
        let nic = position(&plan, ChangeAction::Delete, "null_resource.nic");
        assert!(nic < subnet && subnet < vnet);
    }

    #[test]
    fn test_orphan_delete_waits_for_former_dependent_update() {
        let resources = vec![ResourceConfig::new("null_resource", "app").with_attribute("db", json!("none"))];
        let state = snapshot(vec![
            record("null_resource.db", &[], &[]),
            record("null_resource.app", &[("db", json!("db-id"))], &["null_resource.db"]),
        ]);
        let plan = plan(&resources, &state);

        let update = position(&plan, ChangeAction::Update, "null_resource.app");
        let delete = position(&plan, ChangeAction::Delete, "null_resource.db");
        assert!(update < delete);
        assert_eq!(plan.steps[delete].wait_for, vec![update]);
    }

    #[test]
    fn test_second_plan_is_empty() {
        let resources = vec![ResourceConfig::new("null_resource", "a").with_attribute("size", json!(1))];
        let state = snapshot(vec![record("null_resource.a", &[("size", json!(1))], &[])]);
        let plan = plan(&resources, &state);

        assert!(plan.is_empty());
        assert_eq!(plan.state_serial, 7);
        assert!(plan.to_string().starts_with("No changes"));
    }

    #[test]
    fn test_new_depends_on_is_recorded_by_empty_plan() {
        let state = snapshot(vec![
            record("null_resource.db", &[], &[]),
            record("null_resource.app", &[], &[]),
        ]);
        let unchanged = vec![
            ResourceConfig::new("null_resource", "db"),
            ResourceConfig::new("null_resource", "app"),
        ];
        assert!(!plan(&unchanged, &state).changes_recorded_dependencies(&state));

        let ordered = vec![
            ResourceConfig::new("null_resource", "db"),
            ResourceConfig::new("null_resource", "app").with_depends_on("null_resource.db"),
        ];
        let plan = plan(&ordered, &state);
        assert!(plan.is_empty());
        assert!(plan.changes_recorded_dependencies(&state));
    }

    #[test]
    fn test_protected_resource_not_planned_for_destroy() {
        let registry = ProviderRegistry::with_builtin();
        let resources = vec![ResourceConfig::new("null_resource", "a").with_lifecycle(LifecycleConfig {
            prevent_destroy: true,
            ignore_changes: Vec::new(),
        })];
        let graph = GraphBuilder::new().build(&resources).unwrap();
        let state = snapshot(vec![record("null_resource.a", &[], &[])]);

        let err = DiffEngine::new(&registry).compute_destroy(&graph, &state).unwrap_err();
        assert!(matches!(err, ProvisioError::Plan(PlanError::PreventDestroy { .. })));
    }

    #[test]
    fn test_cycle_is_reported() {
        let change = |name: &str, dep: &str| Change {
            address: addr(name),
            resource_type: String::from("null_resource"),
            provider: String::from("null"),
            action: ChangeAction::Delete,
            replace: false,
            before: None,
            after: None,
            unknown: BTreeSet::new(),
            attribute_changes: Vec::new(),
            config: Attributes::new(),
            dependencies: BTreeSet::new(),
            recorded_dependencies: BTreeSet::from([addr(dep)]),
            ignore_changes: Vec::new(),
            prior: None,
        };
        let set = ChangeSet::from_changes(vec![
            change("null_resource.a", "null_resource.b"),
            change("null_resource.b", "null_resource.a"),
        ]);

        let err = Plan::from_change_set(&set, "hash", &StateSnapshot::new(), true).unwrap_err();
        assert!(matches!(err, ProvisioError::Plan(PlanError::Cycle { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plan.json");
        let resources = vec![
            ResourceConfig::new("null_resource", "a"),
            ResourceConfig::new("null_resource", "b").with_depends_on("null_resource.a"),
        ];
        let plan = plan(&resources, &StateSnapshot::new());

        plan.save_to_file(&path).unwrap();
        let loaded = Plan::load_from_file(&path).unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn test_load_rejects_forward_wait() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plan.json");
        let mut plan = plan(&[ResourceConfig::new("null_resource", "a")], &StateSnapshot::new());
        plan.steps[0].wait_for = vec![0];
        plan.save_to_file(&path).unwrap();

        let err = Plan::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ProvisioError::Plan(PlanError::InvalidPlanFile { .. })));
    }
}
