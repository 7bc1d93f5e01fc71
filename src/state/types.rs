//! Persisted state types.
//!
//! A [`StateSnapshot`] is the unit of persistence: every write saves the
//! whole snapshot, so a reader always sees one consistent view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::config::Attributes;
use crate::graph::ResourceAddress;
use crate::graph::reference::lookup_path;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Identity of this state, fixed when it is first created.
    pub lineage: String,
    /// Incremented on every successful write.
    pub serial: u64,
    /// Records keyed by address.
    pub records: BTreeMap<ResourceAddress, StateRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Last-applied state of one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource type.
    pub resource_type: String,
    /// Provider that manages the resource.
    pub provider: String,
    /// Provider-assigned identifier.
    pub id: String,
    /// Last-applied attributes, fully resolved.
    pub attributes: Attributes,
    /// Computed values returned by the provider.
    #[serde(default)]
    pub outputs: Attributes,
    /// Dependencies at the time of the last apply; used to order deletes.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Optimistic-concurrency version of this record.
    pub serial: u64,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of run.
    pub operation: HistoryOperation,
    /// Plan that was applied, if any.
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Addresses affected.
    pub resources: Vec<String>,
    /// Whether every step succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Kinds of recorded runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Plan applied.
    Apply,
    /// Destroy plan applied.
    Destroy,
    /// State refreshed from providers.
    Refresh,
    /// Record removed by hand.
    StateRm,
}

impl StateSnapshot {
    /// Creates an empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            records: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Appends a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the records whose recorded dependencies contain `address`.
    pub fn dependents_of<'a>(&'a self, address: &'a ResourceAddress) -> impl Iterator<Item = &'a StateRecord> {
        self.records
            .values()
            .filter(move |r| r.dependencies.contains(address))
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateRecord {
    /// Looks up a referenced value.
    ///
    /// `id` is the provider identifier; any other name is looked up in the
    /// outputs first, then in the attributes.
    #[must_use]
    pub fn value_of(&self, path: &[String]) -> Option<Value> {
        let (first, rest) = path.split_first()?;

        if first == "id" && rest.is_empty() {
            return Some(Value::String(self.id.clone()));
        }

        self.outputs
            .get(first)
            .and_then(|v| lookup_path(v, rest))
            .or_else(|| self.attributes.get(first).and_then(|v| lookup_path(v, rest)))
            .cloned()
    }
}

impl HistoryEntry {
    /// Creates an entry timestamped now.
    #[must_use]
    pub fn new(operation: HistoryOperation, resources: Vec<String>, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            plan_id: None,
            resources,
            success,
            error: None,
        }
    }

    /// Sets the applied plan.
    #[must_use]
    pub fn with_plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    /// Sets the error summary.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

impl fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
            Self::Refresh => write!(f, "refresh"),
            Self::StateRm => write!(f, "state rm"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> StateRecord {
        StateRecord {
            address: ResourceAddress::new("azurerm_subnet", "internal"),
            resource_type: String::from("azurerm_subnet"),
            provider: String::from("azurerm"),
            id: String::from("subnet-1"),
            attributes: Attributes::from([
                (String::from("name"), json!("internal")),
                (String::from("tags"), json!({"env": "dev"})),
            ]),
            outputs: Attributes::from([(String::from("name"), json!("computed-name"))]),
            dependencies: BTreeSet::new(),
            serial: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| (*p).to_string()).collect()
    }

    #[test]
    fn test_value_of() {
        let r = record();
        assert_eq!(r.value_of(&path(&["id"])), Some(json!("subnet-1")));
        assert_eq!(r.value_of(&path(&["name"])), Some(json!("computed-name")));
        assert_eq!(r.value_of(&path(&["tags", "env"])), Some(json!("dev")));
        assert_eq!(r.value_of(&path(&["missing"])), None);
        assert_eq!(r.value_of(&[]), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new();
        for i in 0..(MAX_HISTORY + 5) {
            snapshot.push_history(HistoryEntry::new(HistoryOperation::Apply, vec![i.to_string()], true));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].resources, vec![String::from("5")]);
    }

    #[test]
    fn test_snapshot_serde_keys_are_addresses() {
        let mut snapshot = StateSnapshot::new();
        let r = record();
        snapshot.records.insert(r.address.clone(), r);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["records"]["azurerm_subnet.internal"].is_object());

        let back: StateSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
