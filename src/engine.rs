//! Engine facade.
//!
//! Ties the graph builder, diff engine, planner and executor together, and
//! implements refresh: reading every recorded resource back from its provider
//! so that state reflects what actually exists.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Attributes, ConfigHasher, ExecutionConfig, Manifest};
use crate::error::{ConfigError, ProviderError, ProvisioError, Result};
use crate::graph::{GraphBuilder, ResourceAddress, ResourceGraph};
use crate::planner::{ApplyReport, AttributeChange, CancelSignal, DiffEngine, Executor, Plan};
use crate::provider::{ObservedResource, ProviderRegistry};
use crate::state::{HistoryEntry, HistoryOperation, StateRecord, StateSnapshot, StateStore};

/// The provisioning engine.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<ProviderRegistry>,
    execution: ExecutionConfig,
}

/// Result of comparing one record with its remote object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// Remote object matches the record.
    InSync,
    /// Remote attributes differ from the record.
    Changed {
        /// Differences, old = recorded, new = observed.
        changes: Vec<AttributeChange>,
    },
    /// Remote object no longer exists.
    Missing,
    /// The provider read failed.
    Error {
        /// Error message.
        message: String,
    },
}

/// Drift of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    /// Resource address.
    pub address: ResourceAddress,
    /// What was found.
    #[serde(flatten)]
    pub kind: DriftKind,
}

/// Report of a refresh.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// One entry per recorded resource, in address order.
    pub entries: Vec<DriftEntry>,
    /// Whether state was left untouched.
    pub dry_run: bool,
}

impl Engine {
    /// Creates an engine.
    #[must_use]
    pub const fn new(registry: Arc<ProviderRegistry>, execution: ExecutionConfig) -> Self {
        Self { registry, execution }
    }

    /// Creates an engine with the built-in providers.
    ///
    /// Relative `local_file` paths are resolved against `base_dir`, the
    /// directory of the manifest.
    #[must_use]
    pub fn with_builtin_providers(execution: ExecutionConfig, base_dir: &Path) -> Self {
        Self::new(Arc::new(ProviderRegistry::with_builtin_in(base_dir)), execution)
    }

    /// Overrides the number of concurrent provider operations.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.execution.parallelism = parallelism;
        self
    }

    /// Returns the provider registry.
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Returns the execution policy.
    #[must_use]
    pub const fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Builds the resource graph of a manifest and checks every node has a provider.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid declarations, unresolvable
    /// references, cycles, unknown providers or unsupported resource types.
    pub fn build_graph(&self, manifest: &Manifest) -> Result<ResourceGraph> {
        let graph = GraphBuilder::new().build(&manifest.resources)?;
        for node in graph.nodes() {
            self.registry.resolve(&node.provider, &node.address)?;
        }
        debug!("Built graph with {} nodes", graph.len());
        Ok(graph)
    }

    /// Plans the changes that bring `snapshot` to the manifest.
    ///
    /// # Errors
    ///
    /// Returns a configuration or plan error; nothing is changed.
    pub fn plan(&self, manifest: &Manifest, snapshot: &StateSnapshot) -> Result<Plan> {
        let graph = self.build_graph(manifest)?;
        let set = DiffEngine::new(&self.registry).compute_diff(&graph, snapshot)?;

        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            set.creates, set.updates, set.replaces, set.deletes, set.unchanged
        );

        let hash = ConfigHasher::new().hash_manifest(manifest);
        Plan::from_change_set(&set, &hash, snapshot, false)
    }

    /// Plans the deletion of every recorded resource.
    ///
    /// When a manifest is given, resources it still declares with
    /// `prevent_destroy` block the plan.
    ///
    /// # Errors
    ///
    /// Returns a plan error if a protected resource would be destroyed.
    pub fn plan_destroy(&self, manifest: Option<&Manifest>, snapshot: &StateSnapshot) -> Result<Plan> {
        let (graph, hash) = match manifest {
            Some(manifest) => (
                GraphBuilder::new().build(&manifest.resources)?,
                ConfigHasher::new().hash_manifest(manifest),
            ),
            None => (ResourceGraph::empty(), String::new()),
        };

        let set = DiffEngine::new(&self.registry).compute_destroy(&graph, snapshot)?;
        info!("Destroy: {} resources", set.deletes);
        Plan::from_change_set(&set, &hash, snapshot, true)
    }

    /// Applies a plan and records the run in the state history.
    ///
    /// The state is re-read from the backend first, so a plan computed
    /// before someone else wrote the state is rejected as a conflict.
    ///
    /// # Errors
    ///
    /// Returns a state conflict if the plan is stale; per-step failures are
    /// reported in the [`ApplyReport`].
    pub async fn apply(&self, plan: Arc<Plan>, store: Arc<StateStore>, cancel: CancelSignal) -> Result<ApplyReport> {
        store.reload().await?;

        let executor = Executor::new(Arc::clone(&self.registry), self.execution);
        let report = executor
            .execute(Arc::clone(&plan), Arc::clone(&store), cancel)
            .await?;

        if plan.is_empty() {
            return Ok(report);
        }

        let operation = if plan.destroy {
            HistoryOperation::Destroy
        } else {
            HistoryOperation::Apply
        };
        let mut entry = HistoryEntry::new(operation, report.applied_addresses(), report.is_complete())
            .with_plan_id(plan.id.clone());
        if let Some(summary) = report.error_summary() {
            entry = entry.with_error(summary);
        }

        if let Err(e) = store.add_history(entry).await {
            warn!("Failed to record history: {e}");
        }

        Ok(report)
    }

    /// Plans and applies a manifest.
    ///
    /// A state conflict causes the state to be re-read and the plan to be
    /// recomputed once; a second conflict is returned.
    ///
    /// # Errors
    ///
    /// Returns configuration, plan or state errors.
    pub async fn apply_config(
        &self,
        manifest: &Manifest,
        store: Arc<StateStore>,
        cancel: CancelSignal,
    ) -> Result<(Plan, ApplyReport)> {
        let plan = Arc::new(self.plan(manifest, &store.snapshot())?);

        match self.apply(Arc::clone(&plan), Arc::clone(&store), cancel.clone()).await {
            Ok(report) => Ok((Arc::unwrap_or_clone(plan), report)),
            Err(e) if e.is_state_conflict() => {
                warn!("{e}; re-reading state and planning again");
                store.reload().await?;
                let plan = Arc::new(self.plan(manifest, &store.snapshot())?);
                let report = self.apply(Arc::clone(&plan), store, cancel).await?;
                Ok((Arc::unwrap_or_clone(plan), report))
            }
            Err(e) => Err(e),
        }
    }

    /// Reads every recorded resource from its provider.
    ///
    /// Unless `dry_run` is set, records of objects that no longer exist are
    /// removed and drifted attributes are written to state.
    ///
    /// # Errors
    ///
    /// Returns a state error if a write fails. Provider read failures are
    /// reported per resource.
    pub async fn refresh(&self, store: &StateStore, dry_run: bool) -> Result<DriftReport> {
        let snapshot = store.snapshot();
        let mut entries = Vec::with_capacity(snapshot.len());
        let mut touched = Vec::new();

        for record in snapshot.records.values() {
            let kind = match self.read_remote(record).await {
                Err(e) => {
                    warn!("Could not read {}: {e}", record.address);
                    DriftKind::Error { message: e.to_string() }
                }
                Ok(None) => {
                    info!("{} no longer exists", record.address);
                    if !dry_run {
                        store.delete(&record.address, Some(record.serial)).await?;
                        touched.push(record.address.to_string());
                    }
                    DriftKind::Missing
                }
                Ok(Some(observed)) => {
                    let changes = attribute_drift(&record.attributes, &observed.attributes);
                    let outputs_changed = !observed.outputs.is_empty() && observed.outputs != record.outputs;

                    if !dry_run && (!changes.is_empty() || outputs_changed || observed.id != record.id) {
                        store.put(refreshed(record, observed), Some(record.serial)).await?;
                        touched.push(record.address.to_string());
                    }

                    if changes.is_empty() {
                        DriftKind::InSync
                    } else {
                        info!("{} drifted: {} attributes", record.address, changes.len());
                        DriftKind::Changed { changes }
                    }
                }
            };

            entries.push(DriftEntry {
                address: record.address.clone(),
                kind,
            });
        }

        if !touched.is_empty() {
            store
                .add_history(HistoryEntry::new(HistoryOperation::Refresh, touched, true))
                .await?;
        }

        Ok(DriftReport { entries, dry_run })
    }

    async fn read_remote(&self, record: &StateRecord) -> Result<Option<ObservedResource>> {
        let provider = self.registry.get(&record.provider).ok_or_else(|| {
            ProvisioError::Config(ConfigError::UnknownProvider {
                provider: record.provider.clone(),
                address: record.address.to_string(),
            })
        })?;

        let secs = self.execution.operation_timeout_secs;
        let read = provider.read(&record.resource_type, &record.id, &record.attributes);
        let observed = tokio::time::timeout(Duration::from_secs(secs), read)
            .await
            .map_err(|_| ProviderError::Timeout {
                operation: String::from("read"),
                address: record.address.to_string(),
                secs,
            })??;

        Ok(observed)
    }
}

/// Differences between recorded and observed attributes.
fn attribute_drift(recorded: &Attributes, observed: &Attributes) -> Vec<AttributeChange> {
    let keys: BTreeSet<&String> = recorded.keys().chain(observed.keys()).collect();

    keys.into_iter()
        .filter(|k| recorded.get(*k) != observed.get(*k))
        .map(|k| AttributeChange {
            field: k.clone(),
            old_value: recorded.get(k).cloned(),
            new_value: observed.get(k).cloned(),
            unknown: false,
            forces_replace: false,
        })
        .collect()
}

/// Record updated with what the provider reported. Empty outputs keep the
/// recorded ones.
fn refreshed(record: &StateRecord, observed: ObservedResource) -> StateRecord {
    let outputs = if observed.outputs.is_empty() {
        record.outputs.clone()
    } else {
        observed.outputs
    };

    StateRecord {
        id: observed.id,
        attributes: observed.attributes,
        outputs,
        ..record.clone()
    }
}

impl DriftReport {
    /// Returns true if any resource drifted or disappeared.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.kind, DriftKind::Changed { .. } | DriftKind::Missing))
    }

    /// Returns true if every resource matches its record.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.entries.iter().all(|e| e.kind == DriftKind::InSync)
    }

    /// Entries that are not in sync.
    pub fn drifted(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries.iter().filter(|e| e.kind != DriftKind::InSync)
    }

    /// Looks up the entry for an address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&DriftEntry> {
        self.entries.iter().find(|e| &e.address == address)
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - {} resources in sync", self.entries.len());
        }

        writeln!(f, "Drift detected:")?;
        for entry in self.drifted() {
            match &entry.kind {
                DriftKind::Changed { changes } => {
                    writeln!(f, "  ~ {}", entry.address)?;
                    for change in changes {
                        writeln!(f, "      {change}")?;
                    }
                }
                DriftKind::Missing => writeln!(f, "  - {} (deleted outside provisio)", entry.address)?,
                DriftKind::Error { message } => writeln!(f, "  ! {}: {message}", entry.address)?,
                DriftKind::InSync => {}
            }
        }
        Ok(())
    }
}
