//! Plan executor.
//!
//! Steps run on a pool of worker tasks fed from a shared queue. A step is
//! queued once every step it waits for has been applied. When a step fails,
//! everything that transitively waits for it is skipped while independent
//! branches keep going. Cancellation stops new steps from starting and lets
//! in-flight provider calls finish.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Attributes, ExecutionConfig};
use crate::error::{ApplyError, ConfigError, ProviderError, ProviderResult, ProvisioError, Result, StateError};
use crate::graph::reference::resolve;
use crate::graph::{Reference, ResourceAddress, Resolved};
use crate::provider::{Provider, ProviderRegistry, ProviderResponse, ResourceRequest};
use crate::state::{StateRecord, StateStore};

use super::cancel::CancelSignal;
use super::diff::ChangeAction;
use super::plan::{Plan, PlannedStep};

/// Executes plans against providers and the state store.
#[derive(Debug, Clone)]
pub struct Executor {
    registry: Arc<ProviderRegistry>,
    config: ExecutionConfig,
}

/// Final status of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepStatus {
    /// The step completed and its result is recorded in state.
    Applied,
    /// The provider call or the state write failed.
    Failed {
        /// Error message.
        error: String,
    },
    /// A step this one waits for failed.
    Skipped {
        /// The failed step's address.
        cause: ResourceAddress,
    },
    /// Cancellation was requested before the step started.
    Cancelled,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Step index in the plan.
    pub index: usize,
    /// Resource address.
    pub address: ResourceAddress,
    /// Action of the step.
    pub action: ChangeAction,
    /// Step is one half of a replacement.
    pub replace: bool,
    /// Final status.
    #[serde(flatten)]
    pub status: StepStatus,
    /// Provider identifier after the step, if known.
    pub id: Option<String>,
    /// Wall time spent in the step.
    pub duration_ms: u64,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every step was applied.
    Complete,
    /// At least one step failed, was skipped or was cancelled.
    Partial,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Plan that was executed.
    pub plan_id: String,
    /// Outcomes in plan step order.
    pub outcomes: Vec<StepOutcome>,
    /// Terminal state.
    pub status: RunStatus,
    /// Whether cancellation was requested.
    pub cancelled: bool,
}

/// Shared by every worker of one run.
struct StepContext {
    plan: Arc<Plan>,
    store: Arc<StateStore>,
    registry: Arc<ProviderRegistry>,
    config: ExecutionConfig,
    cancel: CancelSignal,
}

struct StepResult {
    index: usize,
    status: StepStatus,
    id: Option<String>,
    duration: Duration,
}

type WorkQueue = Arc<Mutex<mpsc::UnboundedReceiver<usize>>>;

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub const fn new(registry: Arc<ProviderRegistry>, config: ExecutionConfig) -> Self {
        Self { registry, config }
    }

    /// Returns the execution policy.
    #[must_use]
    pub const fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Executes a plan.
    ///
    /// Per-step failures are reported in the [`ApplyReport`], not as errors.
    ///
    /// # Errors
    ///
    /// Returns a state conflict if the state no longer matches what the plan
    /// was computed against (nothing is executed in that case), or
    /// [`ApplyError::WorkerFailure`] if a worker task dies.
    pub async fn execute(
        &self,
        plan: Arc<Plan>,
        store: Arc<StateStore>,
        cancel: CancelSignal,
    ) -> Result<ApplyReport> {
        Self::preflight(&plan, &store)?;

        let n = plan.steps.len();
        let mut results: Vec<Option<StepResult>> = (0..n).map(|_| None).collect();
        let mut pending: Vec<usize> = plan.steps.iter().map(|s| s.wait_for.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (index, step) in plan.steps.iter().enumerate() {
            for &waits in &step.wait_for {
                dependents[waits].push(index);
            }
        }

        let mut cancelled = cancel.is_cancelled();
        let mut cancel_watch = cancel.clone();

        info!(
            "Executing plan {} ({} steps, parallelism {})",
            plan.id, n, self.config.parallelism
        );

        let (work_tx, work_rx) = mpsc::unbounded_channel::<usize>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<StepResult>();
        let queue: WorkQueue = Arc::new(Mutex::new(work_rx));
        let context = Arc::new(StepContext {
            plan: Arc::clone(&plan),
            store,
            registry: Arc::clone(&self.registry),
            config: self.config,
            cancel,
        });

        let mut workers = JoinSet::new();
        if !cancelled && n > 0 {
            for worker in 0..self.config.parallelism.clamp(1, n) {
                workers.spawn(Self::worker(
                    worker,
                    Arc::clone(&context),
                    Arc::clone(&queue),
                    done_tx.clone(),
                ));
            }
        }
        drop(done_tx);

        let dispatch = |index: usize| {
            work_tx
                .send(index)
                .map_err(|_| worker_failure("work queue closed"))
        };

        let mut in_flight = 0usize;
        if cancelled {
            warn!("Cancelled before any step started");
        } else {
            for index in (0..n).filter(|i| pending[*i] == 0) {
                dispatch(index)?;
                in_flight += 1;
            }
        }

        while in_flight > 0 {
            tokio::select! {
                () = cancel_watch.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!("Cancellation requested; waiting for {in_flight} in-flight steps");
                }
                received = done_rx.recv() => {
                    let Some(result) = received else {
                        return Err(worker_failure("all workers exited"));
                    };
                    in_flight -= 1;

                    let index = result.index;
                    let status = result.status.clone();
                    results[index] = Some(result);

                    match status {
                        StepStatus::Applied => {
                            for &dependent in &dependents[index] {
                                pending[dependent] -= 1;
                                if pending[dependent] == 0 && results[dependent].is_none() && !cancelled {
                                    dispatch(dependent)?;
                                    in_flight += 1;
                                }
                            }
                        }
                        StepStatus::Failed { .. } => {
                            Self::skip_dependents(&plan, index, &dependents, &mut results);
                        }
                        StepStatus::Skipped { .. } | StepStatus::Cancelled => {}
                    }
                }
                Some(joined) = workers.join_next() => {
                    let message = match joined {
                        Ok(()) => String::from("worker exited with steps outstanding"),
                        Err(e) => format!("worker task failed: {e}"),
                    };
                    return Err(worker_failure(&message));
                }
            }
        }

        drop(work_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Worker task failed after the run: {e}");
            }
        }

        let report = ApplyReport::collect(&plan, results, cancelled);
        info!("{report}");
        Ok(report)
    }

    /// Checks that the state still matches what the plan was computed against.
    fn preflight(plan: &Plan, store: &StateStore) -> Result<()> {
        let never_written = plan.state_serial == 0 && store.serial() == 0;
        if !never_written && plan.lineage != store.lineage() {
            return Err(ProvisioError::State(StateError::Conflict {
                address: String::from("<lineage>"),
                expected: plan.lineage.clone(),
                found: store.lineage(),
            }));
        }

        for step in &plan.steps {
            if step.action == ChangeAction::Create && step.replace {
                continue;
            }

            let expected = step.prior.as_ref().map(|p| p.serial);
            let found = store.get(&step.address).map(|r| r.serial);
            if expected != found {
                return Err(ProvisioError::State(StateError::conflict(
                    step.address.to_string(),
                    expected,
                    found,
                )));
            }
        }

        Ok(())
    }

    fn skip_dependents(
        plan: &Plan,
        failed: usize,
        dependents: &[Vec<usize>],
        results: &mut [Option<StepResult>],
    ) {
        let cause = plan.steps[failed].address.clone();
        let mut stack = dependents[failed].clone();

        while let Some(index) = stack.pop() {
            if results[index].is_some() {
                continue;
            }
            debug!("Skipping {} because {cause} failed", plan.steps[index].address);
            results[index] = Some(StepResult {
                index,
                status: StepStatus::Skipped { cause: cause.clone() },
                id: None,
                duration: Duration::ZERO,
            });
            stack.extend(dependents[index].iter().copied());
        }
    }

    async fn worker(
        worker: usize,
        context: Arc<StepContext>,
        queue: WorkQueue,
        done: mpsc::UnboundedSender<StepResult>,
    ) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(index) = next else {
                break;
            };

            let result = if context.cancel.is_cancelled() {
                StepResult {
                    index,
                    status: StepStatus::Cancelled,
                    id: None,
                    duration: Duration::ZERO,
                }
            } else {
                context.run_step(index).await
            };

            if done.send(result).is_err() {
                break;
            }
        }
        debug!("Worker {worker} finished");
    }
}

fn worker_failure(message: &str) -> ProvisioError {
    ProvisioError::Apply(ApplyError::WorkerFailure {
        message: message.to_string(),
    })
}

impl StepContext {
    async fn run_step(&self, index: usize) -> StepResult {
        let step = &self.plan.steps[index];
        let started = Instant::now();
        info!("{}", step.description());

        let outcome = match step.action {
            ChangeAction::Create => self.create(step).await,
            ChangeAction::Update => self.update(step).await,
            ChangeAction::Delete => self.delete(step).await,
            ChangeAction::NoOp => self.record_dependencies(step).await,
        };

        let (status, id) = match outcome {
            Ok(id) => (StepStatus::Applied, id),
            Err(e) => {
                error!("{} failed: {e}", step.description());
                (StepStatus::Failed { error: e.to_string() }, None)
            }
        };

        StepResult {
            index,
            status,
            id,
            duration: started.elapsed(),
        }
    }

    async fn create(&self, step: &PlannedStep) -> Result<Option<String>> {
        let provider = self.provider_for(step)?;
        let request = ResourceRequest {
            address: step.address.clone(),
            resource_type: step.resource_type.clone(),
            attributes: self.resolve_attributes(step)?,
        };

        let (provider, req) = (provider.as_ref(), &request);
        let ProviderResponse { id, outputs } = self
            .call("create", &step.address, move || provider.create(req))
            .await?;

        let now = Utc::now();
        let record = StateRecord {
            address: step.address.clone(),
            resource_type: step.resource_type.clone(),
            provider: step.provider.clone(),
            id: id.clone(),
            attributes: request.attributes,
            outputs,
            dependencies: step.dependencies.clone(),
            serial: 0,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.put(record, None).await {
            error!("{} was created as '{id}' but could not be recorded", step.address);
            return Err(e);
        }

        Ok(Some(id))
    }

    async fn update(&self, step: &PlannedStep) -> Result<Option<String>> {
        let provider = self.provider_for(step)?;
        let current = self.current_record(step)?;

        let mut attributes = self.resolve_attributes(step)?;
        for key in &step.ignore_changes {
            match current.attributes.get(key) {
                Some(stored) => {
                    attributes.insert(key.clone(), stored.clone());
                }
                None => {
                    attributes.remove(key);
                }
            }
        }

        let request = ResourceRequest {
            address: step.address.clone(),
            resource_type: step.resource_type.clone(),
            attributes,
        };

        let (provider, req, prior) = (provider.as_ref(), &request, &current);
        let ProviderResponse { id, outputs } = self
            .call("update", &step.address, move || {
                provider.update(req, &prior.id, &prior.attributes)
            })
            .await?;

        let record = StateRecord {
            id: id.clone(),
            attributes: request.attributes,
            outputs,
            dependencies: step.dependencies.clone(),
            ..current.clone()
        };

        self.store.put(record, Some(current.serial)).await?;
        Ok(Some(id))
    }

    async fn delete(&self, step: &PlannedStep) -> Result<Option<String>> {
        let provider = self.provider_for(step)?;
        let current = self.current_record(step)?;

        let (provider, prior) = (provider.as_ref(), &current);
        let deleted = self
            .call("delete", &step.address, move || {
                provider.delete(&prior.resource_type, &prior.id, &prior.attributes)
            })
            .await;

        match deleted {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                warn!("{} ('{}') was already gone", step.address, current.id);
            }
            Err(e) => return Err(e.into()),
        }

        self.store.delete(&step.address, Some(current.serial)).await?;
        Ok(Some(current.id))
    }

    /// A no-op still records a changed dependency set.
    async fn record_dependencies(&self, step: &PlannedStep) -> Result<Option<String>> {
        let current = self.current_record(step)?;

        if current.dependencies != step.dependencies {
            debug!("Recording new dependencies for {}", step.address);
            let record = StateRecord {
                dependencies: step.dependencies.clone(),
                ..current.clone()
            };
            self.store.put(record, Some(current.serial)).await?;
        }

        Ok(Some(current.id))
    }

    fn provider_for(&self, step: &PlannedStep) -> Result<Arc<dyn Provider>> {
        self.registry.get(&step.provider).ok_or_else(|| {
            ProvisioError::Config(ConfigError::UnknownProvider {
                provider: step.provider.clone(),
                address: step.address.to_string(),
            })
        })
    }

    /// Returns the stored record, checking it is the one the step was planned against.
    fn current_record(&self, step: &PlannedStep) -> Result<StateRecord> {
        let expected = step.prior.as_ref().map(|p| p.serial);
        let current = self.store.get(&step.address);

        match current {
            Some(record) if Some(record.serial) == expected => Ok(record),
            other => Err(ProvisioError::State(StateError::conflict(
                step.address.to_string(),
                expected,
                other.map(|r| r.serial),
            ))),
        }
    }

    /// Resolves references against the values committed so far.
    fn resolve_attributes(&self, step: &PlannedStep) -> Result<Attributes> {
        let from = &step.address;
        let store = &self.store;
        let unresolved = |reference: &Reference| ConfigError::UnresolvedReference {
            from: from.to_string(),
            target: reference.to_string(),
        };

        let mut lookup = |reference: &Reference| -> std::result::Result<Resolved, ConfigError> {
            store
                .get(&reference.target)
                .and_then(|record| record.value_of(&reference.path))
                .map(Resolved::Known)
                .ok_or_else(|| unresolved(reference))
        };

        let mut attributes = Attributes::new();
        for (key, value) in &step.config {
            match resolve(value, from, &mut lookup)? {
                Resolved::Known(v) => {
                    attributes.insert(key.clone(), v);
                }
                Resolved::Unknown => {
                    return Err(ProvisioError::Config(ConfigError::invalid_reference(
                        from.to_string(),
                        key.clone(),
                        "value still unknown at apply time",
                    )));
                }
            }
        }

        Ok(attributes)
    }

    /// Runs one provider operation with the timeout and retry policy.
    async fn call<T, F, Fut>(&self, operation: &str, address: &ResourceAddress, mut attempt: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let secs = self.config.operation_timeout_secs;
        let mut retries = 0;

        loop {
            let result = tokio::time::timeout(Duration::from_secs(secs), attempt())
                .await
                .unwrap_or_else(|_| {
                    Err(ProviderError::Timeout {
                        operation: operation.to_string(),
                        address: address.to_string(),
                        secs,
                    })
                });

            match result {
                Err(e) if e.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    warn!(
                        "{operation} {address} failed: {e}; retry {retries}/{}",
                        self.config.max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
                other => return other,
            }
        }
    }
}

impl ApplyReport {
    fn collect(plan: &Plan, results: Vec<Option<StepResult>>, cancelled: bool) -> Self {
        let outcomes: Vec<StepOutcome> = plan
            .steps
            .iter()
            .zip(results)
            .enumerate()
            .map(|(index, (step, result))| {
                let (status, id, duration) = result.map_or(
                    (StepStatus::Cancelled, None, Duration::ZERO),
                    |r| (r.status, r.id, r.duration),
                );
                StepOutcome {
                    index,
                    address: step.address.clone(),
                    action: step.action,
                    replace: step.replace,
                    status,
                    id,
                    duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                }
            })
            .collect();

        let status = if outcomes.iter().all(|o| o.status == StepStatus::Applied) {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };

        Self {
            plan_id: plan.id.clone(),
            outcomes,
            status,
            cancelled,
        }
    }

    /// Returns true if every step was applied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }

    /// Number of applied steps.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.count(|s| matches!(s, StepStatus::Applied))
    }

    /// Number of failed steps.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, StepStatus::Failed { .. }))
    }

    /// Number of skipped steps.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, StepStatus::Skipped { .. }))
    }

    /// Number of cancelled steps.
    #[must_use]
    pub fn cancelled_steps(&self) -> usize {
        self.count(|s| matches!(s, StepStatus::Cancelled))
    }

    fn count(&self, predicate: impl Fn(&StepStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }

    /// Status of an address: the first step for it that was not applied, or
    /// `Applied` if every step for it was.
    #[must_use]
    pub fn status_of(&self, address: &ResourceAddress) -> Option<&StepStatus> {
        let mut steps = self.outcomes.iter().filter(|o| &o.address == address);
        let first = steps.next()?;
        if first.status != StepStatus::Applied {
            return Some(&first.status);
        }
        Some(
            steps
                .map(|o| &o.status)
                .find(|s| **s != StepStatus::Applied)
                .unwrap_or(&first.status),
        )
    }

    /// Addresses touched by applied steps, for history.
    #[must_use]
    pub fn applied_addresses(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status == StepStatus::Applied && o.action != ChangeAction::NoOp)
            .map(|o| o.address.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Short description of what went wrong, if anything.
    #[must_use]
    pub fn error_summary(&self) -> Option<String> {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|o| match &o.status {
                StepStatus::Failed { error } => Some(format!("{}: {error}", o.address)),
                _ => None,
            })
            .collect();

        if !failures.is_empty() {
            Some(failures.join("; "))
        } else if self.cancelled {
            Some(String::from("cancelled"))
        } else {
            None
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Skipped { cause } => write!(f, "skipped ({cause} failed)"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} steps ({}): {} applied, {} failed, {} skipped, {} cancelled",
            self.outcomes.len(),
            self.status,
            self.applied(),
            self.failed(),
            self.skipped(),
            self.cancelled_steps()
        )
    }
}
