//! Planning and execution.
//!
//! The diff engine compares the resource graph with stored state, the plan
//! orders the resulting changes, and the executor applies them.

mod cancel;
mod diff;
mod executor;
mod plan;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use diff::{AttributeChange, Change, ChangeAction, ChangeSet, DiffEngine, PriorState};
pub use executor::{ApplyReport, Executor, RunStatus, StepOutcome, StepStatus};
pub use plan::{PLAN_FORMAT_VERSION, Plan, PlannedStep};
