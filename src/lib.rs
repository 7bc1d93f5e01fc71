// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Provisio
//!
//! A declarative infrastructure provisioning engine.
//!
//! ## Overview
//!
//! Resources are declared in a YAML manifest. Provisio turns the manifest
//! into a dependency graph, compares it with the recorded state, produces an
//! ordered plan and applies it through pluggable providers:
//!
//! - Attribute references (`${type.name.attr}`) become dependency edges
//! - Independent resources are created, updated and deleted concurrently
//! - A failed resource only stops the resources that depend on it
//! - State writes are per record with optimistic concurrency
//! - `refresh` detects drift between state and the real objects
//!
//! ## Architecture
//!
//! 1. **Graph builder**: validates declarations and orders them
//! 2. **State store**: persists one record per managed resource
//! 3. **Differ**: compares the graph with state per attribute
//! 4. **Planner**: orders the changes into executable steps
//! 5. **Executor**: runs the steps with bounded parallelism
//!
//! ## Modules
//!
//! - [`config`]: Manifest parsing and validation
//! - [`graph`]: Addresses, references and the resource graph
//! - [`provider`]: Provider trait and built-in providers
//! - [`state`]: State store and backends (local, S3, memory)
//! - [`planner`]: Diff, plan and concurrent execution
//! - [`engine`]: Plan, apply, destroy and refresh entry points
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web
//!   environment: prod
//!
//! resources:
//!   - type: local_file
//!     name: config
//!     attributes:
//!       filename: out/app.conf
//!       content: "listen 8080"
//!   - type: null_resource
//!     name: app
//!     provider: "null"
//!     attributes:
//!       config_id: ${local_file.config.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Manifest, ResourceConfig};
pub use engine::{DriftReport, Engine};
pub use error::{ProvisioError, Result};
pub use graph::{GraphBuilder, ResourceAddress, ResourceGraph};
pub use planner::{ApplyReport, CancelHandle, CancelSignal, DiffEngine, Executor, Plan, cancel_pair};
pub use provider::{Provider, ProviderRegistry};
pub use state::{StateBackend, StateRecord, StateSnapshot, StateStore};
