//! Manifest types for the provisioning engine.
//!
//! This module defines the structs that map to the `provisio.yaml` manifest.
//! The manifest is fully declarative: it describes the desired resources and
//! how the engine should store state and schedule work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute mapping of a resource (desired or recorded).
pub type Attributes = BTreeMap<String, Value>;

/// The root manifest structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Scheduling and retry policy for apply.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Desired resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
    /// In-process storage that lives only as long as the run.
    Memory,
}

/// Scheduling and retry policy for apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of provider operations running at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Timeout for a single provider operation.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Retries for provider errors flagged as retryable.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retries.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// One resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type (e.g. `azurerm_subnet`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Name, unique per type.
    pub name: String,
    /// Provider override; defaults to the type prefix.
    #[serde(default)]
    pub provider: Option<String>,
    /// Number of instances to create; absent means a single, unindexed instance.
    #[serde(default)]
    pub count: Option<u32>,
    /// Desired attributes; strings may contain `${...}` references.
    #[serde(default)]
    pub attributes: Attributes,
    /// Explicit dependencies by address.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle options.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Lifecycle options of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LifecycleConfig {
    /// Refuse any plan that would destroy or replace this resource.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Attributes whose changes are ignored after creation.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

// Default value functions

const fn default_parallelism() -> usize {
    10
}

const fn default_operation_timeout() -> u64 {
    600
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_retry_delay() -> u64 {
    1000
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout_secs: default_operation_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Manifest {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the number of resource instances after `count` expansion.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.resources
            .iter()
            .map(|r| r.count.map_or(1, |c| c as usize))
            .sum()
    }
}

impl ResourceConfig {
    /// Creates a single-instance resource declaration.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            provider: None,
            count: None,
            attributes: Attributes::new(),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    /// Sets the provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Sets the instance count.
    #[must_use]
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_depends_on(mut self, address: impl Into<String>) -> Self {
        self.depends_on.push(address.into());
        self
    }

    /// Sets lifecycle options.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Returns the `type.name` form of the declaration.
    #[must_use]
    pub fn declared_address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_defaults() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.parallelism, 10);
        assert_eq!(exec.operation_timeout_secs, 600);
        assert_eq!(exec.max_retries, 2);
    }

    #[test]
    fn test_instance_count() {
        let manifest = Manifest {
            project: ProjectConfig {
                name: String::from("web"),
                environment: String::from("dev"),
            },
            state: StateConfig::default(),
            execution: ExecutionConfig::default(),
            resources: vec![
                ResourceConfig::new("null_resource", "lb"),
                ResourceConfig::new("null_resource", "vm").with_count(2),
                ResourceConfig::new("null_resource", "off").with_count(0),
            ],
        };
        assert_eq!(manifest.instance_count(), 3);
        assert_eq!(manifest.qualified_name(), "web-dev");
    }
}
