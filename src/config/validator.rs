//! Manifest validation.
//!
//! Checks field-level constraints before the graph is built, collecting every
//! problem instead of stopping at the first one. Structural problems such as
//! unresolved references and cycles are reported by the graph builder.

use crate::error::{ConfigError, ProvisioError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ExecutionConfig, Manifest, ProjectConfig, ResourceConfig, StateBackendKind, StateConfig};
use crate::graph::ResourceAddress;

/// Validator for manifests.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a manifest.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails; the full list is
    /// available through [`ConfigValidator::check`].
    pub fn validate(&self, manifest: &Manifest) -> Result<ValidationResult> {
        let result = self.check(manifest);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ProvisioError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, manifest: &Manifest) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&manifest.project, &mut result);
        Self::validate_state(&manifest.state, &mut result);
        Self::validate_execution(&manifest.execution, &mut result);
        Self::validate_resources(&manifest.resources, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.push_error("project.name", "Project name cannot be empty");
        } else if !is_valid_project_name(&project.name) {
            result.push_error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.push_error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackendKind::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.push_error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackendKind::Local => {}
            StateBackendKind::Memory => {
                result
                    .warnings
                    .push(String::from("Memory state backend keeps nothing after the run exits"));
            }
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.push_error("execution.parallelism", "Parallelism must be at least 1");
        }

        if execution.operation_timeout_secs == 0 {
            result.push_error(
                "execution.operation_timeout_secs",
                "Operation timeout must be at least 1 second",
            );
        }
    }

    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let declared = resource.declared_address();

            if let Err(e) = ResourceAddress::parse(&declared) {
                result.push_error(format!("{prefix}.name"), e.to_string());
                continue;
            }

            if !seen.insert(declared.clone()) {
                result.push_error(format!("{prefix}.name"), format!("Duplicate resource: {declared}"));
            }

            if resource.provider.as_ref().is_some_and(String::is_empty) {
                result.push_error(format!("{prefix}.provider"), "Provider name cannot be empty");
            }

            if resource.count == Some(0) {
                result
                    .warnings
                    .push(format!("{declared} has count 0 and will not create any instance"));
            }

            for (j, dep) in resource.depends_on.iter().enumerate() {
                if let Err(e) = ResourceAddress::parse(dep) {
                    result.push_error(format!("{prefix}.depends_on[{j}]"), e.to_string());
                }
            }

            for attr in &resource.lifecycle.ignore_changes {
                if !resource.attributes.contains_key(attr) {
                    result.warnings.push(format!(
                        "{declared}: ignore_changes lists '{attr}' which is not a configured attribute"
                    ));
                }
            }
        }
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
