//! Configuration module for the provisio engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `provisio.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes recorded in plans

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    Attributes, ExecutionConfig, LifecycleConfig, Manifest, ProjectConfig, ResourceConfig,
    StateBackendKind, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
