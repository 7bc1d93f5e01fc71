//! Manifest loading.
//!
//! Loads `provisio.yaml` from disk, applies `PROVISIO_*` environment
//! overrides and locates the manifest by walking parent directories.

use crate::error::{ConfigError, ProvisioError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{Manifest, StateBackendKind};

/// Parser for the provisioning manifest.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path used to find `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a manifest from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ProvisioError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisioError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a manifest from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Manifest> {
        debug!("Parsing YAML configuration");

        let manifest: Manifest = serde_yaml::from_str(content).map_err(|e| {
            ProvisioError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed configuration for project {} ({} resources)",
            manifest.project.name,
            manifest.resources.len()
        );
        Ok(manifest)
    }

    /// Loads a manifest and applies process environment overrides.
    ///
    /// Variables use the form `PROVISIO_<SECTION>_<KEY>`
    /// (e.g. `PROVISIO_STATE_BUCKET`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or an override is invalid.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        let mut manifest = self.load_file(path)?;
        Self::apply_env_overrides(&mut manifest, |key| std::env::var(key).ok())?;
        Ok(manifest)
    }

    /// Applies overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `PROVISIO_STATE_BACKEND` or `PROVISIO_PARALLELISM`
    /// cannot be parsed.
    pub fn apply_env_overrides<F>(manifest: &mut Manifest, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("PROVISIO_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            manifest.project.name = name;
        }

        if let Some(env) = lookup("PROVISIO_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            manifest.project.environment = env;
        }

        if let Some(backend) = lookup("PROVISIO_STATE_BACKEND") {
            debug!("Overriding state.backend from environment");
            manifest.state.backend = parse_backend(&backend)?;
        }

        if let Some(path) = lookup("PROVISIO_STATE_PATH") {
            debug!("Overriding state.path from environment");
            manifest.state.path = Some(path);
        }

        if let Some(bucket) = lookup("PROVISIO_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            manifest.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("PROVISIO_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            manifest.state.prefix = Some(prefix);
        }

        if let Some(region) = lookup("PROVISIO_STATE_REGION") {
            debug!("Overriding state.region from environment");
            manifest.state.region = Some(region);
        }

        if let Some(parallelism) = lookup("PROVISIO_PARALLELISM") {
            debug!("Overriding execution.parallelism from environment");
            manifest.execution.parallelism = parallelism.parse().map_err(|_| {
                ProvisioError::Config(ConfigError::validation(
                    format!("PROVISIO_PARALLELISM must be a positive integer, got '{parallelism}'"),
                    "execution.parallelism",
                ))
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ProvisioError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn parse_backend(value: &str) -> Result<StateBackendKind> {
    match value.to_ascii_lowercase().as_str() {
        "local" => Ok(StateBackendKind::Local),
        "s3" => Ok(StateBackendKind::S3),
        "memory" => Ok(StateBackendKind::Memory),
        other => Err(ProvisioError::Config(ConfigError::validation(
            format!("Unknown state backend '{other}' (expected local, s3 or memory)"),
            "state.backend",
        ))),
    }
}

/// Default manifest file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["provisio.yaml", "provisio.yml"];

/// Finds the manifest in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no manifest is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ProvisioError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
