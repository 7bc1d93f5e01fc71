//! State management module for the provisio engine.
//!
//! This module persists the last-applied attributes and provider identifier
//! of every resource, keyed by address, along with the run history.

mod backend;
mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use backend::StateBackend;
pub use local::{LocalStateBackend, STATE_DIR};
pub use lock::{LockInfo, LOCK_EXPIRY_SECS, LOCK_RENEW_INTERVAL_SECS, generate_holder_id};
pub use memory::MemoryStateBackend;
pub use s3::S3StateBackend;
pub use store::StateStore;
pub use types::{HistoryEntry, HistoryOperation, MAX_HISTORY, STATE_VERSION, StateRecord, StateSnapshot};

use std::path::Path;
use std::sync::Arc;

use crate::config::{StateBackendKind, StateConfig};
use crate::error::{ConfigError, ProvisioError, Result};

/// Creates the backend described by the manifest's `state` section.
///
/// A relative local `path` is resolved against `base_dir` (the manifest's
/// directory).
///
/// # Errors
///
/// Returns an error if the S3 backend has no bucket or cannot be initialized.
pub async fn backend_from_config(config: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateBackend>> {
    match config.backend {
        StateBackendKind::Local => {
            let dir = config
                .path
                .as_deref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            Ok(Arc::new(LocalStateBackend::with_base_dir(dir)))
        }
        StateBackendKind::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                ProvisioError::Config(ConfigError::validation(
                    "S3 bucket name is required when using S3 backend",
                    "state.bucket",
                ))
            })?;
            let backend = S3StateBackend::new(bucket, config.prefix.as_deref(), config.region.as_deref()).await?;
            Ok(Arc::new(backend))
        }
        StateBackendKind::Memory => Ok(Arc::new(MemoryStateBackend::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_backend_from_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = StateConfig {
            path: Some(String::from("custom")),
            ..StateConfig::default()
        };

        let backend = backend_from_config(&config, temp.path()).await.unwrap();
        assert_eq!(backend.backend_type(), "local");
        assert!(backend.location().ends_with("state.json"));
        assert!(backend.location().contains("custom"));
    }

    #[tokio::test]
    async fn test_s3_requires_bucket() {
        let config = StateConfig {
            backend: StateBackendKind::S3,
            ..StateConfig::default()
        };
        assert!(backend_from_config(&config, Path::new(".")).await.is_err());
    }
}
