//! S3-based state backend.
//!
//! Remote state for teams: the snapshot is one JSON object and the lock is a
//! sibling object under the same prefix. A `PutObject` replaces the whole
//! object, so readers never observe a partial snapshot.
//!
//! The lock object is only ever written with a conditional `PutObject`:
//! `If-None-Match: *` to create it, `If-Match: <etag>` to take over an
//! expired lock or renew our own. S3 rejects the loser of a race with
//! `412 Precondition Failed`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info};

use crate::error::{ProvisioError, Result, StateError};

use super::backend::StateBackend;
use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::types::StateSnapshot;

/// State object key suffix.
const STATE_KEY: &str = "state.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state backend.
#[derive(Debug)]
pub struct S3StateBackend {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

/// Precondition for a lock write.
#[derive(Debug, Clone, Copy)]
enum LockWrite<'a> {
    /// The lock object must not exist.
    Create,
    /// The lock object must still carry this `ETag`.
    Replace(&'a str),
}

fn is_precondition_failure(err: &impl ProvideErrorMetadata) -> bool {
    matches!(err.code(), Some("PreconditionFailed" | "ConditionalRequestConflict"))
}

fn locked_by(existing: &LockInfo) -> ProvisioError {
    ProvisioError::State(StateError::LockedByOther {
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
    })
}

fn lock_json(lock_info: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock_info).map_err(|e| {
        ProvisioError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
    })
}

fn corrupted(what: &str, e: impl std::fmt::Display) -> ProvisioError {
    ProvisioError::State(StateError::Corrupted {
        message: format!("Failed to parse {what}: {e}"),
    })
}

impl S3StateBackend {
    /// Creates a new S3 backend using the AWS default credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 backend with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_object_tagged(key).await?.map(|(content, _)| content))
    }

    /// Reads an object along with its `ETag`.
    async fn get_object_tagged(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    ProvisioError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ProvisioError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ProvisioError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ProvisioError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Reads the lock object and its `ETag`.
    async fn get_lock_tagged(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some((content, etag)) = self.get_object_tagged(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock_info = serde_json::from_str(&content).map_err(|e| corrupted("lock", e))?;
        Ok(Some((lock_info, etag)))
    }

    /// Writes the lock object under a precondition.
    ///
    /// Returns `false` if S3 rejected the precondition.
    async fn put_lock(&self, lock_info: &LockInfo, write: LockWrite<'_>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(LOCK_KEY))
            .body(lock_json(lock_info)?.into_bytes().into())
            .content_type("application/json");

        let request = match write {
            LockWrite::Create => request.if_none_match("*"),
            LockWrite::Replace(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if is_precondition_failure(&e) => {
                debug!("Lock write {write:?} lost a race");
                Ok(false)
            }
            Err(e) => Err(ProvisioError::State(StateError::LockFailed {
                message: format!("S3 put error: {e}"),
            })),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ProvisioError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }
}

#[async_trait]
impl StateBackend for S3StateBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let snapshot: StateSnapshot = serde_json::from_str(&json).map_err(|e| corrupted("state", e))?;
        info!(
            "Loaded state {} (serial {}) from S3",
            snapshot.lineage, snapshot.serial
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state serial {} to s3://{}/{key}", snapshot.serial, self.bucket);

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            ProvisioError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })?;

        self.put_object(&key, content).await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(ProvisioError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder);

        let acquired = if self.put_lock(&lock_info, LockWrite::Create).await? {
            true
        } else {
            match self.get_lock_tagged().await? {
                Some((existing, _)) if !existing.is_expired() => return Err(locked_by(&existing)),
                Some((existing, Some(etag))) => {
                    debug!("Expired lock {} found, taking over", existing.lock_id);
                    self.put_lock(&lock_info, LockWrite::Replace(&etag)).await?
                }
                Some((_, None)) => false,
                // released in between
                None => self.put_lock(&lock_info, LockWrite::Create).await?,
            }
        };

        if !acquired {
            let holder = self.get_lock_info().await?;
            return Err(holder.filter(|l| !l.is_expired()).map_or_else(
                || {
                    ProvisioError::State(StateError::LockFailed {
                        message: String::from("lock object changed during acquisition"),
                    })
                },
                |l| locked_by(&l),
            ));
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let lost = || {
            ProvisioError::State(StateError::LockLost {
                lock_id: lock_id.to_string(),
            })
        };

        let Some((current, Some(etag))) = self.get_lock_tagged().await? else {
            return Err(lost());
        };
        if current.lock_id != lock_id {
            return Err(lost());
        }

        let renewed = current.renewed();
        if !self.put_lock(&renewed, LockWrite::Replace(&etag)).await? {
            return Err(lost());
        }

        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at.to_rfc3339());
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.get_lock_tagged().await?.map(|(lock_info, _)| lock_info))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("web/prod/")), "web/prod/");
        assert_eq!(normalize_prefix(Some("/web")), "web/");
    }

    #[test]
    fn test_precondition_failure_codes() {
        use aws_sdk_s3::error::ErrorMetadata;

        let rejected = ErrorMetadata::builder().code("PreconditionFailed").build();
        assert!(is_precondition_failure(&rejected));

        let conflict = ErrorMetadata::builder().code("ConditionalRequestConflict").build();
        assert!(is_precondition_failure(&conflict));

        let denied = ErrorMetadata::builder().code("AccessDenied").build();
        assert!(!is_precondition_failure(&denied));
    }
}
