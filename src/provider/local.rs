//! The `local` provider.
//!
//! Manages `local_file` resources: a file at `filename` holding `content`.
//! Files are written to a temporary sibling, synced and renamed into place.
//!
//! A relative `filename` is resolved against the provider's base directory
//! (the manifest's directory), not the process working directory. The
//! resolved path is the resource id.

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::traits::{ObservedResource, Provider, ProviderResponse, ResourceRequest, ResourceSchema};
use crate::config::Attributes;
use crate::error::{ProviderError, ProviderResult};

const LOCAL_FILE: &str = "local_file";

/// Provider for files on the local filesystem.
#[derive(Debug, Default)]
pub struct LocalProvider {
    /// Directory relative filenames are resolved against.
    base_dir: Option<PathBuf>,
}

impl LocalProvider {
    /// Creates the provider; relative filenames use the working directory.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_dir: None }
    }

    /// Creates the provider resolving relative filenames against `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn string_attr<'a>(attributes: &'a Attributes, key: &str) -> ProviderResult<Option<&'a str>> {
        match attributes.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(ProviderError::InvalidAttributes {
                resource_type: String::from(LOCAL_FILE),
                message: format!("'{key}' must be a string, got {other}"),
            }),
        }
    }

    fn desired(&self, request: &ResourceRequest) -> ProviderResult<(PathBuf, String)> {
        let filename = Self::string_attr(&request.attributes, "filename")?.ok_or_else(|| {
            ProviderError::InvalidAttributes {
                resource_type: String::from(LOCAL_FILE),
                message: String::from("'filename' is required"),
            }
        })?;
        let content = Self::string_attr(&request.attributes, "content")?.unwrap_or_default();

        Ok((self.resolve(filename), content.to_string()))
    }

    fn outputs(content: &str) -> Attributes {
        let mut outputs = Attributes::new();
        outputs.insert(
            String::from("content_sha256"),
            Value::String(hex::encode(Sha256::digest(content.as_bytes()))),
        );
        outputs.insert(String::from("size"), Value::from(content.len()));
        outputs
    }

    async fn write_atomic(path: &Path, content: &str) -> ProviderResult<()> {
        let failed = |op: &str, e: std::io::Error| {
            ProviderError::failed(op, LOCAL_FILE, format!("{}: {e}", path.display()))
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| failed("create", e))?;
        }

        let temp_path = path.with_extension("provisio-tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| failed("create", e))?;
        file.write_all(content.as_bytes()).await.map_err(|e| failed("write", e))?;
        file.sync_all().await.map_err(|e| failed("sync", e))?;
        fs::rename(&temp_path, path).await.map_err(|e| failed("rename", e))?;

        Ok(())
    }

    fn check_type(resource_type: &str) -> ProviderResult<()> {
        if resource_type == LOCAL_FILE {
            Ok(())
        } else {
            Err(ProviderError::InvalidAttributes {
                resource_type: resource_type.to_string(),
                message: String::from("the local provider only manages local_file"),
            })
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        (resource_type == LOCAL_FILE).then(|| ResourceSchema::with_force_new(["filename"]))
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        Self::check_type(&request.resource_type)?;
        let (path, content) = self.desired(request)?;

        Self::write_atomic(&path, &content).await?;
        info!("local: wrote {}", path.display());

        Ok(ProviderResponse {
            id: path.display().to_string(),
            outputs: Self::outputs(&content),
        })
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
        prior: &Attributes,
    ) -> ProviderResult<Option<ObservedResource>> {
        Self::check_type(resource_type)?;

        let content = match fs::read_to_string(self.resolve(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("local: {} is gone", id);
                return Ok(None);
            }
            Err(e) => return Err(ProviderError::failed("read", LOCAL_FILE, format!("{id}: {e}"))),
        };

        let mut attributes = prior.clone();
        attributes
            .entry(String::from("filename"))
            .or_insert_with(|| Value::String(id.to_string()));
        attributes.insert(String::from("content"), Value::String(content.clone()));

        Ok(Some(ObservedResource {
            id: id.to_string(),
            attributes,
            outputs: Self::outputs(&content),
        }))
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        id: &str,
        _prior: &Attributes,
    ) -> ProviderResult<ProviderResponse> {
        Self::check_type(&request.resource_type)?;
        let (_, content) = self.desired(request)?;

        Self::write_atomic(&self.resolve(id), &content).await?;
        info!("local: rewrote {}", id);

        Ok(ProviderResponse {
            id: id.to_string(),
            outputs: Self::outputs(&content),
        })
    }

    async fn delete(&self, resource_type: &str, id: &str, _prior: &Attributes) -> ProviderResult<()> {
        Self::check_type(resource_type)?;

        match fs::remove_file(self.resolve(id)).await {
            Ok(()) => {
                info!("local: removed {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProviderError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }),
            Err(e) => Err(ProviderError::failed("delete", LOCAL_FILE, format!("{id}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceAddress;
    use serde_json::json;
    use tempfile::TempDir;

    fn request(path: &Path, content: &str) -> ResourceRequest {
        ResourceRequest {
            address: ResourceAddress::new(LOCAL_FILE, "motd"),
            resource_type: String::from(LOCAL_FILE),
            attributes: Attributes::from([
                (String::from("filename"), json!(path.display().to_string())),
                (String::from("content"), json!(content)),
            ]),
        }
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("etc").join("motd");
        let provider = LocalProvider::new();

        let created = provider.create(&request(&path, "hello")).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert_eq!(created.outputs["size"], json!(5));

        let updated = provider
            .update(&request(&path, "hello world"), &created.id, &Attributes::new())
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");

        let observed = provider
            .read(LOCAL_FILE, &created.id, &Attributes::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.attributes["content"], json!("hello world"));

        provider.delete(LOCAL_FILE, &created.id, &Attributes::new()).await.unwrap();
        assert!(!path.exists());

        let gone = provider.read(LOCAL_FILE, &created.id, &Attributes::new()).await.unwrap();
        assert!(gone.is_none());

        let err = provider
            .delete(LOCAL_FILE, &created.id, &Attributes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_relative_filename_uses_base_dir() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::with_base_dir(temp.path());

        let created = provider
            .create(&request(Path::new("out/endpoints.txt"), "10.0.1.4"))
            .await
            .unwrap();

        let expected = temp.path().join("out").join("endpoints.txt");
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "10.0.1.4");
        assert_eq!(created.id, expected.display().to_string());

        let prior = Attributes::from([(String::from("filename"), json!("out/endpoints.txt"))]);
        let observed = provider.read(LOCAL_FILE, &created.id, &prior).await.unwrap().unwrap();
        assert_eq!(observed.attributes["filename"], json!("out/endpoints.txt"));
        assert_eq!(observed.attributes["content"], json!("10.0.1.4"));

        provider.delete(LOCAL_FILE, &created.id, &prior).await.unwrap();
        assert!(!expected.exists());
    }

    #[tokio::test]
    async fn test_absolute_filename_ignores_base_dir() {
        let temp = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let path = elsewhere.path().join("motd");

        let provider = LocalProvider::with_base_dir(temp.path());
        provider.create(&request(&path, "hi")).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");
        assert!(std::fs::read_dir(temp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_missing_filename() {
        let mut req = request(Path::new("x"), "");
        req.attributes.remove("filename");

        let err = LocalProvider::new().create(&req).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidAttributes { .. }));
    }

    #[test]
    fn test_schema() {
        let provider = LocalProvider::new();
        assert!(provider.schema("local_file").is_some());
        assert!(provider.schema("local_dir").is_none());
    }
}
