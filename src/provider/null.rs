//! The `null` provider.
//!
//! Manages resources that have no backing object. Any resource type is
//! accepted; the object exists only in state. Changing `triggers` forces
//! replacement, every other attribute updates in place.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::traits::{ObservedResource, Provider, ProviderResponse, ResourceRequest, ResourceSchema};
use crate::config::Attributes;
use crate::error::ProviderResult;

/// Provider for resources without a remote object.
#[derive(Debug, Default)]
pub struct NullProvider;

impl NullProvider {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn outputs(id: &str, request: &ResourceRequest) -> Attributes {
        let mut outputs = Attributes::new();
        outputs.insert(String::from("id"), Value::String(id.to_string()));
        outputs.insert(String::from("name"), Value::String(request.address.name().to_string()));
        outputs
    }
}

#[async_trait]
impl Provider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    fn schema(&self, _resource_type: &str) -> Option<ResourceSchema> {
        Some(ResourceSchema::with_force_new(["triggers"]))
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        let id = Uuid::new_v4().to_string();
        debug!("null: created {} as {}", request.address, id);

        Ok(ProviderResponse {
            outputs: Self::outputs(&id, request),
            id,
        })
    }

    async fn read(
        &self,
        _resource_type: &str,
        id: &str,
        prior: &Attributes,
    ) -> ProviderResult<Option<ObservedResource>> {
        Ok(Some(ObservedResource {
            id: id.to_string(),
            attributes: prior.clone(),
            outputs: Attributes::new(),
        }))
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        id: &str,
        _prior: &Attributes,
    ) -> ProviderResult<ProviderResponse> {
        debug!("null: updated {}", request.address);

        Ok(ProviderResponse {
            id: id.to_string(),
            outputs: Self::outputs(id, request),
        })
    }

    async fn delete(&self, _resource_type: &str, id: &str, _prior: &Attributes) -> ProviderResult<()> {
        debug!("null: deleted {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceAddress;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_assigns_unique_ids() {
        let provider = NullProvider::new();
        let request = ResourceRequest {
            address: ResourceAddress::new("null_resource", "a"),
            resource_type: String::from("null_resource"),
            attributes: Attributes::from([(String::from("x"), json!(1))]),
        };

        let first = provider.create(&request).await.unwrap();
        let second = provider.create(&request).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.outputs["id"], json!(first.id));

        let observed = provider
            .read("null_resource", &first.id, &request.attributes)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.attributes, request.attributes);
    }

    #[test]
    fn test_triggers_force_replacement() {
        let schema = NullProvider::new().schema("anything").unwrap();
        assert!(schema.requires_replace("triggers"));
        assert!(!schema.requires_replace("x"));
    }
}
