//! The provider plugin interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::Attributes;
use crate::error::ProviderResult;
use crate::graph::ResourceAddress;

/// Static information about a resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Attributes that cannot be changed in place; changing one forces replacement.
    pub force_new: BTreeSet<String>,
}

impl ResourceSchema {
    /// Creates a schema with the given immutable attributes.
    #[must_use]
    pub fn with_force_new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            force_new: attributes.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if changing `attribute` requires replacement.
    #[must_use]
    pub fn requires_replace(&self, attribute: &str) -> bool {
        self.force_new.contains(attribute)
    }
}

/// Input to a create or update call.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Address of the instance being changed.
    pub address: ResourceAddress,
    /// Resource type.
    pub resource_type: String,
    /// Fully resolved desired attributes.
    pub attributes: Attributes,
}

/// What a provider returns after create or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider-assigned identifier.
    pub id: String,
    /// Computed values only known after apply.
    pub outputs: Attributes,
}

/// The current remote view of a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Attributes as they exist remotely.
    pub attributes: Attributes,
    /// Computed values.
    pub outputs: Attributes,
}

/// A provider plugin: create, read, update and delete for its resource types.
///
/// Implementations must be safe to call concurrently for different resources.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name used in manifests.
    fn name(&self) -> &str;

    /// Returns the schema for a resource type, or `None` if unsupported.
    fn schema(&self, resource_type: &str) -> Option<ResourceSchema>;

    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse>;

    /// Reads a resource. Returns `None` if the remote object no longer exists.
    async fn read(
        &self,
        resource_type: &str,
        id: &str,
        prior: &Attributes,
    ) -> ProviderResult<Option<ObservedResource>>;

    /// Updates a resource in place.
    async fn update(
        &self,
        request: &ResourceRequest,
        id: &str,
        prior: &Attributes,
    ) -> ProviderResult<ProviderResponse>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, id: &str, prior: &Attributes) -> ProviderResult<()>;
}
