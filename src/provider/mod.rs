//! Provider plugins.
//!
//! A provider implements create, read, update and delete for a family of
//! resource types. The engine dispatches each resource to the provider named
//! by its `provider` field (or its type prefix) through the
//! [`ProviderRegistry`].

mod local;
mod null;
mod registry;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use local::LocalProvider;
pub use null::NullProvider;
pub use registry::ProviderRegistry;
pub use traits::{ObservedResource, Provider, ProviderResponse, ResourceRequest, ResourceSchema};
