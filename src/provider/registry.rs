//! Provider registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::local::LocalProvider;
use super::null::NullProvider;
use super::traits::{Provider, ResourceSchema};
use crate::error::ConfigError;
use crate::graph::ResourceAddress;

/// Providers keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in `null` and `local` providers.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NullProvider::new()));
        registry.register(Arc::new(LocalProvider::new()));
        registry
    }

    /// Like [`Self::with_builtin`], with `local_file` paths relative to `base_dir`.
    #[must_use]
    pub fn with_builtin_in(base_dir: &Path) -> Self {
        let mut registry = Self::with_builtin();
        registry.register(Arc::new(LocalProvider::with_base_dir(base_dir)));
        registry
    }

    /// Registers a provider, replacing any provider with the same name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        debug!("Registering provider: {}", provider.name());
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Looks up a provider by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Returns the registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolves the provider and schema for a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is not registered or does not
    /// support the resource type.
    pub fn resolve(
        &self,
        provider: &str,
        address: &ResourceAddress,
    ) -> Result<(Arc<dyn Provider>, ResourceSchema), ConfigError> {
        let plugin = self.get(provider).ok_or_else(|| ConfigError::UnknownProvider {
            provider: provider.to_string(),
            address: address.to_string(),
        })?;

        let schema = plugin
            .schema(address.resource_type())
            .ok_or_else(|| ConfigError::UnsupportedResourceType {
                provider: provider.to_string(),
                resource_type: address.resource_type().to_string(),
            })?;

        Ok((plugin, schema))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_providers() {
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["local", "null"]);
    }

    #[test]
    fn test_resolve_errors() {
        let registry = ProviderRegistry::with_builtin();

        let addr = ResourceAddress::new("aws_instance", "web");
        let err = registry.resolve("aws", &addr).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));

        let addr = ResourceAddress::new("local_directory", "d");
        let err = registry.resolve("local", &addr).err().unwrap();
        assert!(matches!(err, ConfigError::UnsupportedResourceType { .. }));

        let addr = ResourceAddress::new("local_file", "f");
        let (_, schema) = registry.resolve("local", &addr).unwrap();
        assert!(schema.requires_replace("filename"));
    }
}
