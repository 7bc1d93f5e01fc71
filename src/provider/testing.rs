//! In-memory provider for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{ObservedResource, Provider, ProviderResponse, ResourceRequest, ResourceSchema};
use crate::config::Attributes;
use crate::error::{ProviderError, ProviderResult};

/// A provider named `test` that keeps objects in memory.
///
/// Failures can be injected per address and operation; every call is recorded.
#[derive(Debug, Default)]
pub struct TestProvider {
    force_new: Vec<String>,
    delay: Option<Duration>,
    objects: Mutex<BTreeMap<String, Attributes>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<(String, String), Failure>>,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Debug, Clone)]
enum Failure {
    Always,
    Transient(u32),
}

impl TestProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force_new(mut self, attribute: &str) -> Self {
        self.force_new.push(attribute.to_string());
        self
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every `operation` on `address` fail.
    pub fn fail(&self, operation: &str, address: &str) {
        self.lock_failures()
            .insert((operation.to_string(), address.to_string()), Failure::Always);
    }

    /// Makes the next `times` calls of `operation` on `address` fail with a retryable error.
    pub fn fail_transient(&self, operation: &str, address: &str, times: u32) {
        self.lock_failures()
            .insert((operation.to_string(), address.to_string()), Failure::Transient(times));
    }

    /// Returns calls as `"<operation> <address-or-id>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn objects(&self) -> BTreeMap<String, Attributes> {
        self.objects.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Removes an object behind the engine's back.
    pub fn forget(&self, id: &str) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(id);
        }
    }

    /// Changes an object's attribute behind the engine's back.
    pub fn tamper(&self, id: &str, key: &str, value: Value) {
        if let Ok(mut objects) = self.objects.lock() {
            if let Some(attrs) = objects.get_mut(id) {
                attrs.insert(key.to_string(), value);
            }
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Failure>> {
        self.failures.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn enter(&self, operation: &str, key: &str, resource_type: &str) -> ProviderResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{operation} {key}"));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut failures = self.lock_failures();
        let slot = (operation.to_string(), key.to_string());
        match failures.get_mut(&slot) {
            Some(Failure::Always) => Err(ProviderError::failed(operation, resource_type, "injected failure")),
            Some(Failure::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProviderError::transient(operation, resource_type, "throttled"))
            }
            _ => Ok(()),
        }
    }

    fn outputs(id: &str) -> Attributes {
        Attributes::from([
            (String::from("id"), Value::String(id.to_string())),
            (String::from("ip"), Value::String(format!("10.0.0.{}", id.len()))),
        ])
    }
}

#[async_trait]
impl Provider for TestProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn schema(&self, _resource_type: &str) -> Option<ResourceSchema> {
        Some(ResourceSchema::with_force_new(self.force_new.iter().cloned()))
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        self.enter("create", &request.address.to_string(), &request.resource_type)
            .await?;

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{n}", request.address.name());
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(id.clone(), request.attributes.clone());
        }

        Ok(ProviderResponse {
            outputs: Self::outputs(&id),
            id,
        })
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
        _prior: &Attributes,
    ) -> ProviderResult<Option<ObservedResource>> {
        self.enter("read", id, resource_type).await?;

        let found = self.objects.lock().ok().and_then(|o| o.get(id).cloned());
        Ok(found.map(|attributes| ObservedResource {
            id: id.to_string(),
            attributes,
            outputs: Self::outputs(id),
        }))
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        id: &str,
        _prior: &Attributes,
    ) -> ProviderResult<ProviderResponse> {
        self.enter("update", &request.address.to_string(), &request.resource_type)
            .await?;

        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(id.to_string(), request.attributes.clone());
        }

        Ok(ProviderResponse {
            id: id.to_string(),
            outputs: Self::outputs(id),
        })
    }

    async fn delete(&self, resource_type: &str, id: &str, _prior: &Attributes) -> ProviderResult<()> {
        self.enter("delete", id, resource_type).await?;

        let removed = self.objects.lock().ok().and_then(|mut o| o.remove(id));
        if removed.is_none() {
            return Err(ProviderError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
