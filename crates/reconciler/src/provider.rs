//! External system clients and the registry that names them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use converge_core::ResourceKey;
use tracing::debug;

use crate::error::{Error, FetchError, Result};
use crate::resource::{DataRef, SecretData, SyncedResource};

/// What a resource asks its provider for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub resource: ResourceKey,
    pub refs: Vec<DataRef>,
}

impl FetchRequest {
    /// Build the request for `resource`'s data references.
    #[must_use]
    pub fn for_resource(resource: &SyncedResource) -> Self {
        Self {
            resource: resource.key(),
            refs: resource.spec.data.clone(),
        }
    }
}

/// A connection to one external system.
///
/// `commit` and `rollback` exist for providers that create external state
/// while fetching, such as generated credentials. Both must be idempotent.
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Fetch the referenced values, keyed by effective target key.
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<SecretData, FetchError>;

    /// Finalize external state created by the last fetch.
    async fn commit(&self, _resource: &ResourceKey) -> std::result::Result<(), FetchError> {
        Ok(())
    }

    /// Undo external state created by the last fetch.
    async fn rollback(&self, _resource: &ResourceKey) -> std::result::Result<(), FetchError> {
        Ok(())
    }

    /// Release the connection.
    async fn close(&self) -> std::result::Result<(), FetchError> {
        Ok(())
    }
}

/// Creates clients for resources that name this provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open a client for `resource`.
    async fn client(
        &self,
        resource: &SyncedResource,
    ) -> std::result::Result<Arc<dyn ExternalClient>, FetchError>;
}

/// Providers by name. Built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Look up a provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProvider`] if `name` was never registered.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider {
                name: name.to_owned(),
            })
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Collects providers, rejecting duplicate names at [`build`](Self::build).
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<String, Arc<dyn Provider>>,
    duplicates: Vec<String>,
}

impl ProviderRegistryBuilder {
    /// Register `provider` under `name`.
    #[must_use]
    pub fn register(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        let name = name.into();
        if self.providers.contains_key(&name) {
            self.duplicates.push(name);
        } else {
            debug!(provider = %name, "provider registered");
            self.providers.insert(name, provider);
        }
        self
    }

    /// Finish the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateProvider`] naming the first name registered
    /// twice. The first registration is never silently replaced.
    pub fn build(self) -> Result<ProviderRegistry> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(Error::DuplicateProvider { name });
        }
        Ok(ProviderRegistry {
            providers: self.providers,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct StaticClient;

    #[async_trait]
    impl ExternalClient for StaticClient {
        async fn fetch(
            &self,
            request: &FetchRequest,
        ) -> std::result::Result<SecretData, FetchError> {
            Ok(request
                .refs
                .iter()
                .map(|r| (r.effective_target_key().to_owned(), b"value".to_vec()))
                .collect())
        }
    }

    struct StaticProvider;

    #[async_trait]
    impl Provider for StaticProvider {
        async fn client(
            &self,
            _resource: &SyncedResource,
        ) -> std::result::Result<Arc<dyn ExternalClient>, FetchError> {
            Ok(Arc::new(StaticClient))
        }
    }

    #[test]
    fn test_duplicate_registration_fails_build() {
        let result = ProviderRegistry::builder()
            .register("vault", Arc::new(StaticProvider))
            .register("aws", Arc::new(StaticProvider))
            .register("vault", Arc::new(StaticProvider))
            .build();

        assert!(matches!(result, Err(Error::DuplicateProvider { name }) if name == "vault"));
    }

    #[test]
    fn test_unknown_provider_is_permanent() {
        let registry = ProviderRegistry::builder()
            .register("vault", Arc::new(StaticProvider))
            .build()
            .unwrap();

        let err = registry.get("gcp").err().unwrap();
        assert_eq!(
            err.class(crate::error::AuthFailurePolicy::default()),
            crate::error::ErrorClass::Permanent
        );
        assert_eq!(registry.names(), vec!["vault"]);
    }

    #[tokio::test]
    async fn test_client_fetches_by_target_key() {
        let registry = ProviderRegistry::builder()
            .register("static", Arc::new(StaticProvider))
            .build()
            .unwrap();
        let mut resource = SyncedResource::default();
        resource.spec.data = vec![DataRef::new("", "db/password")];

        let client = registry
            .get("static")
            .unwrap()
            .client(&resource)
            .await
            .unwrap();
        let data = client
            .fetch(&FetchRequest::for_resource(&resource))
            .await
            .unwrap();

        assert_eq!(data.get("db/password"), Some(&b"value".to_vec()));
        assert!(client.commit(&resource.key()).await.is_ok());
    }
}
