//! Resource and secret stores read by the watcher.
//!
//! The watcher only depends on the two traits. [`InMemoryStore`] backs both
//! for the supervisor, which loads resources from its configuration file, and
//! for tests. Every write that changes state bumps a change counter that
//! runners observe through [`InMemoryStore::subscribe`].

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tollbridge_auth::federation::DirectoryKind;

use crate::error::StoreError;
use crate::resources::{DirectoryIdentityProvider, DirectoryProviderStatus, Secret};

/// Read access to directory upstream resources plus status writes.
#[async_trait]
pub trait DirectoryProviderStore: Send + Sync {
    /// Lists every resource of one kind, ordered by namespace then name.
    async fn list(&self, kind: DirectoryKind) -> Result<Vec<DirectoryIdentityProvider>, StoreError>;

    /// Replaces the status of one resource.
    async fn update_status(
        &self,
        kind: DirectoryKind,
        namespace: &str,
        name: &str,
        status: DirectoryProviderStatus,
    ) -> Result<(), StoreError>;
}

/// Read access to secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;
}

type ResourceKey = (DirectoryKind, String, String);
type SecretKey = (String, String);

/// Concurrent in-memory store for resources and secrets.
#[derive(Debug)]
pub struct InMemoryStore {
    providers: DashMap<ResourceKey, DirectoryIdentityProvider>,
    secrets: DashMap<SecretKey, Secret>,
    version: AtomicU64,
    status_writes: AtomicU64,
    changes: watch::Sender<u64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            secrets: DashMap::new(),
            version: AtomicU64::new(0),
            status_writes: AtomicU64::new(0),
            changes: watch::channel(0).0,
        }
    }

    /// Receiver that observes every resource or secret change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    /// Number of status writes performed so far.
    #[must_use]
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::Relaxed)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Creates or replaces a resource.
    ///
    /// A changed spec bumps the generation. An empty resource version is
    /// filled in with a store-assigned one.
    pub fn apply_provider(&self, kind: DirectoryKind, mut provider: DirectoryIdentityProvider) {
        let key = (
            kind,
            provider.metadata.namespace.clone(),
            provider.metadata.name.clone(),
        );
        if let Some(existing) = self.providers.get(&key) {
            if existing.spec == provider.spec && provider.metadata.generation == 0 {
                provider.metadata.generation = existing.metadata.generation;
            } else if provider.metadata.generation == 0 {
                provider.metadata.generation = existing.metadata.generation + 1;
            }
            if provider.status == DirectoryProviderStatus::default() {
                provider.status = existing.status.clone();
            }
        } else if provider.metadata.generation == 0 {
            provider.metadata.generation = 1;
        }
        if provider.metadata.resource_version.is_empty() {
            provider.metadata.resource_version = self.next_version();
        }

        tracing::debug!(
            kind = %kind,
            namespace = %provider.metadata.namespace,
            name = %provider.metadata.name,
            generation = provider.metadata.generation,
            "Applied directory upstream resource"
        );
        self.providers.insert(key, provider);
        self.notify_changed();
    }

    /// Removes a resource. Returns whether it existed.
    pub fn delete_provider(&self, kind: DirectoryKind, namespace: &str, name: &str) -> bool {
        let removed = self
            .providers
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            self.notify_changed();
        }
        removed
    }

    /// Fetches one resource.
    #[must_use]
    pub fn get_provider(
        &self,
        kind: DirectoryKind,
        namespace: &str,
        name: &str,
    ) -> Option<DirectoryIdentityProvider> {
        self.providers
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|p| p.clone())
    }

    /// Creates or replaces a secret. An empty resource version is filled in.
    pub fn apply_secret(&self, mut secret: Secret) {
        if secret.metadata.resource_version.is_empty() {
            secret.metadata.resource_version = self.next_version();
        }
        let key = (
            secret.metadata.namespace.clone(),
            secret.metadata.name.clone(),
        );
        self.secrets.insert(key, secret);
        self.notify_changed();
    }

    /// Removes a secret. Returns whether it existed.
    pub fn delete_secret(&self, namespace: &str, name: &str) -> bool {
        let removed = self
            .secrets
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            self.notify_changed();
        }
        removed
    }
}

#[async_trait]
impl DirectoryProviderStore for InMemoryStore {
    async fn list(&self, kind: DirectoryKind) -> Result<Vec<DirectoryIdentityProvider>, StoreError> {
        let mut providers: Vec<_> = self
            .providers
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.value().clone())
            .collect();
        providers.sort_by(|a, b| {
            (&a.metadata.namespace, &a.metadata.name).cmp(&(&b.metadata.namespace, &b.metadata.name))
        });
        Ok(providers)
    }

    async fn update_status(
        &self,
        kind: DirectoryKind,
        namespace: &str,
        name: &str,
        status: DirectoryProviderStatus,
    ) -> Result<(), StoreError> {
        let key = (kind, namespace.to_string(), name.to_string());
        let mut entry = self.providers.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: kind.resource_kind(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
        entry.status = status;
        entry.metadata.resource_version = self.next_version();
        self.status_writes.fetch_add(1, Ordering::Relaxed);
        // Status writes do not notify: they are the watcher's own output.
        Ok(())
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .map(|s| s.clone()))
    }
}
