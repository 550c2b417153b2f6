//! Upstream identity provider registry.
//!
//! The registry holds one list per provider kind. Controllers replace a whole
//! list at the end of each reconciliation pass; login handlers read a snapshot
//! once per request and work on it until the request completes.
//!
//! Lists sit behind an [`ArcSwap`], so reads never block and never observe a
//! partially written list.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(UpstreamRegistry::new());
//!
//! // controller side
//! registry.set_ldap_providers(vec![Arc::new(provider) as Arc<dyn UpstreamLdapIdentityProvider>]);
//!
//! // request side
//! let providers = registry.ldap_providers();
//! for p in providers.iter() { /* ... */ }
//! ```

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::ldap::{DirectoryKind, UpstreamLdapIdentityProvider};
use super::oidc::UpstreamOidcIdentityProvider;

/// Snapshot of the OIDC upstreams.
pub type OidcProviders = Arc<[Arc<dyn UpstreamOidcIdentityProvider>]>;

/// Snapshot of LDAP or Active Directory upstreams.
pub type DirectoryProviders = Arc<[Arc<dyn UpstreamLdapIdentityProvider>]>;

/// Thread-safe store of the currently configured upstream providers.
pub struct UpstreamRegistry {
    oidc: ArcSwap<Vec<Arc<dyn UpstreamOidcIdentityProvider>>>,
    ldap: ArcSwap<Vec<Arc<dyn UpstreamLdapIdentityProvider>>>,
    active_directory: ArcSwap<Vec<Arc<dyn UpstreamLdapIdentityProvider>>>,
}

impl Default for UpstreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UpstreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRegistry")
            .field("oidc", &self.oidc.load().len())
            .field("ldap", &self.ldap.load().len())
            .field("active_directory", &self.active_directory.load().len())
            .finish()
    }
}

impl UpstreamRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            oidc: ArcSwap::from_pointee(Vec::new()),
            ldap: ArcSwap::from_pointee(Vec::new()),
            active_directory: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replaces all OIDC upstreams.
    pub fn set_oidc_providers(&self, providers: Vec<Arc<dyn UpstreamOidcIdentityProvider>>) {
        tracing::debug!(count = providers.len(), "Updated OIDC upstream providers");
        self.oidc.store(Arc::new(providers));
    }

    /// Returns the current OIDC upstreams.
    #[must_use]
    pub fn oidc_providers(&self) -> OidcProviders {
        self.oidc.load().as_slice().into()
    }

    /// Replaces all LDAP upstreams.
    pub fn set_ldap_providers(&self, providers: Vec<Arc<dyn UpstreamLdapIdentityProvider>>) {
        tracing::debug!(count = providers.len(), "Updated LDAP upstream providers");
        self.ldap.store(Arc::new(providers));
    }

    /// Returns the current LDAP upstreams.
    #[must_use]
    pub fn ldap_providers(&self) -> DirectoryProviders {
        self.ldap.load().as_slice().into()
    }

    /// Replaces all Active Directory upstreams.
    pub fn set_active_directory_providers(
        &self,
        providers: Vec<Arc<dyn UpstreamLdapIdentityProvider>>,
    ) {
        tracing::debug!(
            count = providers.len(),
            "Updated Active Directory upstream providers"
        );
        self.active_directory.store(Arc::new(providers));
    }

    /// Returns the current Active Directory upstreams.
    #[must_use]
    pub fn active_directory_providers(&self) -> DirectoryProviders {
        self.active_directory.load().as_slice().into()
    }

    /// Replaces the upstreams of one directory kind.
    pub fn set_directory_providers(
        &self,
        kind: DirectoryKind,
        providers: Vec<Arc<dyn UpstreamLdapIdentityProvider>>,
    ) {
        match kind {
            DirectoryKind::Ldap => self.set_ldap_providers(providers),
            DirectoryKind::ActiveDirectory => self.set_active_directory_providers(providers),
        }
    }

    /// Returns the current upstreams of one directory kind.
    #[must_use]
    pub fn directory_providers(&self, kind: DirectoryKind) -> DirectoryProviders {
        match kind {
            DirectoryKind::Ldap => self.ldap_providers(),
            DirectoryKind::ActiveDirectory => self.active_directory_providers(),
        }
    }

    /// Looks up an OIDC upstream by name in the current snapshot.
    #[must_use]
    pub fn find_oidc_provider(&self, name: &str) -> Option<Arc<dyn UpstreamOidcIdentityProvider>> {
        self.oidc.load().iter().find(|p| p.name() == name).cloned()
    }

    /// Looks up an LDAP upstream by name in the current snapshot.
    #[must_use]
    pub fn find_ldap_provider(&self, name: &str) -> Option<Arc<dyn UpstreamLdapIdentityProvider>> {
        self.ldap.load().iter().find(|p| p.name() == name).cloned()
    }

    /// Looks up an Active Directory upstream by name in the current snapshot.
    #[must_use]
    pub fn find_active_directory_provider(
        &self,
        name: &str,
    ) -> Option<Arc<dyn UpstreamLdapIdentityProvider>> {
        self.active_directory
            .load()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::ldap::{
        AuthenticateResponse, LdapError, StoredRefreshAttributes, UpstreamLdapIdentityProvider,
    };
    use async_trait::async_trait;

    struct NamedDirectory(&'static str);

    #[async_trait]
    impl UpstreamLdapIdentityProvider for NamedDirectory {
        fn name(&self) -> &str {
            self.0
        }

        fn resource_uid(&self) -> &str {
            "uid"
        }

        fn url(&self) -> String {
            format!("ldaps://{}", self.0)
        }

        async fn authenticate_user(
            &self,
            _username: &str,
            _password: &str,
        ) -> Result<Option<AuthenticateResponse>, LdapError> {
            Ok(None)
        }

        async fn perform_refresh(&self, _stored: &StoredRefreshAttributes) -> Result<(), LdapError> {
            Ok(())
        }
    }

    fn directories(names: &[&'static str]) -> Vec<Arc<dyn UpstreamLdapIdentityProvider>> {
        names
            .iter()
            .map(|n| Arc::new(NamedDirectory(n)) as Arc<dyn UpstreamLdapIdentityProvider>)
            .collect()
    }

    #[test]
    fn test_starts_empty() {
        let registry = UpstreamRegistry::new();
        assert!(registry.oidc_providers().is_empty());
        assert!(registry.ldap_providers().is_empty());
        assert!(registry.active_directory_providers().is_empty());
    }

    #[test]
    fn test_set_replaces_whole_list() {
        let registry = UpstreamRegistry::new();
        registry.set_ldap_providers(directories(&["a", "b"]));
        let before = registry.ldap_providers();

        registry.set_ldap_providers(directories(&["c"]));
        let after = registry.ldap_providers();

        // Snapshots taken earlier are unaffected.
        assert_eq!(before.len(), 2);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].name(), "c");
        assert!(registry.find_ldap_provider("a").is_none());
        assert!(registry.find_ldap_provider("c").is_some());
    }

    #[test]
    fn test_kinds_are_independent() {
        let registry = UpstreamRegistry::new();
        registry.set_directory_providers(DirectoryKind::ActiveDirectory, directories(&["ad"]));
        assert!(registry.ldap_providers().is_empty());
        assert_eq!(registry.directory_providers(DirectoryKind::ActiveDirectory).len(), 1);
        assert!(registry.find_active_directory_provider("ad").is_some());
        assert!(registry.find_ldap_provider("ad").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_complete_lists() {
        let registry = Arc::new(UpstreamRegistry::new());
        registry.set_ldap_providers(directories(&["a", "b", "c"]));

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let list = if i % 2 == 0 {
                        directories(&["x"])
                    } else {
                        directories(&["a", "b", "c"])
                    };
                    registry.set_ldap_providers(list);
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let len = registry.ldap_providers().len();
                        assert!(len == 1 || len == 3, "observed partial list of {len}");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
