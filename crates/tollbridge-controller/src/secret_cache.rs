//! Remembers which bind secret version last passed a connection probe for
//! each upstream, so unchanged upstreams are not re-probed every pass.

use std::collections::HashMap;
use std::sync::Mutex;

/// Upstream name to validated secret resource version.
#[derive(Debug, Default)]
pub struct SecretVersionCache {
    versions: Mutex<HashMap<String, String>>,
}

impl SecretVersionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the cache, replacing its contents.
    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            versions: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    #[must_use]
    pub fn get(&self, upstream: &str) -> Option<String> {
        self.lock().get(upstream).cloned()
    }

    /// Whether `version` is the version last validated for `upstream`.
    #[must_use]
    pub fn is_validated(&self, upstream: &str, version: &str) -> bool {
        self.lock().get(upstream).is_some_and(|v| v == version)
    }

    /// Replaces the whole cache with the versions validated in one pass.
    /// Upstreams missing from `validated` are dropped.
    pub fn replace(&self, validated: HashMap<String, String>) {
        *self.lock() = validated;
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a valid map.
        self.versions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
