//! Directory upstream watcher.
//!
//! Each pass turns the current directory resources of one kind into
//! [`UpstreamLdapProvider`]s and publishes the complete list to the
//! [`UpstreamRegistry`] with a single call. Along the way every resource gets
//! its status conditions refreshed:
//!
//! | Condition               | Checks                                          |
//! |-------------------------|-------------------------------------------------|
//! | `BindSecretValid`       | the bind secret exists and is basic-auth        |
//! | `TLSConfigurationValid` | the CA bundle decodes to PEM certificates       |
//! | `LDAPConnectionValid`   | a dial and service-account bind succeed         |
//!
//! Resources with an invalid secret or TLS configuration are left out of the
//! registry. A failed connection probe is treated as a warning: the upstream
//! is still published, but the pass asks to be requeued.
//!
//! The probe is skipped when the resource's generation and its bind secret's
//! version both match what was last validated successfully.
//!
//! # Example
//!
//! ```ignore
//! let watcher = DirectoryUpstreamWatcher::new(
//!     DirectoryKind::Ldap,
//!     registry.clone(),
//!     store.clone(),
//!     store.clone(),
//!     Arc::new(Ldap3Dialer::default()),
//! );
//! watcher.sync().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use time::OffsetDateTime;
use tollbridge_auth::federation::{
    DirectoryKind, GroupSearchConfig, LdapDialer, LdapProviderConfig, UpstreamLdapIdentityProvider,
    UpstreamLdapProvider, UpstreamRegistry, UserSearchConfig, ca_certificates,
};

use crate::conditions::{
    Condition, REASON_INVALID_TLS_CONFIG, REASON_LDAP_CONNECTION_ERROR, REASON_SECRET_MISSING_KEYS,
    REASON_SECRET_NOT_FOUND, REASON_SECRET_WRONG_TYPE, TYPE_BIND_SECRET_VALID,
    TYPE_LDAP_CONNECTION_VALID, TYPE_TLS_CONFIGURATION_VALID, find_condition, merge_conditions,
    phase_for,
};
use crate::error::{ReconcileError, ReconcileResult};
use crate::resources::{
    DirectoryIdentityProvider, DirectoryProviderStatus, SECRET_PASSWORD_KEY,
    SECRET_TYPE_BASIC_AUTH, SECRET_USERNAME_KEY, Secret, TlsSpec,
};
use crate::runner::Reconciler;
use crate::secret_cache::SecretVersionCache;
use crate::store::{DirectoryProviderStore, SecretStore};

/// Source of "now" for condition timestamps.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Default upper bound for one connection probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(90);

/// Result of one reconciliation pass.
#[derive(Debug)]
pub struct PassOutcome {
    /// The providers published to the registry, in resource order.
    pub providers: Vec<Arc<UpstreamLdapProvider>>,
    /// Whether some resource failed validation or its probe.
    pub requeue: bool,
}

/// Reconciles directory upstream resources of one kind into the registry.
pub struct DirectoryUpstreamWatcher {
    kind: DirectoryKind,
    registry: Arc<UpstreamRegistry>,
    providers: Arc<dyn DirectoryProviderStore>,
    secrets: Arc<dyn SecretStore>,
    dialer: Arc<dyn LdapDialer>,
    cache: SecretVersionCache,
    probe_timeout: Duration,
    clock: Clock,
}

impl std::fmt::Debug for DirectoryUpstreamWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryUpstreamWatcher")
            .field("kind", &self.kind)
            .field("cache", &self.cache)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

/// Outcome of validating a single resource.
struct Validation {
    conditions: Vec<Condition>,
    provider: Option<UpstreamLdapProvider>,
    validated_version: Option<String>,
    requeue: bool,
}

/// Bind credentials read from a valid secret.
struct BindCredentials {
    username: String,
    password: String,
    version: String,
}

impl DirectoryUpstreamWatcher {
    #[must_use]
    pub fn new(
        kind: DirectoryKind,
        registry: Arc<UpstreamRegistry>,
        providers: Arc<dyn DirectoryProviderStore>,
        secrets: Arc<dyn SecretStore>,
        dialer: Arc<dyn LdapDialer>,
    ) -> Self {
        Self {
            kind,
            registry,
            providers,
            secrets,
            dialer,
            cache: SecretVersionCache::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }

    /// Sets the upper bound for one connection probe.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replaces the clock used for condition timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Seeds the validated secret version cache.
    #[must_use]
    pub fn with_secret_version_cache(mut self, cache: SecretVersionCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn kind(&self) -> DirectoryKind {
        self.kind
    }

    /// Upstream name to secret version, for upstreams whose connection was
    /// validated in the last pass.
    #[must_use]
    pub fn validated_secret_versions(&self) -> HashMap<String, String> {
        self.cache.snapshot()
    }

    /// Runs one pass: validates every resource, writes changed statuses and
    /// replaces the registry's list for this kind.
    pub async fn reconcile_pass(&self) -> ReconcileResult<PassOutcome> {
        let resources = self.providers.list(self.kind).await?;
        let now = (self.clock)();

        let mut published = Vec::with_capacity(resources.len());
        let mut validated = HashMap::new();
        let mut requeue = false;

        for resource in &resources {
            let validation = self.validate(resource).await?;
            requeue |= validation.requeue;

            if let Some(version) = validation.validated_version {
                validated.insert(resource.metadata.name.clone(), version);
            }
            if let Some(provider) = validation.provider {
                published.push(Arc::new(provider));
            }
            if let Err(err) = self.write_status(resource, validation.conditions, now).await {
                tracing::warn!(
                    kind = %self.kind,
                    namespace = %resource.metadata.namespace,
                    name = %resource.metadata.name,
                    error = %err,
                    "Failed to update directory upstream status"
                );
                requeue = true;
            }
        }

        self.cache.replace(validated);
        self.registry.set_directory_providers(
            self.kind,
            published
                .iter()
                .map(|p| p.clone() as Arc<dyn UpstreamLdapIdentityProvider>)
                .collect(),
        );

        tracing::info!(
            kind = %self.kind,
            resources = resources.len(),
            published = published.len(),
            requeue,
            "Reconciled directory upstreams"
        );

        Ok(PassOutcome {
            providers: published,
            requeue,
        })
    }

    async fn validate(&self, resource: &DirectoryIdentityProvider) -> ReconcileResult<Validation> {
        let (secret_condition, credentials) = self.validate_secret(resource).await?;
        let (tls_condition, ca_bundle) = validate_tls(resource.spec.tls.as_ref());

        let mut conditions = vec![secret_condition, tls_condition];
        let (Some(credentials), Some(ca_bundle)) = (credentials, ca_bundle) else {
            return Ok(Validation {
                conditions,
                provider: None,
                validated_version: None,
                requeue: true,
            });
        };

        let provider = UpstreamLdapProvider::new(self.provider_config(
            resource,
            &credentials,
            ca_bundle,
        ));

        let name = &resource.metadata.name;
        let generation = resource.metadata.generation;
        let prior = find_condition(&resource.status.conditions, TYPE_LDAP_CONNECTION_VALID)
            .filter(|c| {
                c.is_true()
                    && c.observed_generation == generation
                    && self.cache.is_validated(name, &credentials.version)
            });

        if let Some(prior) = prior {
            tracing::debug!(
                kind = %self.kind,
                upstream = %name,
                generation,
                secret_version = %credentials.version,
                "Connection already validated, skipping probe"
            );
            conditions.push(prior.clone());
            return Ok(Validation {
                conditions,
                provider: Some(provider),
                validated_version: Some(credentials.version),
                requeue: false,
            });
        }

        let host = &resource.spec.host;
        match provider.test_connection().await {
            Ok(()) => {
                tracing::debug!(kind = %self.kind, upstream = %name, host = %host, "Connection probe succeeded");
                conditions.push(Condition::success(
                    TYPE_LDAP_CONNECTION_VALID,
                    format!(
                        "successfully able to connect to \"{host}\" and bind as user \"{}\" [validated with Secret \"{}\" at version \"{}\"]",
                        credentials.username, resource.spec.bind.secret_name, credentials.version
                    ),
                ));
                Ok(Validation {
                    conditions,
                    provider: Some(provider),
                    validated_version: Some(credentials.version),
                    requeue: false,
                })
            }
            Err(err) => {
                tracing::warn!(
                    kind = %self.kind,
                    upstream = %name,
                    host = %host,
                    error = %err,
                    "Connection probe failed"
                );
                conditions.push(Condition::failure(
                    TYPE_LDAP_CONNECTION_VALID,
                    REASON_LDAP_CONNECTION_ERROR,
                    format!(
                        "could not successfully connect to \"{host}\" and bind as user \"{}\": {err}",
                        credentials.username
                    ),
                ));
                Ok(Validation {
                    conditions,
                    provider: Some(provider),
                    validated_version: None,
                    requeue: true,
                })
            }
        }
    }

    async fn validate_secret(
        &self,
        resource: &DirectoryIdentityProvider,
    ) -> ReconcileResult<(Condition, Option<BindCredentials>)> {
        let secret_name = &resource.spec.bind.secret_name;
        let secret = self
            .secrets
            .get(&resource.metadata.namespace, secret_name)
            .await?;
        Ok(check_bind_secret(secret_name, secret.as_ref()))
    }

    fn provider_config(
        &self,
        resource: &DirectoryIdentityProvider,
        credentials: &BindCredentials,
        ca_bundle: Option<Vec<u8>>,
    ) -> LdapProviderConfig {
        let spec = &resource.spec;
        let mut config = LdapProviderConfig::new(
            resource.metadata.name.clone(),
            spec.host.clone(),
            self.dialer.clone(),
        );
        config.resource_uid = resource.metadata.uid.clone();
        config.ca_bundle = ca_bundle;
        config.bind_username = credentials.username.clone();
        config.bind_password = credentials.password.clone();
        config.user_search = UserSearchConfig {
            base: spec.user_search.base.clone(),
            filter: spec.user_search.filter.clone(),
            username_attribute: spec.user_search.attributes.username.clone(),
            uid_attribute: spec.user_search.attributes.uid.clone(),
        };
        config.group_search = GroupSearchConfig {
            base: spec.group_search.base.clone(),
            filter: spec.group_search.filter.clone(),
            group_name_attribute: spec.group_search.attributes.group_name.clone(),
        };
        config.timeout = self.probe_timeout;

        match self.kind {
            DirectoryKind::Ldap => config,
            DirectoryKind::ActiveDirectory => config.with_active_directory_defaults(),
        }
    }

    async fn write_status(
        &self,
        resource: &DirectoryIdentityProvider,
        conditions: Vec<Condition>,
        now: OffsetDateTime,
    ) -> ReconcileResult {
        let conditions = merge_conditions(
            &resource.status.conditions,
            conditions,
            resource.metadata.generation,
            now,
        );
        let status = DirectoryProviderStatus {
            phase: phase_for(&conditions),
            conditions,
        };
        if status == resource.status {
            return Ok(());
        }

        tracing::debug!(
            kind = %self.kind,
            namespace = %resource.metadata.namespace,
            name = %resource.metadata.name,
            phase = ?status.phase,
            "Updating directory upstream status"
        );
        self.providers
            .update_status(
                self.kind,
                &resource.metadata.namespace,
                &resource.metadata.name,
                status,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for DirectoryUpstreamWatcher {
    fn name(&self) -> &str {
        match self.kind {
            DirectoryKind::Ldap => "ldap-upstream-watcher",
            DirectoryKind::ActiveDirectory => "active-directory-upstream-watcher",
        }
    }

    async fn sync(&self) -> ReconcileResult {
        let outcome = self.reconcile_pass().await?;
        if outcome.requeue {
            return Err(ReconcileError::SyntheticRequeue);
        }
        Ok(())
    }
}

fn check_bind_secret(
    secret_name: &str,
    secret: Option<&Secret>,
) -> (Condition, Option<BindCredentials>) {
    let Some(secret) = secret else {
        return (
            Condition::failure(
                TYPE_BIND_SECRET_VALID,
                REASON_SECRET_NOT_FOUND,
                format!("secret \"{secret_name}\" not found"),
            ),
            None,
        );
    };

    if secret.secret_type != SECRET_TYPE_BASIC_AUTH {
        return (
            Condition::failure(
                TYPE_BIND_SECRET_VALID,
                REASON_SECRET_WRONG_TYPE,
                format!(
                    "referenced Secret \"{secret_name}\" has wrong type \"{}\" (should be \"{SECRET_TYPE_BASIC_AUTH}\")",
                    secret.secret_type
                ),
            ),
            None,
        );
    }

    let (Some(username), Some(password)) = (
        secret.data.get(SECRET_USERNAME_KEY),
        secret.data.get(SECRET_PASSWORD_KEY),
    ) else {
        return (
            Condition::failure(
                TYPE_BIND_SECRET_VALID,
                REASON_SECRET_MISSING_KEYS,
                format!(
                    "referenced Secret \"{secret_name}\" is missing required keys [\"{SECRET_USERNAME_KEY}\" \"{SECRET_PASSWORD_KEY}\"]"
                ),
            ),
            None,
        );
    };

    (
        Condition::success(TYPE_BIND_SECRET_VALID, "loaded bind secret"),
        Some(BindCredentials {
            username: String::from_utf8_lossy(username).into_owned(),
            password: String::from_utf8_lossy(password).into_owned(),
            version: secret.metadata.resource_version.clone(),
        }),
    )
}

/// Returns the TLS condition and, when valid, the CA bundle to use
/// (`Some(None)` meaning the system roots).
fn validate_tls(tls: Option<&TlsSpec>) -> (Condition, Option<Option<Vec<u8>>>) {
    let Some(tls) = tls else {
        return (
            Condition::success(TYPE_TLS_CONFIGURATION_VALID, "no TLS configuration provided"),
            Some(None),
        );
    };
    if tls.certificate_authority_data.is_empty() {
        return (
            Condition::success(TYPE_TLS_CONFIGURATION_VALID, "loaded TLS configuration"),
            Some(None),
        );
    }

    let invalid = |detail: String| {
        (
            Condition::failure(
                TYPE_TLS_CONFIGURATION_VALID,
                REASON_INVALID_TLS_CONFIG,
                format!("certificateAuthorityData is invalid: {detail}"),
            ),
            None,
        )
    };

    let bundle = match STANDARD.decode(tls.certificate_authority_data.trim()) {
        Ok(bundle) => bundle,
        Err(err) => return invalid(err.to_string()),
    };
    if ca_certificates(&bundle).is_empty() {
        return invalid("no certificates found".to_string());
    }

    (
        Condition::success(TYPE_TLS_CONFIGURATION_VALID, "loaded TLS configuration"),
        Some(Some(bundle)),
    )
}
