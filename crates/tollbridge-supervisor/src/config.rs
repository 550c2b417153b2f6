//! Supervisor configuration.
//!
//! Loaded from `tollbridge.toml` (or the path given on the command line) and
//! overridden by `TOLLBRIDGE__*` environment variables, e.g.
//! `TOLLBRIDGE__LOGGING__LEVEL=debug` or
//! `TOLLBRIDGE__CONTROLLER__RESYNC_INTERVAL=1m`.
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [controller]
//! resync_interval = "3m"
//! probe_timeout = "90s"
//!
//! [[ldap_upstreams]]
//! name = "corp"
//! host = "ldap.example.com:636"
//! bind_secret = "corp-bind"
//! user_search = { base = "ou=people,dc=example,dc=com", username_attribute = "uid", uid_attribute = "uidNumber" }
//! group_search = { base = "ou=groups,dc=example,dc=com", group_name_attribute = "cn" }
//!
//! [[secrets]]
//! name = "corp-bind"
//! username = "cn=svc,dc=example,dc=com"
//! password_env = "CORP_BIND_PASSWORD"
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tollbridge_auth::{ConfigError, FederationConfig, OidcUpstreamSettings};
use tollbridge_controller::resources::{
    BindSpec, DirectoryProviderSpec, GroupSearchAttributes, GroupSearchSpec,
    SECRET_PASSWORD_KEY, SECRET_TYPE_BASIC_AUTH, SECRET_USERNAME_KEY, TlsSpec,
    UserSearchAttributes, UserSearchSpec,
};
use tollbridge_controller::{ControllerConfig, DirectoryIdentityProvider, ObjectMeta, Secret};

/// Namespace used when a directory upstream or secret does not name one.
pub const DEFAULT_NAMESPACE: &str = "tollbridge";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub oidc_upstreams: Vec<OidcUpstreamSettings>,
    #[serde(default)]
    pub ldap_upstreams: Vec<DirectoryUpstreamConfig>,
    #[serde(default)]
    pub active_directory_upstreams: Vec<DirectoryUpstreamConfig>,
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }

        self.federation.validate()?;

        let controller = &self.controller;
        if controller.resync_interval.is_zero() || controller.probe_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "controller.resync_interval and controller.probe_timeout must be > 0".into(),
            ));
        }
        if controller.requeue_initial_backoff.is_zero()
            || controller.requeue_initial_backoff > controller.requeue_max_backoff
        {
            return Err(ConfigError::InvalidValue(
                "controller.requeue_initial_backoff must be > 0 and <= controller.requeue_max_backoff"
                    .into(),
            ));
        }

        let mut names = HashSet::new();
        for upstream in &self.oidc_upstreams {
            upstream.validate()?;
            if !names.insert(upstream.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate oidc upstream name '{}'",
                    upstream.name
                )));
            }
        }

        for (section, upstreams) in [
            ("ldap_upstreams", &self.ldap_upstreams),
            ("active_directory_upstreams", &self.active_directory_upstreams),
        ] {
            let mut names = HashSet::new();
            for upstream in upstreams {
                upstream.validate(section)?;
                if !names.insert((upstream.namespace.as_str(), upstream.name.as_str())) {
                    return Err(ConfigError::InvalidValue(format!(
                        "duplicate {section} entry '{}/{}'",
                        upstream.namespace, upstream.name
                    )));
                }
            }
        }

        for secret in &self.secrets {
            if secret.name.is_empty() {
                return Err(ConfigError::Missing("secrets[].name".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

/// A statically configured LDAP or Active Directory upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryUpstreamConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// `host` or `host:port`.
    pub host: String,
    /// Base64 encoded PEM bundle of trusted CAs.
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    /// Name of a `secrets` entry in the same namespace.
    pub bind_secret: String,
    #[serde(default)]
    pub user_search: UserSearchSettings,
    #[serde(default)]
    pub group_search: GroupSearchSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSearchSettings {
    pub base: String,
    pub filter: String,
    pub username_attribute: String,
    pub uid_attribute: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSearchSettings {
    pub base: String,
    pub filter: String,
    pub group_name_attribute: String,
}

impl DirectoryUpstreamConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Missing(format!("{section}[].name")));
        }
        if self.host.is_empty() {
            return Err(ConfigError::Missing(format!(
                "host for {section} entry '{}'",
                self.name
            )));
        }
        if self.bind_secret.is_empty() {
            return Err(ConfigError::Missing(format!(
                "bind_secret for {section} entry '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Converts the entry into the resource the controller reconciles.
    #[must_use]
    pub fn to_resource(&self) -> DirectoryIdentityProvider {
        DirectoryIdentityProvider {
            metadata: ObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                uid: uuid::Uuid::new_v4().to_string(),
                ..ObjectMeta::default()
            },
            spec: DirectoryProviderSpec {
                host: self.host.clone(),
                tls: self
                    .certificate_authority_data
                    .as_ref()
                    .map(|data| TlsSpec {
                        certificate_authority_data: data.clone(),
                    }),
                bind: BindSpec {
                    secret_name: self.bind_secret.clone(),
                },
                user_search: UserSearchSpec {
                    base: self.user_search.base.clone(),
                    filter: self.user_search.filter.clone(),
                    attributes: UserSearchAttributes {
                        username: self.user_search.username_attribute.clone(),
                        uid: self.user_search.uid_attribute.clone(),
                    },
                },
                group_search: GroupSearchSpec {
                    base: self.group_search.base.clone(),
                    filter: self.group_search.filter.clone(),
                    attributes: GroupSearchAttributes {
                        group_name: self.group_search.group_name_attribute.clone(),
                    },
                },
            },
            ..DirectoryIdentityProvider::default()
        }
    }
}

fn default_secret_type() -> String {
    SECRET_TYPE_BASIC_AUTH.into()
}

/// A bind secret.
///
/// For security, prefer `password_env` over an inline `password`.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_secret_type", rename = "type")]
    pub secret_type: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
}

impl std::fmt::Debug for SecretConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretConfig")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("secret_type", &self.secret_type)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("password_env", &self.password_env)
            .finish()
    }
}

impl SecretConfig {
    /// Converts the entry into a secret. Keys that are not configured are
    /// left out so the controller can report them as missing.
    #[must_use]
    pub fn to_secret(&self) -> Secret {
        let password = self.password.clone().or_else(|| {
            self.password_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        });

        let mut data = BTreeMap::new();
        if let Some(username) = &self.username {
            data.insert(SECRET_USERNAME_KEY.to_string(), username.as_bytes().to_vec());
        }
        if let Some(password) = password {
            data.insert(SECRET_PASSWORD_KEY.to_string(), password.into_bytes());
        }

        Secret {
            metadata: ObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                ..ObjectMeta::default()
            },
            secret_type: self.secret_type.clone(),
            data,
        }
    }
}

pub mod loader {
    use super::SupervisorConfig;
    use anyhow::Context;
    use config::{Config, Environment, File};
    use std::path::Path;

    /// Loads and validates the configuration.
    ///
    /// A missing file is not an error; defaults plus environment overrides
    /// are used instead.
    pub fn load_config(path: &Path) -> anyhow::Result<SupervisorConfig> {
        let mut builder = Config::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        // Environment variable overrides, e.g., TOLLBRIDGE__LOGGING__LEVEL=debug
        builder = builder.add_source(
            Environment::with_prefix("TOLLBRIDGE")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: SupervisorConfig = builder
            .build()
            .context("config build error")?
            .try_deserialize()
            .context("config deserialize error")?;
        merged.validate().context("config validation error")?;
        Ok(merged)
    }
}
