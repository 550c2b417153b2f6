//! Federation configuration.
//!
//! Configuration types shared by every process that talks to upstream identity
//! providers. All durations are expressed in humantime format (`"30s"`, `"1h"`).
//!
//! # Example (TOML)
//!
//! ```toml
//! [federation]
//! request_timeout = "30s"
//! clock_skew_tolerance = "1m"
//!
//! [[oidc_upstreams]]
//! name = "corp-sso"
//! issuer = "https://sso.example.com"
//! client_id = "tollbridge"
//! client_secret = "s3cret"
//! scopes = ["openid", "email", "offline_access"]
//! username_claim = "email"
//! groups_claim = "groups"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Upstream federation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Timeout applied to every upstream HTTP call (token, userinfo,
    /// revocation, discovery and JWKS requests).
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Allowed clock skew when checking `exp`/`nbf`/`iat` of upstream ID tokens.
    #[serde(with = "humantime_serde")]
    pub clock_skew_tolerance: Duration,

    /// How long upstream JWKS documents are cached when the provider does not
    /// send `Cache-Control`.
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,

    /// Timeout for LDAP dial and bind operations.
    #[serde(with = "humantime_serde")]
    pub ldap_timeout: Duration,

    /// Permit plain `http://` issuers and JWKS endpoints.
    /// Only meant for local development and tests.
    pub allow_http: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            clock_skew_tolerance: Duration::from_secs(60),
            jwks_cache_ttl: Duration::from_secs(3600),
            ldap_timeout: Duration::from_secs(30),
            allow_http: false,
        }
    }
}

impl FederationConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "federation.request_timeout must be > 0".to_string(),
            ));
        }
        if self.ldap_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "federation.ldap_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Static configuration of one upstream OIDC identity provider.
///
/// Endpoints are resolved through OIDC discovery against `issuer`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OidcUpstreamSettings {
    /// Name used in callback paths and in the registry.
    pub name: String,

    /// Stable identifier of the resource this upstream was built from.
    #[serde(default)]
    pub resource_uid: String,

    /// Issuer URL; discovery is performed against
    /// `<issuer>/.well-known/openid-configuration`.
    pub issuer: Url,

    /// OAuth client ID registered with the upstream.
    pub client_id: String,

    /// OAuth client secret registered with the upstream.
    pub client_secret: String,

    /// Scopes requested in authcode and password grant flows.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// ID token claim used as the downstream username.
    /// When absent the downstream subject doubles as the username.
    #[serde(default)]
    pub username_claim: Option<String>,

    /// ID token claim holding the user's groups.
    #[serde(default)]
    pub groups_claim: Option<String>,

    /// Extra query parameters appended to authorization requests.
    #[serde(default)]
    pub additional_authorize_parameters: BTreeMap<String, String>,

    /// Allow the resource owner password credentials grant.
    #[serde(default)]
    pub allow_password_grant: bool,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "offline_access".to_string()]
}

impl OidcUpstreamSettings {
    /// Validates the upstream settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or client ID is empty, or if `openid` is
    /// not among the requested scopes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Missing("oidc upstream name".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Missing(format!(
                "client_id for oidc upstream '{}'",
                self.name
            )));
        }
        if !self.scopes.iter().any(|s| s == "openid") {
            return Err(ConfigError::InvalidValue(format!(
                "scopes for oidc upstream '{}' must include 'openid'",
                self.name
            )));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_federation_defaults() {
        let config = FederationConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.ldap_timeout, Duration::from_secs(30));
        assert!(!config.allow_http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_federation_humantime_parsing() {
        let config: FederationConfig = serde_json::from_str(
            r#"{"request_timeout": "5s", "jwks_cache_ttl": "2h", "allow_http": true}"#,
        )
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.jwks_cache_ttl, Duration::from_secs(7200));
        assert_eq!(config.ldap_timeout, Duration::from_secs(30));
        assert!(config.allow_http);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = FederationConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_oidc_upstream_settings() {
        let settings: OidcUpstreamSettings = serde_json::from_str(
            r#"{
                "name": "corp",
                "issuer": "https://sso.example.com",
                "client_id": "client",
                "client_secret": "secret"
            }"#,
        )
        .unwrap();
        assert_eq!(settings.scopes, vec!["openid", "offline_access"]);
        assert!(settings.username_claim.is_none());
        assert!(!settings.allow_password_grant);
        assert!(settings.validate().is_ok());

        let without_openid = OidcUpstreamSettings {
            scopes: vec!["email".to_string()],
            ..settings
        };
        assert!(without_openid.validate().is_err());
    }
}
