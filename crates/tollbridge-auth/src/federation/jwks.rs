//! Upstream JWKS fetching and caching.
//!
//! ID tokens issued by upstream OIDC providers are verified against the keys
//! published at the provider's `jwks_uri`. Key sets are cached per URI. The
//! cache honors `Cache-Control: max-age`, clamped between a minimum and
//! maximum TTL, and is refreshed on a `kid` miss so that key rotation at the
//! provider is picked up without waiting for expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::RwLock;
use url::Url;

/// Configuration for the upstream JWKS cache.
#[derive(Debug, Clone)]
pub struct ProviderJwksCacheConfig {
    /// TTL used when the provider sends no `Cache-Control` (default: 1 hour).
    pub default_ttl: Duration,

    /// Upper bound for the TTL (default: 24 hours).
    pub max_ttl: Duration,

    /// Lower bound for the TTL (default: 5 minutes).
    pub min_ttl: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Permit `http://` JWKS URIs. Tests only.
    pub allow_http: bool,
}

impl Default for ProviderJwksCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86400),
            min_ttl: Duration::from_secs(300),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl ProviderJwksCacheConfig {
    /// Sets the default TTL.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the TTL bounds.
    #[must_use]
    pub fn with_ttl_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_ttl = min;
        self.max_ttl = max;
        self
    }

    /// Allows HTTP (non-HTTPS) JWKS URIs.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur while resolving upstream signing keys.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP error: status {0}")]
    HttpError(u16),

    #[error("Failed to parse JWKS: {0}")]
    ParseError(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("No signing keys found in JWKS")]
    NoSigningKeys,

    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,

    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge { max_size: usize },
}

struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

/// In-memory cache of upstream key sets, keyed by JWKS URI.
pub struct ProviderJwksCache {
    http_client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedJwks>>>,
    config: ProviderJwksCacheConfig,
}

impl ProviderJwksCache {
    /// Creates a cache that fetches key sets with `http_client`.
    #[must_use]
    pub fn new(http_client: reqwest::Client, config: ProviderJwksCacheConfig) -> Self {
        Self {
            http_client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Returns the decoding key with the given `kid`, refreshing the key set
    /// once on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the key set cannot be fetched or has no such key.
    pub async fn get_key(
        &self,
        jwks_uri: &Url,
        kid: &str,
    ) -> Result<(DecodingKey, Option<Algorithm>), JwksError> {
        if let Some(found) = self.cached_key(jwks_uri, kid).await {
            tracing::trace!("Cache hit for JWKS key: {} from {}", kid, jwks_uri);
            return Ok(found);
        }

        tracing::debug!("Cache miss for JWKS key: {} from {}", kid, jwks_uri);
        self.refresh(jwks_uri).await?;

        self.cached_key(jwks_uri, kid)
            .await
            .ok_or_else(|| JwksError::KeyNotFound(kid.to_string()))
    }

    async fn cached_key(&self, jwks_uri: &Url, kid: &str) -> Option<(DecodingKey, Option<Algorithm>)> {
        let cache = self.cache.read().await;
        let cached = cache.get(&normalize_uri(jwks_uri))?;
        if Instant::now() >= cached.expires_at {
            return None;
        }
        cached
            .jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))
            .and_then(|jwk| decoding_key(jwk))
    }

    /// Returns every signing key (keys marked `use: enc` are skipped), for
    /// tokens that carry no `kid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key set cannot be fetched or contains no
    /// usable signing key.
    pub async fn find_signing_keys(
        &self,
        jwks_uri: &Url,
    ) -> Result<Vec<(DecodingKey, Option<Algorithm>)>, JwksError> {
        let fresh = {
            let cache = self.cache.read().await;
            cache
                .get(&normalize_uri(jwks_uri))
                .is_some_and(|c| Instant::now() < c.expires_at)
        };
        if !fresh {
            self.refresh(jwks_uri).await?;
        }

        let cache = self.cache.read().await;
        let keys: Vec<_> = cache
            .get(&normalize_uri(jwks_uri))
            .map(|cached| {
                cached
                    .jwks
                    .keys
                    .iter()
                    .filter(|k| !matches!(k.common.public_key_use, Some(PublicKeyUse::Encryption)))
                    .filter_map(decoding_key)
                    .collect()
            })
            .unwrap_or_default();

        if keys.is_empty() {
            Err(JwksError::NoSigningKeys)
        } else {
            Ok(keys)
        }
    }

    /// Fetches the key set at `jwks_uri` and replaces the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error on a disallowed scheme, transport failure, non-2xx
    /// status, oversized body or unparsable key set.
    pub async fn refresh(&self, jwks_uri: &Url) -> Result<(), JwksError> {
        self.validate_scheme(jwks_uri)?;

        tracing::debug!("Fetching JWKS from {}", jwks_uri);
        let response = self
            .http_client
            .get(jwks_uri.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch JWKS from {}: {}", jwks_uri, e);
                JwksError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(JwksError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let ttl = self.parse_cache_control(response.headers());
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::ParseError(e.to_string()))?;

        tracing::debug!(
            "Cached JWKS from {} with {} keys, TTL {:?}",
            jwks_uri,
            jwks.keys.len(),
            ttl
        );

        self.cache.write().await.insert(
            normalize_uri(jwks_uri),
            CachedJwks {
                jwks,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn validate_scheme(&self, uri: &Url) -> Result<(), JwksError> {
        match uri.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            _ => Err(JwksError::InvalidScheme),
        }
    }

    fn parse_cache_control(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        let ttl = headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',')
                    .find_map(|d| d.trim().strip_prefix("max-age=")?.parse::<u64>().ok())
            })
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_ttl);

        ttl.min(self.config.max_ttl).max(self.config.min_ttl)
    }
}

fn normalize_uri(uri: &Url) -> String {
    uri.as_str().trim_end_matches('/').to_string()
}

fn decoding_key(jwk: &Jwk) -> Option<(DecodingKey, Option<Algorithm>)> {
    DecodingKey::from_jwk(jwk).ok().map(|dk| (dk, jwk_algorithm(jwk)))
}

fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cache(allow_http: bool) -> ProviderJwksCache {
        ProviderJwksCache::new(
            reqwest::Client::new(),
            ProviderJwksCacheConfig::default()
                .with_ttl_bounds(Duration::from_secs(60), Duration::from_secs(7200))
                .with_allow_http(allow_http),
        )
    }

    fn oct_jwks() -> serde_json::Value {
        json!({
            "keys": [
                {"kty": "oct", "kid": "k1", "alg": "HS256", "use": "sig", "k": "c2VjcmV0LWtleS1mb3ItdGVzdHM"},
                {"kty": "oct", "kid": "enc", "use": "enc", "k": "ZW5jcnlwdGlvbi1rZXk"}
            ]
        })
    }

    #[test]
    fn test_parse_cache_control() {
        let cache = cache(false);

        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(3600));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            "public, max-age=1800".parse().unwrap(),
        );
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(1800));

        headers.insert(reqwest::header::CACHE_CONTROL, "max-age=5".parse().unwrap());
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(60));

        headers.insert(reqwest::header::CACHE_CONTROL, "max-age=999999".parse().unwrap());
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(7200));
    }

    #[test]
    fn test_validate_scheme() {
        let http = Url::parse("http://example.com/jwks").unwrap();
        assert!(cache(false).validate_scheme(&http).is_err());
        assert!(cache(true).validate_scheme(&http).is_ok());
    }

    #[tokio::test]
    async fn test_get_key_fetches_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(oct_jwks()))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache(true);
        let uri = Url::parse(&format!("{}/jwks", server.uri())).unwrap();

        let (_, alg) = cache.get_key(&uri, "k1").await.unwrap();
        assert_eq!(alg, Some(Algorithm::HS256));
        assert!(cache.get_key(&uri, "k1").await.is_ok());

        let signing = cache.find_signing_keys(&uri).await.unwrap();
        assert_eq!(signing.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(oct_jwks()))
            .mount(&server)
            .await;

        let cache = cache(true);
        let uri = Url::parse(&format!("{}/jwks", server.uri())).unwrap();
        assert!(matches!(
            cache.get_key(&uri, "missing").await,
            Err(JwksError::KeyNotFound(_))
        ));
    }
}
