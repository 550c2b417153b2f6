//! Provider backends for upstream OIDC clients.
//!
//! The upstream client delegates everything that depends on the provider's
//! published metadata to an [`OidcProviderBackend`]:
//!
//! - verifying ID token signatures and standard claims
//! - locating the userinfo endpoint
//! - fetching userinfo with an access token
//!
//! [`DiscoveredProvider`] is the production backend, built from a discovery
//! document and a [`ProviderJwksCache`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use time::OffsetDateTime;
use url::Url;

use super::claims::{Claims, SUBJECT_CLAIM};
use super::discovery::DiscoveryDocument;
use super::jwks::{JwksError, ProviderJwksCache};

/// An ID token whose signature and standard claims have been verified.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdToken {
    /// All claims of the token, in payload order.
    pub claims: Claims,
    /// Signing algorithm from the JOSE header.
    pub algorithm: Algorithm,
    /// Value of the `exp` claim.
    pub expiry: Option<OffsetDateTime>,
}

/// A userinfo response.
///
/// `claims` holds the raw body; it is only interpreted as a JSON object when
/// the claims are merged into the ID token claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub subject: String,
    pub claims: Vec<u8>,
}

impl UserInfo {
    /// Builds a userinfo value from a JSON body.
    #[must_use]
    pub fn from_body(body: Vec<u8>) -> Self {
        let subject = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get(SUBJECT_CLAIM)?.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            subject,
            claims: body,
        }
    }
}

/// Errors raised by a provider backend.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("malformed jwt: {0}")]
    MalformedJwt(String),

    #[error("failed to verify signature: {0}")]
    Signature(String),

    #[error("{0}")]
    InvalidClaims(String),

    #[error("failed to fetch keys: {0}")]
    Jwks(#[from] JwksError),

    #[error("{0}")]
    UserInfo(String),
}

/// Provider-specific verification and userinfo operations.
#[async_trait]
pub trait OidcProviderBackend: Send + Sync {
    /// Verifies a raw ID token.
    async fn verify_id_token(&self, raw: &str) -> Result<VerifiedIdToken, ProviderError>;

    /// Returns the advertised userinfo endpoint, or `None`.
    ///
    /// Fails when the provider metadata cannot be interpreted.
    fn userinfo_endpoint(&self) -> Result<Option<String>, serde_json::Error>;

    /// Calls the userinfo endpoint with a bearer access token.
    async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo, ProviderError>;
}

/// A backend driven by an upstream's discovery document.
pub struct DiscoveredProvider {
    document: DiscoveryDocument,
    client_id: String,
    clock_skew: Duration,
    jwks: Arc<ProviderJwksCache>,
    http_client: reqwest::Client,
}

impl DiscoveredProvider {
    /// Creates a backend for `client_id` at the discovered provider.
    #[must_use]
    pub fn new(
        document: DiscoveryDocument,
        client_id: impl Into<String>,
        jwks: Arc<ProviderJwksCache>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            document,
            client_id: client_id.into(),
            clock_skew: Duration::from_secs(60),
            jwks,
            http_client,
        }
    }

    /// Sets the tolerated clock skew for `exp`/`nbf` checks.
    #[must_use]
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// The discovery document this backend was built from.
    #[must_use]
    pub fn document(&self) -> &DiscoveryDocument {
        &self.document
    }

    async fn signing_keys(
        &self,
        kid: Option<&str>,
    ) -> Result<Vec<(DecodingKey, Option<Algorithm>)>, JwksError> {
        let jwks_uri = &self.document.metadata.jwks_uri;
        match kid {
            Some(kid) => Ok(vec![self.jwks.get_key(jwks_uri, kid).await?]),
            None => self.jwks.find_signing_keys(jwks_uri).await,
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&self.document.metadata.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.leeway = self.clock_skew.as_secs();
        validation
    }
}

#[async_trait]
impl OidcProviderBackend for DiscoveredProvider {
    async fn verify_id_token(&self, raw: &str) -> Result<VerifiedIdToken, ProviderError> {
        if raw.split('.').count() != 3 {
            return Err(ProviderError::MalformedJwt(
                "compact JWS format must have three parts".to_string(),
            ));
        }
        let header = decode_header(raw).map_err(|e| ProviderError::MalformedJwt(e.to_string()))?;

        let allowed = &self.document.metadata.id_token_signing_alg_values_supported;
        if !allowed.is_empty() && !allowed.iter().any(|a| a == &format!("{:?}", header.alg)) {
            return Err(ProviderError::Signature(format!(
                "id token signed with unsupported algorithm {:?}",
                header.alg
            )));
        }

        let keys = self.signing_keys(header.kid.as_deref()).await?;
        let validation = self.validation(header.alg);

        let mut last_error = None;
        for (key, key_alg) in keys {
            if key_alg.is_some_and(|alg| alg != header.alg) {
                continue;
            }
            match decode::<Claims>(raw, &key, &validation) {
                Ok(data) => {
                    let expiry = data
                        .claims
                        .get_i64("exp")
                        .ok()
                        .flatten()
                        .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok());
                    return Ok(VerifiedIdToken {
                        claims: data.claims,
                        algorithm: header.alg,
                        expiry,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    ProviderError::Signature(e.to_string())
                }
                _ => ProviderError::InvalidClaims(e.to_string()),
            },
            None => ProviderError::Signature(format!(
                "no key matches signing algorithm {:?}",
                header.alg
            )),
        })
    }

    fn userinfo_endpoint(&self) -> Result<Option<String>, serde_json::Error> {
        self.document.userinfo_endpoint()
    }

    async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo, ProviderError> {
        let endpoint = self
            .userinfo_endpoint()
            .map_err(|e| ProviderError::UserInfo(e.to_string()))?
            .ok_or_else(|| {
                ProviderError::UserInfo("provider does not support userinfo endpoint".to_string())
            })?;
        let endpoint =
            Url::parse(&endpoint).map_err(|e| ProviderError::UserInfo(e.to_string()))?;

        let response = self
            .http_client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::UserInfo(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::UserInfo(e.to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::UserInfo(format!(
                "{}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        Ok(UserInfo::from_body(body.to_vec()))
    }
}
