//! Upstream OpenID Connect client.
//!
//! An [`UpstreamOidcClient`] bridges one upstream OIDC provider into a
//! downstream login. It performs the token-endpoint grants, validates the
//! returned ID token, merges userinfo claims and revokes refresh tokens.
//!
//! ```text
//! Unauthenticated ─► TokenExchanged ─► IdTokenValidated ─► [UserInfoMerged] ─► Complete
//!        │                 │                   │                    │
//!        └─────────────────┴───────── any failure is terminal ──────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tollbridge_auth::federation::oidc::{UpstreamOidcClient, UpstreamOidcIdentityProvider};
//!
//! let client = UpstreamOidcClient::discover(&settings, &federation).await?;
//! let token = client
//!     .exchange_authcode_and_validate_tokens(code, &pkce, &nonce, redirect_uri)
//!     .await?;
//! ```
//!
//! # Security
//!
//! - Client credentials are sent in the request body, and in the
//!   `Authorization` header only for the revocation fallback
//! - `at_hash` is verified whenever the ID token carries one
//! - The issuer of merged claims always comes from the ID token

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Algorithm;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha384, Sha512};
use time::OffsetDateTime;
use url::Url;

use super::claims::{ACCESS_TOKEN_HASH_CLAIM, Claims, ISSUER_CLAIM, SUBJECT_CLAIM};
use super::discovery::{DiscoveryError, OidcDiscoveryClient};
use super::jwks::{ProviderJwksCache, ProviderJwksCacheConfig};
use super::pkce::{Nonce, NonceMismatch, PkceCode};
use super::provider::{DiscoveredProvider, OidcProviderBackend};
use super::token::{AccessToken, IdToken, OAuth2Token, RefreshToken, Token, TokenEndpointResponse};
use crate::config::{FederationConfig, OidcUpstreamSettings};

// =============================================================================
// Errors
// =============================================================================

/// Failures while merging userinfo claims.
#[derive(Debug, thiserror::Error)]
pub enum UserInfoError {
    #[error("could not unmarshal discovery JSON: {0}")]
    Discovery(String),

    #[error("could not get user info: {0}")]
    Fetch(String),

    #[error("userinfo 'sub' claim ({userinfo}) did not match id_token 'sub' claim ({id_token})")]
    SubjectMismatch { userinfo: String, id_token: String },

    #[error("could not unmarshal user info claims: {0}")]
    Unmarshal(String),
}

/// Failures of RFC 7009 refresh token revocation.
#[derive(Debug, thiserror::Error)]
pub enum RevocationError {
    #[error("could not send revocation request: {0}")]
    Transport(String),

    #[error("server responded with status {status} with body: {body}")]
    Rejected {
        status: u16,
        body: String,
        error_code: String,
    },

    #[error("error parsing response body {body:?} on response with status code {status}: {source}")]
    UnparsableBody {
        status: u16,
        body: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("server responded with status {0}")]
    UnexpectedStatus(u16),
}

/// Errors returned by an upstream OIDC client.
#[derive(Debug, thiserror::Error)]
pub enum OidcClientError {
    #[error(
        "resource owner password credentials grant is not allowed for this upstream provider according to its configuration"
    )]
    PasswordGrantNotAllowed,

    /// The token endpoint answered with a non-2xx status.
    #[error("oauth2: cannot fetch token: {status}\nResponse: {body}")]
    TokenEndpoint {
        status: StatusCode,
        body: String,
        /// OAuth2 `error` code from the response body, when present.
        error_code: Option<String>,
    },

    #[error("oauth2: cannot fetch token: {0}")]
    TokenTransport(String),

    #[error("oauth2: cannot parse token response: {0}")]
    TokenResponse(String),

    #[error("oauth2: server response missing access_token")]
    MissingAccessToken,

    #[error("received response missing ID token")]
    MissingIdToken,

    #[error("received invalid ID token: {0}")]
    InvalidIdToken(String),

    #[error("received invalid ID token: access token hash does not match value in ID token")]
    AccessTokenHashMismatch,

    #[error("received ID token with invalid nonce: {0}")]
    InvalidNonce(#[from] NonceMismatch),

    #[error("could not fetch user info claims: {0}")]
    UserInfo(#[from] UserInfoError),

    #[error(transparent)]
    Revocation(#[from] RevocationError),

    #[error("could not perform OIDC discovery: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("downstream subject did not contain original upstream subject")]
    MissingUpstreamSubject,
}

impl OidcClientError {
    /// Returns `true` if the upstream provider (rather than local
    /// configuration or claim content) caused the failure.
    #[must_use]
    pub fn is_upstream_failure(&self) -> bool {
        !matches!(
            self,
            Self::PasswordGrantNotAllowed | Self::MissingUpstreamSubject
        )
    }

    /// Returns `true` if the upstream rejected the presented credentials or
    /// grant (OAuth2 `invalid_grant`).
    #[must_use]
    pub fn is_invalid_grant(&self) -> bool {
        self.oauth_error_code() == Some("invalid_grant")
    }

    /// The OAuth2 error code returned by the token endpoint, if any.
    #[must_use]
    pub fn oauth_error_code(&self) -> Option<&str> {
        match self {
            Self::TokenEndpoint { error_code, .. } => error_code.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: String,
}

// =============================================================================
// Capability trait
// =============================================================================

/// An upstream OpenID Connect identity provider.
#[async_trait]
pub trait UpstreamOidcIdentityProvider: Send + Sync {
    /// Name of the upstream, unique among OIDC upstreams.
    fn name(&self) -> &str;

    fn client_id(&self) -> &str;

    /// UID of the resource this provider was built from.
    fn resource_uid(&self) -> &str;

    fn authorization_url(&self) -> &Url;

    fn scopes(&self) -> &[String];

    /// Claim used as the downstream username; `None` means use the subject.
    fn username_claim(&self) -> Option<&str>;

    /// Claim holding group memberships; `None` disables group mapping.
    fn groups_claim(&self) -> Option<&str>;

    fn allows_password_grant(&self) -> bool;

    /// Extra parameters appended to authorization requests.
    fn additional_authcode_params(&self) -> &BTreeMap<String, String>;

    /// Performs the resource owner password credentials grant and validates
    /// the resulting tokens. No nonce is checked.
    async fn password_credentials_grant_and_validate_tokens(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Token, OidcClientError>;

    /// Exchanges an authorization code (with its PKCE verifier) and validates
    /// the resulting tokens against `expected_nonce`.
    async fn exchange_authcode_and_validate_tokens(
        &self,
        authcode: &str,
        pkce_verifier: &PkceCode,
        expected_nonce: &Nonce,
        redirect_uri: &str,
    ) -> Result<Token, OidcClientError>;

    /// Runs the refresh grant and returns the raw token response.
    async fn perform_refresh(&self, refresh_token: &str) -> Result<OAuth2Token, OidcClientError>;

    /// Revokes a refresh token at the upstream, if it supports revocation.
    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<(), OidcClientError>;

    /// Validates a token response and merges userinfo claims into the ID
    /// token claims.
    async fn validate_token(
        &self,
        token: &OAuth2Token,
        expected_nonce: &Nonce,
        require_id_token: bool,
    ) -> Result<Token, OidcClientError>;

    /// Builds the upstream authorization URL for a login attempt.
    fn authorize_url(&self, state: &str, nonce: &Nonce, pkce: &PkceCode, redirect_uri: &str) -> Url {
        let mut url = self.authorization_url().clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", self.client_id())
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.scopes().join(" "))
                .append_pair("state", state)
                .append_pair("code_challenge", &pkce.challenge())
                .append_pair("code_challenge_method", pkce.method());
            if !nonce.is_empty() {
                query.append_pair("nonce", nonce.as_str());
            }
            for (key, value) in self.additional_authcode_params() {
                query.append_pair(key, value);
            }
        }
        url
    }
}

// =============================================================================
// Client
// =============================================================================

/// Immutable configuration of an upstream OIDC client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamOidcConfig {
    pub name: String,
    pub resource_uid: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: Url,
    pub token_url: Url,
    pub revocation_url: Option<Url>,
    pub scopes: Vec<String>,
    pub username_claim: Option<String>,
    pub groups_claim: Option<String>,
    pub additional_authcode_params: BTreeMap<String, String>,
    pub allow_password_grant: bool,
}

/// The production [`UpstreamOidcIdentityProvider`].
pub struct UpstreamOidcClient {
    config: UpstreamOidcConfig,
    backend: Arc<dyn OidcProviderBackend>,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for UpstreamOidcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamOidcClient")
            .field("name", &self.config.name)
            .field("client_id", &self.config.client_id)
            .field("token_url", &self.config.token_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Builds the HTTP client used for every upstream call.
///
/// # Errors
///
/// Returns the reqwest error if the TLS backend cannot be initialized.
pub fn build_http_client(federation: &FederationConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(federation.request_timeout)
        .build()
}

impl UpstreamOidcClient {
    /// Creates a client from resolved configuration and a provider backend.
    #[must_use]
    pub fn new(
        config: UpstreamOidcConfig,
        backend: Arc<dyn OidcProviderBackend>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            backend,
            http_client,
        }
    }

    /// Resolves the upstream's endpoints through OIDC discovery and builds a
    /// client backed by a [`DiscoveredProvider`].
    ///
    /// # Errors
    ///
    /// Returns `OidcClientError::Discovery` if the issuer cannot be discovered.
    pub async fn discover(
        settings: &OidcUpstreamSettings,
        federation: &FederationConfig,
    ) -> Result<Self, OidcClientError> {
        let http_client = build_http_client(federation)
            .map_err(|e| DiscoveryError::NetworkError(e.to_string()))?;

        let document = OidcDiscoveryClient::new(http_client.clone(), federation.allow_http)
            .discover(&settings.issuer)
            .await?;

        let jwks = Arc::new(ProviderJwksCache::new(
            http_client.clone(),
            ProviderJwksCacheConfig::default()
                .with_default_ttl(federation.jwks_cache_ttl)
                .with_allow_http(federation.allow_http),
        ));

        let config = UpstreamOidcConfig {
            name: settings.name.clone(),
            resource_uid: settings.resource_uid.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            authorization_url: document.metadata.authorization_endpoint.clone(),
            token_url: document.metadata.token_endpoint.clone(),
            revocation_url: document.metadata.revocation_endpoint.clone(),
            scopes: settings.scopes.clone(),
            username_claim: settings.username_claim.clone(),
            groups_claim: settings.groups_claim.clone(),
            additional_authcode_params: settings.additional_authorize_parameters.clone(),
            allow_password_grant: settings.allow_password_grant,
        };

        tracing::info!(
            upstream = %config.name,
            issuer = %settings.issuer,
            "Discovered upstream OIDC provider"
        );

        let backend = DiscoveredProvider::new(document, &settings.client_id, jwks, http_client.clone())
            .with_clock_skew(federation.clock_skew_tolerance);

        Ok(Self::new(config, Arc::new(backend), http_client))
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &UpstreamOidcConfig {
        &self.config
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<OAuth2Token, OidcClientError> {
        let response = self
            .http_client
            .post(self.config.token_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| OidcClientError::TokenTransport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OidcClientError::TokenTransport(e.to_string()))?;

        if !status.is_success() {
            let error_code = serde_json::from_str::<OAuthErrorBody>(&body)
                .ok()
                .map(|b| b.error)
                .filter(|code| !code.is_empty());
            tracing::warn!(
                upstream = %self.config.name,
                status = status.as_u16(),
                error_code = error_code.as_deref().unwrap_or(""),
                "Upstream token endpoint returned an error"
            );
            return Err(OidcClientError::TokenEndpoint {
                status,
                body,
                error_code,
            });
        }

        let parsed: TokenEndpointResponse = serde_json::from_str(&body)
            .map_err(|e| OidcClientError::TokenResponse(e.to_string()))?;
        if !parsed.has_access_token() {
            return Err(OidcClientError::MissingAccessToken);
        }
        Ok(parsed.into_token(OffsetDateTime::now_utc()))
    }

    async fn maybe_merge_user_info(
        &self,
        token: &OAuth2Token,
        claims: &mut Claims,
        id_token_subject: &str,
    ) -> Result<(), UserInfoError> {
        let endpoint = self
            .backend
            .userinfo_endpoint()
            .map_err(|e| UserInfoError::Discovery(e.to_string()))?;
        if endpoint.is_none() {
            tracing::debug!(upstream = %self.config.name, "Upstream has no userinfo endpoint");
            return Ok(());
        }

        let user_info = self
            .backend
            .fetch_userinfo(&token.access_token)
            .await
            .map_err(|e| UserInfoError::Fetch(e.to_string()))?;

        if !id_token_subject.is_empty() && user_info.subject != id_token_subject {
            return Err(UserInfoError::SubjectMismatch {
                userinfo: user_info.subject,
                id_token: id_token_subject.to_string(),
            });
        }

        let id_token_issuer = claims.get(ISSUER_CLAIM).cloned();
        let user_claims = Claims::from_json_slice(&user_info.claims)
            .map_err(|e| UserInfoError::Unmarshal(e.to_string()))?;
        claims.merge_from(user_claims);

        // Userinfo responses make no guarantees about `iss`.
        match id_token_issuer {
            Some(issuer) => {
                claims.insert(ISSUER_CLAIM, issuer);
            }
            None => {
                claims.remove(ISSUER_CLAIM);
            }
        }
        Ok(())
    }

    async fn try_revoke(
        &self,
        revocation_url: &Url,
        refresh_token: &str,
        use_basic_auth: bool,
    ) -> Result<(), (bool, RevocationError)> {
        let mut form = vec![("token", refresh_token), ("token_type_hint", "refresh_token")];
        let mut request = self.http_client.post(revocation_url.clone());
        if use_basic_auth {
            request = request.basic_auth(
                query_escape(&self.config.client_id),
                Some(query_escape(&self.config.client_secret)),
            );
        } else {
            form.push(("client_id", self.config.client_id.as_str()));
            form.push(("client_secret", self.config.client_secret.as_str()));
        }

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| (false, RevocationError::Transport(e.to_string())))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::BAD_REQUEST {
            return Err((false, RevocationError::UnexpectedStatus(status.as_u16())));
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: OAuthErrorBody = serde_json::from_str(&body).map_err(|source| {
            (
                false,
                RevocationError::UnparsableBody {
                    status: status.as_u16(),
                    body: body.clone(),
                    source,
                },
            )
        })?;

        let retry_with_other_auth = parsed.error == "invalid_client";
        Err((
            retry_with_other_auth,
            RevocationError::Rejected {
                status: status.as_u16(),
                body,
                error_code: parsed.error,
            },
        ))
    }
}

fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Computes the `at_hash` value for `access_token`: the left half of the
/// access token digest, using the hash size of the ID token's algorithm.
fn access_token_hash(algorithm: Algorithm, access_token: &str) -> String {
    let digest: Vec<u8> = match algorithm {
        Algorithm::HS256 | Algorithm::RS256 | Algorithm::ES256 | Algorithm::PS256 => {
            Sha256::digest(access_token.as_bytes()).to_vec()
        }
        Algorithm::HS384 | Algorithm::RS384 | Algorithm::ES384 | Algorithm::PS384 => {
            Sha384::digest(access_token.as_bytes()).to_vec()
        }
        Algorithm::HS512 | Algorithm::RS512 | Algorithm::PS512 | Algorithm::EdDSA => {
            Sha512::digest(access_token.as_bytes()).to_vec()
        }
    };
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

#[async_trait]
impl UpstreamOidcIdentityProvider for UpstreamOidcClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn resource_uid(&self) -> &str {
        &self.config.resource_uid
    }

    fn authorization_url(&self) -> &Url {
        &self.config.authorization_url
    }

    fn scopes(&self) -> &[String] {
        &self.config.scopes
    }

    fn username_claim(&self) -> Option<&str> {
        self.config.username_claim.as_deref()
    }

    fn groups_claim(&self) -> Option<&str> {
        self.config.groups_claim.as_deref()
    }

    fn allows_password_grant(&self) -> bool {
        self.config.allow_password_grant
    }

    fn additional_authcode_params(&self) -> &BTreeMap<String, String> {
        &self.config.additional_authcode_params
    }

    async fn password_credentials_grant_and_validate_tokens(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Token, OidcClientError> {
        if !self.config.allow_password_grant {
            return Err(OidcClientError::PasswordGrantNotAllowed);
        }

        let scope = self.config.scopes.join(" ");
        let token = self
            .token_request(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
                ("scope", scope.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await?;

        // There is no authorization request, so there is no nonce to check.
        self.validate_token(&token, &Nonce::empty(), true).await
    }

    async fn exchange_authcode_and_validate_tokens(
        &self,
        authcode: &str,
        pkce_verifier: &PkceCode,
        expected_nonce: &Nonce,
        redirect_uri: &str,
    ) -> Result<Token, OidcClientError> {
        let token = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", authcode),
                ("redirect_uri", redirect_uri),
                ("code_verifier", pkce_verifier.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await?;

        self.validate_token(&token, expected_nonce, true).await
    }

    async fn perform_refresh(&self, refresh_token: &str) -> Result<OAuth2Token, OidcClientError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ])
        .await
    }

    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<(), OidcClientError> {
        let Some(revocation_url) = &self.config.revocation_url else {
            tracing::debug!(
                upstream = %self.config.name,
                "Upstream has no revocation endpoint, skipping refresh token revocation"
            );
            return Ok(());
        };

        match self.try_revoke(revocation_url, refresh_token, false).await {
            Ok(()) => Ok(()),
            Err((true, _)) => {
                tracing::debug!(
                    upstream = %self.config.name,
                    "Revocation rejected client credentials in body, retrying with basic auth"
                );
                self.try_revoke(revocation_url, refresh_token, true)
                    .await
                    .map_err(|(_, e)| e.into())
            }
            Err((false, e)) => Err(e.into()),
        }
    }

    async fn validate_token(
        &self,
        token: &OAuth2Token,
        expected_nonce: &Nonce,
        require_id_token: bool,
    ) -> Result<Token, OidcClientError> {
        let mut claims = Claims::new();
        let mut id_token_expiry = None;

        match token.id_token.as_deref() {
            None if require_id_token => return Err(OidcClientError::MissingIdToken),
            None => {}
            Some(raw) => {
                let verified = self
                    .backend
                    .verify_id_token(raw)
                    .await
                    .map_err(|e| OidcClientError::InvalidIdToken(e.to_string()))?;

                let at_hash = verified.claims.str_or_empty(ACCESS_TOKEN_HASH_CLAIM);
                if !at_hash.is_empty() {
                    if access_token_hash(verified.algorithm, &token.access_token) != at_hash {
                        return Err(OidcClientError::AccessTokenHashMismatch);
                    }
                }

                if !expected_nonce.is_empty() {
                    expected_nonce.validate(&verified.claims)?;
                }

                claims = verified.claims;
                id_token_expiry = verified.expiry;
            }
        }

        let id_token_subject = claims.str_or_empty(SUBJECT_CLAIM).to_string();
        if !id_token_subject.is_empty() || token.id_token.is_none() {
            self.maybe_merge_user_info(token, &mut claims, &id_token_subject)
                .await?;
        } else {
            tracing::debug!(
                upstream = %self.config.name,
                "ID token has no subject, skipping userinfo"
            );
        }

        Ok(Token {
            access_token: Some(AccessToken {
                token: token.access_token.clone(),
                token_type: token.token_type.clone(),
                expiry: token.expiry,
            }),
            refresh_token: token.refresh_token.clone().map(|token| RefreshToken { token }),
            id_token: Some(IdToken {
                token: token.id_token.clone().unwrap_or_default(),
                expiry: id_token_expiry,
                claims,
            }),
        })
    }
}

/// Recovers the upstream subject from a downstream subject of the form
/// `<issuer>?sub=<subject>`. Only the first `?sub=` separates the two parts.
///
/// # Errors
///
/// Returns `OidcClientError::MissingUpstreamSubject` if there is no `?sub=`.
pub fn extract_upstream_subject_from_downstream(
    downstream_subject: &str,
) -> Result<&str, OidcClientError> {
    downstream_subject
        .split_once("?sub=")
        .map(|(_, upstream)| upstream)
        .ok_or(OidcClientError::MissingUpstreamSubject)
}
