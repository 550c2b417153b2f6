//! OpenID Connect discovery for upstream providers.
//!
//! Upstream OIDC providers are configured by issuer URL only. Their endpoints
//! are resolved once, when the upstream client is built, from
//! `<issuer>/.well-known/openid-configuration`.
//!
//! # Example
//!
//! ```ignore
//! use tollbridge_auth::federation::discovery::OidcDiscoveryClient;
//!
//! let client = OidcDiscoveryClient::new(http, false);
//! let document = client.discover(&issuer).await?;
//! println!("token endpoint: {}", document.metadata.token_endpoint);
//! ```
//!
//! # Security Considerations
//!
//! - Only HTTPS issuers are accepted unless `allow_http` is set
//! - The `issuer` in the document must match the configured issuer
//! - Oversized documents are rejected

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Largest discovery document accepted (1 MiB).
const MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// The subset of provider metadata the upstream client relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier asserted by the provider.
    pub issuer: String,

    /// Authorization endpoint used to build login redirects.
    pub authorization_endpoint: Url,

    /// Token endpoint for every grant.
    pub token_endpoint: Url,

    /// JWK set used to verify ID token signatures.
    pub jwks_uri: Url,

    /// RFC 7009 revocation endpoint, if the provider advertises one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<Url>,

    /// Signing algorithms the provider may use for ID tokens.
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// A fetched discovery document.
///
/// The raw JSON is retained so that optional endpoints are only interpreted
/// when a caller actually needs them.
#[derive(Debug, Clone)]
pub struct DiscoveryDocument {
    pub metadata: ProviderMetadata,
    pub raw: Value,
}

#[derive(Deserialize)]
struct UserInfoEndpointClaim {
    #[serde(default)]
    userinfo_endpoint: Option<String>,
}

impl DiscoveryDocument {
    /// Parses a discovery document from its JSON body.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::ParseError` if required metadata is missing.
    pub fn from_slice(body: &[u8]) -> Result<Self, DiscoveryError> {
        let raw: Value =
            serde_json::from_slice(body).map_err(|e| DiscoveryError::ParseError(e.to_string()))?;
        let metadata: ProviderMetadata = serde_json::from_value(raw.clone())
            .map_err(|e| DiscoveryError::ParseError(e.to_string()))?;
        Ok(Self { metadata, raw })
    }

    /// Returns the userinfo endpoint, or `None` when not advertised.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if `userinfo_endpoint` has the wrong type.
    pub fn userinfo_endpoint(&self) -> Result<Option<String>, serde_json::Error> {
        let claim: UserInfoEndpointClaim = serde_json::from_value(self.raw.clone())?;
        Ok(claim.userinfo_endpoint.filter(|e| !e.is_empty()))
    }
}

/// Errors that can occur during OIDC discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A network error occurred while fetching the discovery document.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The discovery document could not be parsed.
    #[error("Failed to parse discovery document: {0}")]
    ParseError(String),

    /// The issuer in the document does not match the configured issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },

    /// The issuer URL scheme is not allowed.
    #[error("Invalid URL scheme: {0} (only HTTPS is allowed)")]
    InvalidScheme(String),

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge { max_size: usize },
}

/// Fetches and validates discovery documents.
#[derive(Clone)]
pub struct OidcDiscoveryClient {
    http_client: reqwest::Client,
    allow_http: bool,
}

impl OidcDiscoveryClient {
    /// Creates a discovery client on top of a shared HTTP client.
    #[must_use]
    pub fn new(http_client: reqwest::Client, allow_http: bool) -> Self {
        Self {
            http_client,
            allow_http,
        }
    }

    /// Fetches the discovery document of `issuer` and checks that it
    /// describes that issuer.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is not allowed, the request fails, the
    /// document is malformed, or its issuer does not match.
    pub async fn discover(&self, issuer: &Url) -> Result<DiscoveryDocument, DiscoveryError> {
        self.validate_issuer_scheme(issuer)?;
        let discovery_url = build_discovery_url(issuer);

        let response = self
            .http_client
            .get(discovery_url.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch OIDC discovery from {}: {}", issuer, e);
                DiscoveryError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > MAX_DOCUMENT_SIZE
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: MAX_DOCUMENT_SIZE,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::NetworkError(e.to_string()))?;
        let document = DiscoveryDocument::from_slice(&body).inspect_err(|e| {
            tracing::warn!("Invalid OIDC discovery document from {}: {}", issuer, e);
        })?;

        validate_issuer(&document.metadata, issuer)?;

        tracing::debug!(
            "Discovered OIDC configuration for {}",
            document.metadata.issuer
        );
        Ok(document)
    }

    fn validate_issuer_scheme(&self, issuer: &Url) -> Result<(), DiscoveryError> {
        match issuer.scheme() {
            "https" => Ok(()),
            "http" if self.allow_http => Ok(()),
            other => Err(DiscoveryError::InvalidScheme(other.to_string())),
        }
    }
}

/// `{issuer}/.well-known/openid-configuration`, keeping any issuer path.
fn build_discovery_url(issuer: &Url) -> Url {
    let mut discovery_url = issuer.clone();
    let path = issuer.path().trim_end_matches('/');
    discovery_url.set_path(&format!("{path}/.well-known/openid-configuration"));
    discovery_url
}

fn validate_issuer(metadata: &ProviderMetadata, expected: &Url) -> Result<(), DiscoveryError> {
    let expected_normalized = expected.as_str().trim_end_matches('/');
    let actual_normalized = metadata.issuer.trim_end_matches('/');

    if expected_normalized != actual_normalized {
        return Err(DiscoveryError::IssuerMismatch {
            expected: expected_normalized.to_string(),
            actual: actual_normalized.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn document_json(issuer: &str) -> Value {
        json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/jwks"),
            "revocation_endpoint": format!("{issuer}/revoke"),
            "userinfo_endpoint": format!("{issuer}/userinfo")
        })
    }

    #[test]
    fn test_build_discovery_url_keeps_path() {
        let issuer = Url::parse("https://sso.example.com/realms/corp/").unwrap();
        assert_eq!(
            build_discovery_url(&issuer).as_str(),
            "https://sso.example.com/realms/corp/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_userinfo_endpoint_is_lazy() {
        let doc = DiscoveryDocument::from_slice(
            document_json("https://sso.example.com").to_string().as_bytes(),
        )
        .unwrap();
        assert_eq!(
            doc.userinfo_endpoint().unwrap().as_deref(),
            Some("https://sso.example.com/userinfo")
        );

        let mut raw = document_json("https://sso.example.com");
        raw["userinfo_endpoint"] = json!(42);
        let doc = DiscoveryDocument::from_slice(raw.to_string().as_bytes()).unwrap();
        assert!(doc.userinfo_endpoint().is_err());

        raw["userinfo_endpoint"] = json!("");
        let doc = DiscoveryDocument::from_slice(raw.to_string().as_bytes()).unwrap();
        assert_eq!(doc.userinfo_endpoint().unwrap(), None);
    }

    #[tokio::test]
    async fn test_discover_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(document_json(&server.uri())))
            .mount(&server)
            .await;

        let client = OidcDiscoveryClient::new(reqwest::Client::new(), true);
        let issuer = Url::parse(&server.uri()).unwrap();
        let doc = client.discover(&issuer).await.unwrap();

        assert_eq!(
            doc.metadata.token_endpoint.as_str(),
            format!("{}/token", server.uri())
        );
        assert!(doc.metadata.revocation_endpoint.is_some());
    }

    #[tokio::test]
    async fn test_discover_rejects_http_by_default() {
        let client = OidcDiscoveryClient::new(reqwest::Client::new(), false);
        let issuer = Url::parse("http://sso.example.com").unwrap();
        assert!(matches!(
            client.discover(&issuer).await,
            Err(DiscoveryError::InvalidScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_issuer_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(document_json("https://elsewhere.example")),
            )
            .mount(&server)
            .await;

        let client = OidcDiscoveryClient::new(reqwest::Client::new(), true);
        let issuer = Url::parse(&server.uri()).unwrap();
        assert!(matches!(
            client.discover(&issuer).await,
            Err(DiscoveryError::IssuerMismatch { .. })
        ));
    }
}
