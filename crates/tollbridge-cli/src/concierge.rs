//! Concierge client: exchanges a token for cluster credentials through a
//! `TokenCredentialRequest`.
//!
//! The request targets
//! `<endpoint>/apis/login.concierge.<suffix>/v1alpha1/namespaces/<ns>/tokencredentialrequests`
//! and names the authenticator that should validate the token.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::exec_credential::{ExecCredential, ExecCredentialStatus};

/// Upper bound on a whole credential exchange.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConciergeError {
    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("invalid authenticator type: \"{0}\", supported values are \"webhook\" and \"jwt\"")]
    InvalidAuthenticatorType(String),

    #[error("authenticator name must not be empty")]
    EmptyAuthenticatorName,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid CA bundle data: {0}")]
    InvalidCaBundle(String),

    #[error("invalid API group suffix \"{0}\"")]
    InvalidApiGroupSuffix(String),

    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to concierge failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("concierge returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode concierge response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("login failed: unknown cause")]
    NoCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticatorKind {
    Webhook,
    Jwt,
}

impl AuthenticatorKind {
    /// Parses a user-supplied authenticator type, ignoring case.
    pub fn parse(value: &str) -> Result<Self, ConciergeError> {
        match value.to_ascii_lowercase().as_str() {
            "webhook" => Ok(Self::Webhook),
            "jwt" => Ok(Self::Jwt),
            _ => Err(ConciergeError::InvalidAuthenticatorType(value.to_string())),
        }
    }

    #[must_use]
    pub fn resource_kind(self) -> &'static str {
        match self {
            Self::Webhook => "WebhookAuthenticator",
            Self::Jwt => "JWTAuthenticator",
        }
    }
}

/// Raw concierge parameters as given on the command line.
#[derive(Debug, Clone)]
pub struct ConciergeSettings {
    pub namespace: String,
    pub authenticator_type: String,
    pub authenticator_name: String,
    pub endpoint: String,
    /// Base64 encoded PEM bundle. Empty means the system roots.
    pub ca_bundle_data: String,
    pub api_group_suffix: String,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialRequest {
    pub api_version: String,
    pub kind: String,
    pub metadata: RequestMetadata,
    pub spec: TokenCredentialRequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TokenCredentialRequestStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCredentialRequestSpec {
    pub token: String,
    pub authenticator: AuthenticatorReference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorReference {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCredentialRequestStatus {
    #[serde(default)]
    pub credential: Option<ClusterCredential>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCredential {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiration_timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    #[serde(default)]
    pub client_key_data: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug)]
pub struct ConciergeClient {
    http: reqwest::Client,
    endpoint: Url,
    namespace: String,
    authenticator: AuthenticatorKind,
    authenticator_name: String,
    api_group_suffix: String,
}

impl ConciergeClient {
    /// Validates the settings and builds an HTTP client trusting the given
    /// CA bundle.
    pub fn new(settings: &ConciergeSettings) -> Result<Self, ConciergeError> {
        if settings.namespace.is_empty() {
            return Err(ConciergeError::EmptyNamespace);
        }
        let authenticator = AuthenticatorKind::parse(&settings.authenticator_type)?;
        if settings.authenticator_name.is_empty() {
            return Err(ConciergeError::EmptyAuthenticatorName);
        }
        let endpoint = parse_endpoint(&settings.endpoint)?;
        if !is_dns_subdomain(&settings.api_group_suffix) {
            return Err(ConciergeError::InvalidApiGroupSuffix(
                settings.api_group_suffix.clone(),
            ));
        }

        let mut builder = reqwest::Client::builder().timeout(EXCHANGE_TIMEOUT);
        if !settings.ca_bundle_data.is_empty() {
            let pem = STANDARD
                .decode(settings.ca_bundle_data.trim())
                .map_err(|e| ConciergeError::InvalidCaBundle(e.to_string()))?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| ConciergeError::InvalidCaBundle(e.to_string()))?;
            if certs.is_empty() {
                return Err(ConciergeError::InvalidCaBundle(
                    "no certificates found".to_string(),
                ));
            }
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        let http = builder.build().map_err(ConciergeError::Client)?;

        Ok(Self {
            http,
            endpoint,
            namespace: settings.namespace.clone(),
            authenticator,
            authenticator_name: settings.authenticator_name.clone(),
            api_group_suffix: settings.api_group_suffix.clone(),
        })
    }

    fn login_api_group(&self) -> String {
        format!("login.concierge.{}", self.api_group_suffix)
    }

    fn authentication_api_group(&self) -> String {
        format!("authentication.concierge.{}", self.api_group_suffix)
    }

    /// The `TokenCredentialRequest` this client sends for `token`.
    #[must_use]
    pub fn token_credential_request(&self, token: &str) -> TokenCredentialRequest {
        TokenCredentialRequest {
            api_version: format!("{}/v1alpha1", self.login_api_group()),
            kind: "TokenCredentialRequest".to_string(),
            metadata: RequestMetadata {
                namespace: self.namespace.clone(),
            },
            spec: TokenCredentialRequestSpec {
                token: token.to_string(),
                authenticator: AuthenticatorReference {
                    api_group: self.authentication_api_group(),
                    kind: self.authenticator.resource_kind().to_string(),
                    name: self.authenticator_name.clone(),
                },
            },
            status: None,
        }
    }

    fn token_credential_requests_url(&self) -> String {
        format!(
            "{}/apis/{}/v1alpha1/namespaces/{}/tokencredentialrequests",
            self.endpoint.as_str().trim_end_matches('/'),
            self.login_api_group(),
            self.namespace
        )
    }

    /// Exchanges `token` for cluster credentials.
    pub async fn exchange_token(&self, token: &str) -> Result<ExecCredential, ConciergeError> {
        let url = self.token_credential_requests_url();
        tracing::debug!(
            url = %url,
            authenticator = %self.authenticator_name,
            "Exchanging token with concierge"
        );

        let response = self
            .http
            .post(&url)
            .json(&self.token_credential_request(token))
            .send()
            .await
            .map_err(ConciergeError::Request)?;
        let status = response.status();
        let body = response.text().await.map_err(ConciergeError::Request)?;
        if !status.is_success() {
            return Err(ConciergeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenCredentialRequest =
            serde_json::from_str(&body).map_err(ConciergeError::Decode)?;
        let result = parsed.status.unwrap_or_default();
        if let Some(message) = result.message {
            return Err(ConciergeError::LoginFailed(message));
        }
        let credential = result.credential.ok_or(ConciergeError::NoCredential)?;

        Ok(ExecCredential::new(ExecCredentialStatus {
            expiration_timestamp: credential.expiration_timestamp,
            token: credential.token,
            client_certificate_data: credential.client_certificate_data,
            client_key_data: credential.client_key_data,
        }))
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConciergeError> {
    if raw.is_empty() {
        return Err(ConciergeError::InvalidEndpoint(
            "endpoint must not be empty".to_string(),
        ));
    }
    let url = Url::parse(raw).map_err(|e| ConciergeError::InvalidEndpoint(e.to_string()))?;
    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(ConciergeError::InvalidEndpoint(format!(
            "unsupported scheme \"{other}\""
        ))),
    }
}

fn is_dns_subdomain(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REQUESTS_PATH: &str =
        "/apis/login.concierge.tollbridge.dev/v1alpha1/namespaces/tollbridge-concierge/tokencredentialrequests";

    fn settings(endpoint: &str) -> ConciergeSettings {
        ConciergeSettings {
            namespace: "tollbridge-concierge".to_string(),
            authenticator_type: "webhook".to_string(),
            authenticator_name: "corp-webhook".to_string(),
            endpoint: endpoint.to_string(),
            ca_bundle_data: String::new(),
            api_group_suffix: "tollbridge.dev".to_string(),
        }
    }

    #[test]
    fn test_authenticator_kind_parse() {
        assert_eq!(AuthenticatorKind::parse("JWT").unwrap(), AuthenticatorKind::Jwt);
        assert_eq!(
            AuthenticatorKind::parse("webhook").unwrap().resource_kind(),
            "WebhookAuthenticator"
        );
        let err = AuthenticatorKind::parse("oidc").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid authenticator type: \"oidc\", supported values are \"webhook\" and \"jwt\""
        );
    }

    #[test]
    fn test_new_validates_parameters() {
        let mut s = settings("https://cluster.example.com");
        s.namespace.clear();
        assert!(matches!(
            ConciergeClient::new(&s).unwrap_err(),
            ConciergeError::EmptyNamespace
        ));

        let mut s = settings("https://cluster.example.com");
        s.authenticator_name.clear();
        assert!(matches!(
            ConciergeClient::new(&s).unwrap_err(),
            ConciergeError::EmptyAuthenticatorName
        ));

        let err = ConciergeClient::new(&settings("")).unwrap_err();
        assert_eq!(err.to_string(), "invalid endpoint: endpoint must not be empty");

        let err = ConciergeClient::new(&settings("ftp://cluster.example.com")).unwrap_err();
        assert!(matches!(err, ConciergeError::InvalidEndpoint(_)));

        let mut s = settings("https://cluster.example.com");
        s.api_group_suffix = "Not_Valid".to_string();
        assert!(matches!(
            ConciergeClient::new(&s).unwrap_err(),
            ConciergeError::InvalidApiGroupSuffix(_)
        ));

        let mut s = settings("https://cluster.example.com");
        s.ca_bundle_data = "%%%".to_string();
        let err = ConciergeClient::new(&s).unwrap_err();
        assert!(matches!(err, ConciergeError::InvalidCaBundle(_)));
    }

    #[test]
    fn test_token_credential_request_shape() {
        let mut s = settings("https://cluster.example.com");
        s.authenticator_type = "jwt".to_string();
        s.api_group_suffix = "example.io".to_string();
        let client = ConciergeClient::new(&s).unwrap();

        let value = serde_json::to_value(client.token_credential_request("tok")).unwrap();
        assert_eq!(
            value,
            json!({
                "apiVersion": "login.concierge.example.io/v1alpha1",
                "kind": "TokenCredentialRequest",
                "metadata": {"namespace": "tollbridge-concierge"},
                "spec": {
                    "token": "tok",
                    "authenticator": {
                        "apiGroup": "authentication.concierge.example.io",
                        "kind": "JWTAuthenticator",
                        "name": "corp-webhook"
                    }
                }
            })
        );
    }

    #[tokio::test]
    async fn test_exchange_token_returns_cluster_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REQUESTS_PATH))
            .and(body_partial_json(json!({
                "spec": {"token": "static-token", "authenticator": {"name": "corp-webhook"}}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "apiVersion": "login.concierge.tollbridge.dev/v1alpha1",
                "kind": "TokenCredentialRequest",
                "metadata": {"namespace": "tollbridge-concierge"},
                "spec": {"token": "", "authenticator": {"apiGroup": "", "kind": "", "name": ""}},
                "status": {
                    "credential": {
                        "expirationTimestamp": "2026-10-18T12:00:00Z",
                        "clientCertificateData": "CERT",
                        "clientKeyData": "KEY"
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ConciergeClient::new(&settings(&server.uri())).unwrap();
        let cred = client.exchange_token("static-token").await.unwrap();
        let status = cred.status.unwrap();
        assert_eq!(status.expiration_timestamp, Some(datetime!(2026-10-18 12:00:00 UTC)));
        assert_eq!(status.client_certificate_data.as_deref(), Some("CERT"));
        assert_eq!(status.client_key_data.as_deref(), Some("KEY"));
        assert!(status.token.is_none());
    }

    #[tokio::test]
    async fn test_exchange_token_reports_login_failure_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REQUESTS_PATH))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "apiVersion": "login.concierge.tollbridge.dev/v1alpha1",
                "kind": "TokenCredentialRequest",
                "metadata": {},
                "spec": {"token": "", "authenticator": {"apiGroup": "", "kind": "", "name": ""}},
                "status": {"message": "authentication failed"}
            })))
            .mount(&server)
            .await;

        let client = ConciergeClient::new(&settings(&server.uri())).unwrap();
        let err = client.exchange_token("bad").await.unwrap_err();
        assert_eq!(err.to_string(), "login failed: authentication failed");
    }

    #[tokio::test]
    async fn test_exchange_token_missing_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REQUESTS_PATH))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "apiVersion": "login.concierge.tollbridge.dev/v1alpha1",
                "kind": "TokenCredentialRequest",
                "metadata": {},
                "spec": {"token": "", "authenticator": {"apiGroup": "", "kind": "", "name": ""}},
                "status": {}
            })))
            .mount(&server)
            .await;

        let client = ConciergeClient::new(&settings(&server.uri())).unwrap();
        let err = client.exchange_token("tok").await.unwrap_err();
        assert!(matches!(err, ConciergeError::NoCredential));
    }

    #[tokio::test]
    async fn test_exchange_token_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REQUESTS_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = ConciergeClient::new(&settings(&server.uri())).unwrap();
        let err = client.exchange_token("tok").await.unwrap_err();
        assert_eq!(err.to_string(), "concierge returned status 403: forbidden");
        assert!(matches!(err, ConciergeError::Status { status: 403, .. }));
    }
}
