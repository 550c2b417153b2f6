//! Login consumers of the upstream registry.
//!
//! [`UpstreamLoginService`] completes downstream logins against whichever
//! upstreams are currently registered. Each call reads one registry snapshot
//! and works on it until it returns, so a controller replacing the provider
//! lists mid-login never affects a login in progress.
//!
//! Three flows are supported:
//!
//! - the OIDC authorization code callback
//! - OIDC resource owner password logins (when the upstream allows it)
//! - LDAP and Active Directory password logins
//!
//! Every failure is a [`LoginError`] carrying the HTTP status the endpoint
//! should answer with.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use super::claims::Claims;
use super::ldap::{DirectoryKind, LdapError, StoredRefreshAttributes};
use super::oidc::{OidcClientError, UpstreamOidcIdentityProvider};
use super::pkce::{Nonce, PkceCode};
use super::registry::UpstreamRegistry;
use super::session::{
    DownstreamSession, UnprocessableClaims, downstream_subject_from_upstream_ldap,
    get_groups_from_upstream_id_token, get_subject_and_username_from_upstream_id_token,
    make_downstream_session,
};
use super::token::Token;

/// The only supported upstream state format version.
pub const STATE_FORMAT_VERSION: &str = "1";

/// The decoded `state` parameter of an upstream authorization request.
///
/// Encoding, signing and encryption of the parameter happen at the HTTP
/// layer; this is what it carries once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamStateParam {
    /// The original downstream authorization request parameters.
    #[serde(rename = "p")]
    pub auth_params: String,
    #[serde(rename = "n")]
    pub nonce: String,
    #[serde(rename = "c")]
    pub csrf_token: String,
    #[serde(rename = "k")]
    pub pkce_code: String,
    #[serde(rename = "v")]
    pub format_version: String,
}

/// Errors that end a login attempt.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("code param not found")]
    MissingCode,

    #[error("state format version is invalid")]
    InvalidStateVersion,

    #[error("upstream provider not found")]
    UpstreamNotFound,

    #[error("CSRF cookie is missing")]
    MissingCsrfCookie,

    #[error("CSRF value does not match")]
    CsrfMismatch,

    #[error("resource owner password credentials grant is not allowed for this upstream provider")]
    PasswordGrantNotAllowed,

    #[error("username/password combination was incorrect")]
    InvalidCredentials,

    #[error("error exchanging and validating upstream tokens")]
    UpstreamExchange(#[source] OidcClientError),

    #[error("unexpected error during upstream directory authentication")]
    DirectoryAuthentication(#[source] LdapError),

    #[error(transparent)]
    Claims(#[from] UnprocessableClaims),
}

impl LoginError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCode | Self::PasswordGrantNotAllowed => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::MissingCsrfCookie | Self::CsrfMismatch => StatusCode::FORBIDDEN,
            Self::InvalidStateVersion | Self::UpstreamNotFound => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Claims(e) => e.status(),
            Self::UpstreamExchange(_) | Self::DirectoryAuthentication(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns true if the upstream, not the end user, caused the failure.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamExchange(_) | Self::DirectoryAuthentication(_)
        )
    }

    /// The plain-text response body: `"<Status Text>: <message>\n"`.
    #[must_use]
    pub fn body(&self) -> String {
        let status = self.status();
        format!("{}: {}\n", status.canonical_reason().unwrap_or(""), self)
    }
}

impl IntoResponse for LoginError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = ?self, status = %status, "Upstream login failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Login rejected");
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );

        (status, headers, self.body()).into_response()
    }
}

/// A completed OIDC login.
#[derive(Debug, Clone)]
pub struct OidcLogin {
    pub session: DownstreamSession,
    /// Validated upstream tokens, kept for later refresh and revocation.
    pub upstream_tokens: Token,
}

/// A completed directory login.
#[derive(Debug, Clone)]
pub struct DirectoryLogin {
    pub session: DownstreamSession,
    pub refresh_attributes: StoredRefreshAttributes,
}

/// Completes logins against the registered upstreams.
#[derive(Debug, Clone)]
pub struct UpstreamLoginService {
    registry: Arc<UpstreamRegistry>,
}

impl UpstreamLoginService {
    #[must_use]
    pub fn new(registry: Arc<UpstreamRegistry>) -> Self {
        Self { registry }
    }

    fn oidc_provider(
        &self,
        upstream_name: &str,
    ) -> Result<Arc<dyn UpstreamOidcIdentityProvider>, LoginError> {
        let providers = self.registry.oidc_providers();
        providers
            .iter()
            .find(|p| p.name() == upstream_name)
            .cloned()
            .ok_or(LoginError::UpstreamNotFound)
    }

    /// Handles the redirect back from an upstream authorization endpoint.
    ///
    /// `state` is the already decoded state parameter and `csrf_cookie` the
    /// decoded CSRF cookie value, if the request had one.
    pub async fn oidc_callback(
        &self,
        upstream_name: &str,
        code: &str,
        state: &UpstreamStateParam,
        csrf_cookie: Option<&str>,
        redirect_uri: &str,
    ) -> Result<OidcLogin, LoginError> {
        if code.is_empty() {
            return Err(LoginError::MissingCode);
        }
        let cookie = csrf_cookie
            .filter(|c| !c.is_empty())
            .ok_or(LoginError::MissingCsrfCookie)?;
        if state.format_version != STATE_FORMAT_VERSION {
            return Err(LoginError::InvalidStateVersion);
        }
        if cookie != state.csrf_token {
            return Err(LoginError::CsrfMismatch);
        }

        // The upstream is only looked up once the request itself checks out.
        let provider = self.oidc_provider(upstream_name)?;

        let tokens = provider
            .exchange_authcode_and_validate_tokens(
                code,
                &PkceCode::from(state.pkce_code.as_str()),
                &Nonce::from(state.nonce.as_str()),
                redirect_uri,
            )
            .await
            .map_err(LoginError::UpstreamExchange)?;

        let session = session_from_tokens(provider.as_ref(), &tokens)?;
        tracing::info!(
            upstream = %upstream_name,
            subject = %session.subject,
            "Completed upstream OIDC login"
        );
        Ok(OidcLogin {
            session,
            upstream_tokens: tokens,
        })
    }

    /// Logs a user in with the OIDC password grant.
    pub async fn oidc_password_login(
        &self,
        upstream_name: &str,
        username: &str,
        password: &str,
    ) -> Result<OidcLogin, LoginError> {
        let provider = self.oidc_provider(upstream_name)?;
        if !provider.allows_password_grant() {
            return Err(LoginError::PasswordGrantNotAllowed);
        }
        if username.is_empty() || password.is_empty() {
            return Err(LoginError::InvalidCredentials);
        }

        let tokens = provider
            .password_credentials_grant_and_validate_tokens(username, password)
            .await
            .map_err(|e| {
                if e.is_invalid_grant() {
                    LoginError::InvalidCredentials
                } else {
                    LoginError::UpstreamExchange(e)
                }
            })?;

        let session = session_from_tokens(provider.as_ref(), &tokens)?;
        Ok(OidcLogin {
            session,
            upstream_tokens: tokens,
        })
    }

    /// Logs a user in against an LDAP or Active Directory upstream.
    pub async fn directory_password_login(
        &self,
        kind: DirectoryKind,
        upstream_name: &str,
        username: &str,
        password: &str,
    ) -> Result<DirectoryLogin, LoginError> {
        let providers = self.registry.directory_providers(kind);
        let provider = providers
            .iter()
            .find(|p| p.name() == upstream_name)
            .ok_or(LoginError::UpstreamNotFound)?;

        let response = provider
            .authenticate_user(username, password)
            .await
            .map_err(LoginError::DirectoryAuthentication)?
            .ok_or(LoginError::InvalidCredentials)?;

        let subject = downstream_subject_from_upstream_ldap(&provider.url(), &response.user.uid);
        let session = make_downstream_session(
            subject.clone(),
            response.user.username.clone(),
            Some(response.user.groups),
        );
        tracing::info!(
            upstream = %upstream_name,
            kind = %kind,
            subject = %subject,
            "Completed upstream directory login"
        );

        Ok(DirectoryLogin {
            refresh_attributes: StoredRefreshAttributes {
                username: response.user.username,
                subject,
                dn: response.dn,
                auth_time: session.auth_time,
                additional_attributes: response.extra_refresh_attributes,
            },
            session,
        })
    }
}

fn session_from_tokens(
    provider: &dyn UpstreamOidcIdentityProvider,
    tokens: &Token,
) -> Result<DownstreamSession, LoginError> {
    let empty = Claims::new();
    let claims = tokens.claims().unwrap_or(&empty);
    let (subject, username) = get_subject_and_username_from_upstream_id_token(provider, claims)?;
    let groups = get_groups_from_upstream_id_token(provider, claims)?;
    Ok(make_downstream_session(subject, username, Some(groups)))
}
