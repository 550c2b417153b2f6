//! Upstream token representations.
//!
//! [`OAuth2Token`] is the raw token-endpoint response as returned by any
//! grant. [`Token`] is the normalized, validated triple handed to the rest of
//! the login flow after ID token validation and userinfo merging.

use serde::{Deserialize, Deserializer, Serialize};
use time::{Duration, OffsetDateTime};

use super::claims::Claims;

/// Raw result of a token endpoint call.
///
/// Refresh responses may omit `refresh_token` and `id_token`; those fields are
/// then `None` and the caller decides whether to keep previous values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuth2Token {
    /// The access token.
    pub access_token: String,
    /// Token type, usually `Bearer`.
    pub token_type: String,
    /// Refresh token, if the upstream issued one.
    pub refresh_token: Option<String>,
    /// Absolute access token expiry computed from `expires_in`.
    pub expiry: Option<OffsetDateTime>,
    /// Raw ID token (JWT), if present.
    pub id_token: Option<String>,
}

impl OAuth2Token {
    /// Creates a token carrying only an access token.
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: String::new(),
            refresh_token: None,
            expiry: None,
            id_token: None,
        }
    }

    /// Sets the token type.
    #[must_use]
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// Sets the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets the ID token.
    #[must_use]
    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    /// Sets the expiry.
    #[must_use]
    pub fn with_expiry(mut self, expiry: OffsetDateTime) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

/// Wire format of a successful token endpoint response.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenEndpointResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TokenEndpointResponse {
    pub(crate) fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// Converts the wire response, resolving `expires_in` against `received_at`.
    pub(crate) fn into_token(self, received_at: OffsetDateTime) -> OAuth2Token {
        OAuth2Token {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expiry: self
                .expires_in
                .filter(|secs| *secs > 0)
                .and_then(|secs| received_at.checked_add(Duration::seconds(secs))),
            id_token: self.id_token.filter(|t| !t.is_empty()),
        }
    }
}

/// Some providers send `expires_in` as a JSON string.
fn deserialize_expires_in<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    Ok(
        match Option::<NumberOrString>::deserialize(deserializer)? {
            Some(NumberOrString::Number(n)) => Some(n),
            Some(NumberOrString::String(s)) => s.trim().parse().ok(),
            None => None,
        },
    )
}

/// A validated access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    #[serde(rename = "type", default)]
    pub token_type: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiry: Option<OffsetDateTime>,
}

/// A refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
}

/// A validated ID token with its (possibly userinfo-merged) claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdToken {
    /// Raw JWT; empty when the claims came from userinfo alone.
    pub token: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiry: Option<OffsetDateTime>,
    #[serde(default)]
    pub claims: Claims,
}

/// The normalized token triple of an upstream login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
}

impl Token {
    /// Returns the merged claims, or `None` when no ID token part exists.
    #[must_use]
    pub fn claims(&self) -> Option<&Claims> {
        self.id_token.as_ref().map(|t| &t.claims)
    }
}
