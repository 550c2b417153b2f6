//! Downstream session construction.
//!
//! Once an upstream login succeeds, the validated upstream claims are mapped to
//! a downstream identity:
//!
//! - the subject is `<upstream issuer>?sub=<query-escaped upstream subject>`,
//!   which is globally unique because `sub` is only unique per issuer
//! - the username comes from the configured username claim, or is the subject
//! - groups come from the configured groups claim
//!
//! Claim problems are reported as [`UnprocessableClaims`] (HTTP 422).

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use super::claims::{Claims, ISSUER_CLAIM, SUBJECT_CLAIM};
use super::oidc::UpstreamOidcIdentityProvider;

/// Extra claim carrying the downstream username.
pub const DOWNSTREAM_USERNAME_CLAIM: &str = "username";

/// Extra claim carrying the downstream groups.
pub const DOWNSTREAM_GROUPS_CLAIM: &str = "groups";

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const SCOPE_REQUEST_AUDIENCE: &str = "tollbridge:request-audience";

const EMAIL_CLAIM: &str = "email";
const EMAIL_VERIFIED_CLAIM: &str = "email_verified";

/// Upstream claims that cannot be mapped to a downstream identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnprocessableClaims {
    #[error("issuer claim in upstream ID token missing")]
    IssuerMissing,

    #[error("issuer claim in upstream ID token has invalid format")]
    IssuerInvalidFormat,

    #[error("no subject claim in upstream ID token")]
    SubjectMissing,

    #[error("subject claim in upstream ID token has invalid format")]
    SubjectInvalidFormat,

    #[error("email_verified claim in upstream ID token has invalid format")]
    EmailVerifiedInvalidFormat,

    #[error("email_verified claim in upstream ID token has false value")]
    EmailNotVerified,

    #[error("no username claim in upstream ID token")]
    UsernameMissing,

    #[error("username claim in upstream ID token has invalid format")]
    UsernameInvalidFormat,

    #[error("groups claim in upstream ID token has invalid format")]
    GroupsInvalidFormat,
}

impl UnprocessableClaims {
    /// Always `422 Unprocessable Entity`.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::UNPROCESSABLE_ENTITY
    }
}

/// An authenticated downstream session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamSession {
    pub subject: String,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub auth_time: OffsetDateTime,
    /// Extra ID token claims (`username`, `groups`).
    pub extra: Claims,
}

impl DownstreamSession {
    /// The downstream username.
    #[must_use]
    pub fn username(&self) -> &str {
        self.extra.str_or_empty(DOWNSTREAM_USERNAME_CLAIM)
    }

    /// The downstream groups.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        match self.extra.get(DOWNSTREAM_GROUPS_CLAIM) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|g| g.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Creates a downstream session. `requested_at` and `auth_time` are now.
#[must_use]
pub fn make_downstream_session(
    subject: impl Into<String>,
    username: impl Into<String>,
    groups: Option<Vec<String>>,
) -> DownstreamSession {
    let now = OffsetDateTime::now_utc();
    let mut extra = Claims::new();
    extra.insert(DOWNSTREAM_USERNAME_CLAIM, username.into());
    extra.insert(DOWNSTREAM_GROUPS_CLAIM, groups.unwrap_or_default());

    DownstreamSession {
        subject: subject.into(),
        requested_at: now,
        auth_time: now,
        extra,
    }
}

/// An authorization request whose scopes can be granted.
pub trait AuthorizeRequester {
    fn requested_scopes(&self) -> &[String];
    fn granted_scopes(&self) -> &[String];
    fn grant_scope(&mut self, scope: &str);
}

/// A plain [`AuthorizeRequester`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub requested_scopes: Vec<String>,
    pub granted_scopes: Vec<String>,
}

impl AuthorizeRequest {
    #[must_use]
    pub fn new<I, S>(requested: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            requested_scopes: requested.into_iter().map(Into::into).collect(),
            granted_scopes: Vec::new(),
        }
    }
}

impl AuthorizeRequester for AuthorizeRequest {
    fn requested_scopes(&self) -> &[String] {
        &self.requested_scopes
    }

    fn granted_scopes(&self) -> &[String] {
        &self.granted_scopes
    }

    fn grant_scope(&mut self, scope: &str) {
        if !self.granted_scopes.iter().any(|s| s == scope) {
            self.granted_scopes.push(scope.to_string());
        }
    }
}

fn grant_scope_if_requested(request: &mut dyn AuthorizeRequester, scope: &str) {
    if request.requested_scopes().iter().any(|s| s == scope) {
        request.grant_scope(scope);
    }
}

/// Grants the scopes that need no end-user approval, if they were requested.
pub fn grant_scopes_if_requested(request: &mut dyn AuthorizeRequester) {
    grant_scope_if_requested(request, SCOPE_OPENID);
    grant_scope_if_requested(request, SCOPE_OFFLINE_ACCESS);
    grant_scope_if_requested(request, SCOPE_REQUEST_AUDIENCE);
}

/// Derives the downstream subject and username from upstream ID token claims.
///
/// # Errors
///
/// Returns [`UnprocessableClaims`] when `iss`, `sub` or the username claim is
/// absent or not a string, or when a configured `email` username has an
/// `email_verified` claim that is not `true`.
pub fn get_subject_and_username_from_upstream_id_token(
    provider: &dyn UpstreamOidcIdentityProvider,
    claims: &Claims,
) -> Result<(String, String), UnprocessableClaims> {
    let upstream = provider.name();

    let issuer = match claims.get(ISSUER_CLAIM) {
        None => {
            tracing::warn!(upstream, "issuer claim in upstream ID token missing");
            return Err(UnprocessableClaims::IssuerMissing);
        }
        Some(Value::String(iss)) if iss.is_empty() => {
            tracing::warn!(upstream, "issuer claim in upstream ID token missing");
            return Err(UnprocessableClaims::IssuerMissing);
        }
        Some(Value::String(iss)) => iss,
        Some(other) => {
            tracing::warn!(upstream, iss = %other, "issuer claim in upstream ID token has invalid format");
            return Err(UnprocessableClaims::IssuerInvalidFormat);
        }
    };

    let upstream_subject = match claims.get(SUBJECT_CLAIM) {
        None => {
            tracing::warn!(upstream, "no subject claim in upstream ID token");
            return Err(UnprocessableClaims::SubjectMissing);
        }
        Some(Value::String(sub)) => sub,
        Some(_) => {
            tracing::warn!(upstream, "subject claim in upstream ID token has invalid format");
            return Err(UnprocessableClaims::SubjectInvalidFormat);
        }
    };

    let subject = downstream_subject_from_upstream_oidc(issuer, upstream_subject);

    let Some(username_claim) = provider.username_claim().filter(|c| !c.is_empty()) else {
        return Ok((subject.clone(), subject));
    };

    if username_claim == EMAIL_CLAIM {
        match claims.get(EMAIL_VERIFIED_CLAIM) {
            None | Some(Value::Bool(true)) => {}
            Some(Value::Bool(false)) => {
                tracing::warn!(
                    upstream,
                    configured_username_claim = username_claim,
                    "username claim configured as \"email\" and upstream email_verified claim has false value"
                );
                return Err(UnprocessableClaims::EmailNotVerified);
            }
            Some(other) => {
                tracing::warn!(
                    upstream,
                    configured_username_claim = username_claim,
                    email_verified = %other,
                    "username claim configured as \"email\" and upstream email_verified claim is not a boolean"
                );
                return Err(UnprocessableClaims::EmailVerifiedInvalidFormat);
            }
        }
    }

    match claims.get(username_claim) {
        None => {
            tracing::warn!(
                upstream,
                configured_username_claim = username_claim,
                "no username claim in upstream ID token"
            );
            Err(UnprocessableClaims::UsernameMissing)
        }
        Some(Value::String(username)) => Ok((subject, username.clone())),
        Some(_) => {
            tracing::warn!(
                upstream,
                configured_username_claim = username_claim,
                "username claim in upstream ID token has invalid format"
            );
            Err(UnprocessableClaims::UsernameInvalidFormat)
        }
    }
}

/// Extracts downstream groups from upstream ID token claims.
///
/// A missing claim (or no configured claim) yields no groups. A string is a
/// single group; an array must contain only strings, and empty strings are
/// dropped.
///
/// # Errors
///
/// Returns [`UnprocessableClaims::GroupsInvalidFormat`] for any other shape.
pub fn get_groups_from_upstream_id_token(
    provider: &dyn UpstreamOidcIdentityProvider,
    claims: &Claims,
) -> Result<Vec<String>, UnprocessableClaims> {
    let Some(groups_claim) = provider.groups_claim().filter(|c| !c.is_empty()) else {
        return Ok(Vec::new());
    };

    let Some(value) = claims.get(groups_claim) else {
        // The upstream may omit the claim for users without groups.
        tracing::warn!(
            upstream = provider.name(),
            configured_groups_claim = groups_claim,
            "no groups claim in upstream ID token"
        );
        return Ok(Vec::new());
    };

    extract_groups(value).ok_or_else(|| {
        tracing::warn!(
            upstream = provider.name(),
            configured_groups_claim = groups_claim,
            "groups claim in upstream ID token has invalid format"
        );
        UnprocessableClaims::GroupsInvalidFormat
    })
}

fn extract_groups(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(group) => Some(vec![group.clone()]),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(g) if g.is_empty() => None,
                Value::String(g) => Some(Some(g.clone())),
                _ => Some(None),
            })
            .collect(),
        _ => None,
    }
}

fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// `<issuer>?sub=<query-escaped subject>`.
#[must_use]
pub fn downstream_subject_from_upstream_oidc(upstream_issuer: &str, upstream_subject: &str) -> String {
    format!(
        "{upstream_issuer}?{SUBJECT_CLAIM}={}",
        query_escape(upstream_subject)
    )
}

/// `<ldap url>?sub=<query-escaped uid>` for directory logins. The LDAP URL
/// already carries the user search base as a query parameter.
#[must_use]
pub fn downstream_subject_from_upstream_ldap(ldap_url: &str, uid: &str) -> String {
    let separator = if ldap_url.contains('?') { '&' } else { '?' };
    format!("{ldap_url}{separator}{SUBJECT_CLAIM}={}", query_escape(uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::federation::oidc::{UpstreamOidcClient, UpstreamOidcConfig};
    use crate::federation::testing::FakeBackend;
    use serde_json::json;
    use url::Url;

    fn provider(username_claim: Option<&str>, groups_claim: Option<&str>) -> UpstreamOidcClient {
        let config = UpstreamOidcConfig {
            name: "upstream".to_string(),
            resource_uid: "uid".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            authorization_url: Url::parse("https://idp.example.com/authorize").unwrap(),
            token_url: Url::parse("https://idp.example.com/token").unwrap(),
            revocation_url: None,
            scopes: vec!["openid".to_string()],
            username_claim: username_claim.map(str::to_string),
            groups_claim: groups_claim.map(str::to_string),
            additional_authcode_params: BTreeMap::new(),
            allow_password_grant: false,
        };
        UpstreamOidcClient::new(config, Arc::new(FakeBackend::new()), reqwest::Client::new())
    }

    fn claims(value: Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_make_downstream_session() {
        let session = make_downstream_session("sub", "user", None);
        assert_eq!(session.subject, "sub");
        assert_eq!(session.username(), "user");
        assert!(session.groups().is_empty());
        assert_eq!(session.extra.get("groups"), Some(&json!([])));
        assert_eq!(session.requested_at, session.auth_time);

        let session = make_downstream_session("sub", "user", Some(vec!["a".into(), "b".into()]));
        assert_eq!(session.groups(), vec!["a", "b"]);
    }

    #[test]
    fn test_grant_scopes_if_requested() {
        let mut request = AuthorizeRequest::new(["openid", "profile", SCOPE_REQUEST_AUDIENCE]);
        grant_scopes_if_requested(&mut request);
        assert_eq!(request.granted_scopes, vec!["openid", SCOPE_REQUEST_AUDIENCE]);

        let mut request = AuthorizeRequest::new(["offline_access"]);
        grant_scopes_if_requested(&mut request);
        grant_scopes_if_requested(&mut request);
        assert_eq!(request.granted_scopes, vec!["offline_access"]);
    }

    #[test]
    fn test_subject_is_issuer_plus_escaped_sub() {
        let p = provider(None, None);
        let (subject, username) = get_subject_and_username_from_upstream_id_token(
            &p,
            &claims(json!({"iss": "https://issuer", "sub": "a b/c?d"})),
        )
        .unwrap();
        assert_eq!(subject, "https://issuer?sub=a+b%2Fc%3Fd");
        assert_eq!(username, subject);
    }

    #[test]
    fn test_subject_and_username_errors() {
        let p = provider(Some("name"), None);
        let cases = [
            (json!({"sub": "s"}), UnprocessableClaims::IssuerMissing),
            (json!({"iss": "", "sub": "s"}), UnprocessableClaims::IssuerMissing),
            (json!({"iss": 1, "sub": "s"}), UnprocessableClaims::IssuerInvalidFormat),
            (json!({"iss": "i"}), UnprocessableClaims::SubjectMissing),
            (json!({"iss": "i", "sub": 42}), UnprocessableClaims::SubjectInvalidFormat),
            (json!({"iss": "i", "sub": "s"}), UnprocessableClaims::UsernameMissing),
            (json!({"iss": "i", "sub": "s", "name": ["x"]}), UnprocessableClaims::UsernameInvalidFormat),
        ];
        for (input, want) in cases {
            let err = get_subject_and_username_from_upstream_id_token(&p, &claims(input)).unwrap_err();
            assert_eq!(err, want);
            assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }
    }

    #[test]
    fn test_email_username_requires_verified_email() {
        let p = provider(Some("email"), None);

        let ok = get_subject_and_username_from_upstream_id_token(
            &p,
            &claims(json!({"iss": "i", "sub": "s", "email": "pat@example.com", "email_verified": true})),
        )
        .unwrap();
        assert_eq!(ok.1, "pat@example.com");

        // Absent email_verified is accepted.
        assert!(
            get_subject_and_username_from_upstream_id_token(
                &p,
                &claims(json!({"iss": "i", "sub": "s", "email": "pat@example.com"})),
            )
            .is_ok()
        );

        let err = get_subject_and_username_from_upstream_id_token(
            &p,
            &claims(json!({"iss": "i", "sub": "s", "email": "pat@example.com", "email_verified": false})),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "email_verified claim in upstream ID token has false value");

        let err = get_subject_and_username_from_upstream_id_token(
            &p,
            &claims(json!({"iss": "i", "sub": "s", "email": "pat@example.com", "email_verified": "yes"})),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "email_verified claim in upstream ID token has invalid format");

        // email_verified only matters for the email claim.
        let p = provider(Some("name"), None);
        assert!(
            get_subject_and_username_from_upstream_id_token(
                &p,
                &claims(json!({"iss": "i", "sub": "s", "name": "pat", "email_verified": false})),
            )
            .is_ok()
        );
    }

    #[test]
    fn test_groups_shapes() {
        let p = provider(None, Some("groups"));

        let get = |value: Value| get_groups_from_upstream_id_token(&p, &claims(value));

        assert_eq!(get(json!({})).unwrap(), Vec::<String>::new());
        assert_eq!(get(json!({"groups": "admins"})).unwrap(), vec!["admins"]);
        assert_eq!(
            get(json!({"groups": ["a", "", "b"]})).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(get(json!({"groups": [""]})).unwrap(), Vec::<String>::new());
        assert_eq!(
            get(json!({"groups": ["a", 1]})).unwrap_err().to_string(),
            "groups claim in upstream ID token has invalid format"
        );
        assert_eq!(
            get(json!({"groups": {"a": 1}})).unwrap_err(),
            UnprocessableClaims::GroupsInvalidFormat
        );
    }

    #[test]
    fn test_groups_claim_not_configured() {
        let p = provider(None, None);
        let groups =
            get_groups_from_upstream_id_token(&p, &claims(json!({"groups": ["ignored"]}))).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_ldap_subject() {
        assert_eq!(
            downstream_subject_from_upstream_ldap("ldaps://ldap.example.com?base=ou%3Dusers", "u 1"),
            "ldaps://ldap.example.com?base=ou%3Dusers&sub=u+1"
        );
        assert_eq!(
            downstream_subject_from_upstream_ldap("ldaps://ldap.example.com", "u1"),
            "ldaps://ldap.example.com?sub=u1"
        );
    }
}
