//! Test doubles shared by the federation unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::decode_header;
use serde_json::Value;
use time::OffsetDateTime;

use super::claims::Claims;
use super::provider::{OidcProviderBackend, ProviderError, UserInfo, VerifiedIdToken};

/// Builds an unsigned compact JWT with an `RS256` header.
pub(crate) fn fake_jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

/// A backend that trusts any structurally valid JWT and serves canned
/// userinfo responses.
pub(crate) struct FakeBackend {
    raw_discovery: Vec<u8>,
    userinfo: Mutex<Option<Result<UserInfo, String>>>,
    userinfo_calls: AtomicUsize,
}

impl FakeBackend {
    /// A provider without a userinfo endpoint.
    pub(crate) fn new() -> Self {
        Self {
            raw_discovery: b"{}".to_vec(),
            userinfo: Mutex::new(None),
            userinfo_calls: AtomicUsize::new(0),
        }
    }

    /// Advertises a userinfo endpoint that answers with `subject` and `claims`.
    pub(crate) fn with_userinfo(self, subject: &str, claims: &str) -> Self {
        self.with_userinfo_result(Ok(UserInfo {
            subject: subject.to_string(),
            claims: claims.as_bytes().to_vec(),
        }))
    }

    /// Advertises a userinfo endpoint with an explicit outcome.
    pub(crate) fn with_userinfo_result(mut self, result: Result<UserInfo, String>) -> Self {
        self.raw_discovery = br#"{"userinfo_endpoint": "not-empty"}"#.to_vec();
        self.userinfo = Mutex::new(Some(result));
        self
    }

    /// Replaces the raw discovery document.
    pub(crate) fn with_raw_discovery(mut self, raw: &[u8]) -> Self {
        self.raw_discovery = raw.to_vec();
        self
    }

    pub(crate) fn userinfo_calls(&self) -> usize {
        self.userinfo_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OidcProviderBackend for FakeBackend {
    async fn verify_id_token(&self, raw: &str) -> Result<VerifiedIdToken, ProviderError> {
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(ProviderError::MalformedJwt(
                "compact JWS format must have three parts".to_string(),
            ));
        }
        let header = decode_header(raw).map_err(|e| ProviderError::MalformedJwt(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|e| ProviderError::MalformedJwt(e.to_string()))?;
        let claims =
            Claims::from_json_slice(&payload).map_err(|e| ProviderError::MalformedJwt(e.to_string()))?;
        let expiry = claims
            .get_i64("exp")
            .ok()
            .flatten()
            .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok());

        Ok(VerifiedIdToken {
            claims,
            algorithm: header.alg,
            expiry,
        })
    }

    fn userinfo_endpoint(&self) -> Result<Option<String>, serde_json::Error> {
        let raw: Value = serde_json::from_slice(&self.raw_discovery)?;
        Ok(raw
            .get("userinfo_endpoint")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .map(str::to_string))
    }

    async fn fetch_userinfo(&self, _access_token: &str) -> Result<UserInfo, ProviderError> {
        self.userinfo_calls.fetch_add(1, Ordering::SeqCst);
        match self.userinfo.lock().unwrap().clone() {
            Some(Ok(info)) => Ok(info),
            Some(Err(e)) => Err(ProviderError::UserInfo(e)),
            None => Err(ProviderError::UserInfo("no userinfo configured".to_string())),
        }
    }
}
