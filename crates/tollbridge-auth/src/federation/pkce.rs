//! PKCE verifiers and nonces for upstream authorization requests.
//!
//! Tollbridge acts as an OAuth client towards upstream providers, so unlike a
//! server-side PKCE implementation it generates verifiers and later replays
//! them in the token request. Values that come back from the (already
//! decoded) state parameter are accepted verbatim.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sha2::{Digest, Sha256};

use super::claims::{Claims, NONCE_CLAIM};

// =============================================================================
// PKCE
// =============================================================================

/// A PKCE code verifier sent to the upstream token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceCode(String);

impl PkceCode {
    /// Generates a random verifier from 32 random bytes (43 base64url chars).
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::thread_rng().r#gen();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// The S256 challenge: `BASE64URL(SHA256(verifier))`.
    #[must_use]
    pub fn challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.0.as_bytes()))
    }

    /// The challenge method paired with [`challenge`](Self::challenge).
    #[must_use]
    pub fn method(&self) -> &'static str {
        "S256"
    }

    /// The verifier value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PkceCode {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PkceCode {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// Verifiers are secrets; keep them out of logs.
impl fmt::Debug for PkceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PkceCode(..)")
    }
}

// =============================================================================
// Nonce
// =============================================================================

/// The nonce bound to an upstream authorization request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nonce(String);

/// The ID token nonce did not match the expected value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid nonce (expected {expected:?}, got {actual:?})")]
pub struct NonceMismatch {
    pub expected: String,
    pub actual: String,
}

impl Nonce {
    /// Generates a random nonce (16 random bytes, hex encoded).
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::thread_rng().r#gen();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// An empty nonce disables nonce checking.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns `true` if no nonce was sent with the authorization request.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The nonce value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks the `nonce` claim of a validated ID token.
    ///
    /// # Errors
    ///
    /// Returns [`NonceMismatch`] if the claim is missing, not a string, or different.
    pub fn validate(&self, claims: &Claims) -> Result<(), NonceMismatch> {
        let actual = claims.str_or_empty(NONCE_CLAIM);
        if actual == self.0 {
            Ok(())
        } else {
            Err(NonceMismatch {
                expected: self.0.clone(),
                actual: actual.to_string(),
            })
        }
    }
}

impl From<String> for Nonce {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Nonce {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_verifier_shape() {
        let code = PkceCode::generate();
        assert_eq!(code.as_str().len(), 43);
        assert_ne!(code, PkceCode::generate());
        assert_eq!(code.method(), "S256");
        assert_eq!(format!("{code:?}"), "PkceCode(..)");
    }

    #[test]
    fn test_rfc7636_challenge_vector() {
        // RFC 7636 Appendix B.
        let code = PkceCode::from("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(
            code.challenge(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_nonce_validation() {
        let claims: Claims = serde_json::from_value(json!({"nonce": "some-nonce"})).unwrap();

        assert!(Nonce::from("some-nonce").validate(&claims).is_ok());

        let err = Nonce::from("some-other-nonce").validate(&claims).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"invalid nonce (expected "some-other-nonce", got "some-nonce")"#
        );
    }

    #[test]
    fn test_generated_nonce() {
        let nonce = Nonce::generate();
        assert_eq!(nonce.as_str().len(), 32);
        assert!(!nonce.is_empty());
        assert!(Nonce::empty().is_empty());
    }
}
