//! Ordered claim bags.
//!
//! Upstream ID tokens and userinfo responses carry arbitrary JSON claims.
//! [`Claims`] keeps them in insertion order and offers typed accessors that
//! fail explicitly when a claim exists but has an unexpected JSON type.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the issuer claim.
pub const ISSUER_CLAIM: &str = "iss";

/// Name of the subject claim.
pub const SUBJECT_CLAIM: &str = "sub";

/// Name of the nonce claim.
pub const NONCE_CLAIM: &str = "nonce";

/// Name of the access token hash claim.
pub const ACCESS_TOKEN_HASH_CLAIM: &str = "at_hash";

/// A claim was present but did not have the requested JSON type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("claim '{claim}' is not a {expected}")]
pub struct ClaimTypeError {
    /// The claim name.
    pub claim: String,
    /// The JSON type that was expected.
    pub expected: &'static str,
}

/// An ordered mapping of claim names to JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(IndexMap<String, Value>);

impl Claims {
    /// Creates an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object into claims.
    ///
    /// # Errors
    ///
    /// Returns the serde error if `bytes` is not a JSON object.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Returns the raw value of a claim.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Returns `true` if the claim is present (even when its value is `null`).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Returns a string claim.
    ///
    /// `Ok(None)` means the claim is absent.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimTypeError`] if the claim exists but is not a string.
    pub fn get_str(&self, name: &str) -> Result<Option<&str>, ClaimTypeError> {
        match self.0.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(ClaimTypeError {
                claim: name.to_string(),
                expected: "string",
            }),
        }
    }

    /// Returns a boolean claim.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimTypeError`] if the claim exists but is not a boolean.
    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, ClaimTypeError> {
        match self.0.get(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(ClaimTypeError {
                claim: name.to_string(),
                expected: "boolean",
            }),
        }
    }

    /// Returns a numeric claim as `i64` (JSON numbers with a fraction are
    /// truncated, as seen with some providers' `exp` values).
    ///
    /// # Errors
    ///
    /// Returns [`ClaimTypeError`] if the claim exists but is not a number.
    pub fn get_i64(&self, name: &str) -> Result<Option<i64>, ClaimTypeError> {
        match self.0.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))),
            Some(_) => Err(ClaimTypeError {
                claim: name.to_string(),
                expected: "number",
            }),
        }
    }

    /// Returns the string claim, or an empty string when absent or not a string.
    #[must_use]
    pub fn str_or_empty(&self, name: &str) -> &str {
        self.get_str(name).ok().flatten().unwrap_or_default()
    }

    /// Sets a claim, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Removes a claim, keeping the order of the remaining claims.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.shift_remove(name)
    }

    /// Copies every claim of `other` over this set. Existing keys keep their
    /// position but take the value from `other`.
    pub fn merge_from(&mut self, other: Claims) {
        for (name, value) in other.0 {
            self.0.insert(name, value);
        }
    }

    /// Iterates over claims in order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no claims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Claims {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<serde_json::Map<String, Value>> for Claims {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        map.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_typed_accessors() {
        let c = claims(json!({
            "iss": "https://issuer",
            "email_verified": true,
            "exp": 1.61021969e+09,
            "groups": ["a"]
        }));

        assert_eq!(c.get_str("iss").unwrap(), Some("https://issuer"));
        assert_eq!(c.get_str("missing").unwrap(), None);
        assert_eq!(c.get_bool("email_verified").unwrap(), Some(true));
        assert_eq!(c.get_i64("exp").unwrap(), Some(1_610_219_690));

        let err = c.get_str("groups").unwrap_err();
        assert_eq!(err.claim, "groups");
        assert_eq!(err.to_string(), "claim 'groups' is not a string");
        assert!(c.get_bool("iss").is_err());
    }

    #[test]
    fn test_merge_overrides_and_keeps_order() {
        let mut base = claims(json!({"iss": "a", "sub": "s", "name": "old"}));
        base.merge_from(claims(json!({"name": "new", "email": "e@example.com"})));

        let keys: Vec<_> = base.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["iss", "sub", "name", "email"]);
        assert_eq!(base.str_or_empty("name"), "new");
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut c = claims(json!({"a": 1, "b": 2, "c": 3}));
        assert_eq!(c.remove("b"), Some(json!(2)));
        let keys: Vec<_> = c.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_from_json_slice_rejects_non_objects() {
        assert!(Claims::from_json_slice(br#"{"sub":"x"}"#).is_ok());
        assert!(Claims::from_json_slice(b"invalid-json-data").is_err());
        assert!(Claims::from_json_slice(b"[1,2]").is_err());
    }
}
