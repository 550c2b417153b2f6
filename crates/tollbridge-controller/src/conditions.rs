//! Status conditions for directory upstream resources.
//!
//! A pass computes a fresh set of conditions for the steps it evaluated.
//! [`merge_conditions`] folds that set into the previously stored one so
//! `lastTransitionTime` only moves when a condition actually flips.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::resources::Phase;

// =============================================================================
// Condition types and reasons
// =============================================================================

pub const TYPE_BIND_SECRET_VALID: &str = "BindSecretValid";
pub const TYPE_TLS_CONFIGURATION_VALID: &str = "TLSConfigurationValid";
pub const TYPE_LDAP_CONNECTION_VALID: &str = "LDAPConnectionValid";

pub const REASON_SUCCESS: &str = "Success";
pub const REASON_SECRET_NOT_FOUND: &str = "SecretNotFound";
pub const REASON_SECRET_WRONG_TYPE: &str = "SecretWrongType";
pub const REASON_SECRET_MISSING_KEYS: &str = "SecretMissingKeys";
pub const REASON_INVALID_TLS_CONFIG: &str = "InvalidTLSConfig";
pub const REASON_LDAP_CONNECTION_ERROR: &str = "LDAPConnectionError";

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// One observed aspect of a resource's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_transition_time: OffsetDateTime,
    pub reason: String,
    pub message: String,
}

impl Condition {
    /// A `True` condition with reason `Success`.
    #[must_use]
    pub fn success(condition_type: &str, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::True, REASON_SUCCESS, message)
    }

    /// A `False` condition with the given reason.
    #[must_use]
    pub fn failure(condition_type: &str, reason: &str, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::False, reason, message)
    }

    fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            observed_generation: 0,
            last_transition_time: OffsetDateTime::UNIX_EPOCH,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Finds a condition by type.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Merges freshly computed conditions into the previously stored ones.
///
/// The result holds exactly the fresh conditions, sorted by type. Each one
/// gets `observed_generation` set to `generation`. A condition keeps the
/// previous `last_transition_time` when its status did not change and gets
/// `now` otherwise.
#[must_use]
pub fn merge_conditions(
    previous: &[Condition],
    fresh: Vec<Condition>,
    generation: i64,
    now: OffsetDateTime,
) -> Vec<Condition> {
    let mut merged: Vec<Condition> = fresh
        .into_iter()
        .map(|mut c| {
            c.observed_generation = generation;
            c.last_transition_time = match find_condition(previous, &c.condition_type) {
                Some(old) if old.status == c.status => old.last_transition_time,
                _ => now,
            };
            c
        })
        .collect();
    merged.sort_by(|a, b| a.condition_type.cmp(&b.condition_type));
    merged
}

/// `Ready` when every condition is `True`, `Error` otherwise.
#[must_use]
pub fn phase_for(conditions: &[Condition]) -> Phase {
    if conditions.iter().all(Condition::is_true) {
        Phase::Ready
    } else {
        Phase::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_merge_sorts_and_stamps() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let merged = merge_conditions(
            &[],
            vec![
                Condition::success(TYPE_TLS_CONFIGURATION_VALID, "loaded TLS configuration"),
                Condition::success(TYPE_BIND_SECRET_VALID, "loaded bind secret"),
            ],
            7,
            now,
        );

        let types: Vec<_> = merged.iter().map(|c| c.condition_type.as_str()).collect();
        assert_eq!(types, vec![TYPE_BIND_SECRET_VALID, TYPE_TLS_CONFIGURATION_VALID]);
        assert!(merged.iter().all(|c| c.observed_generation == 7));
        assert!(merged.iter().all(|c| c.last_transition_time == now));
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let earlier = datetime!(2024-01-01 0:00 UTC);
        let now = datetime!(2024-05-01 12:00 UTC);
        let previous = merge_conditions(
            &[],
            vec![
                Condition::success(TYPE_BIND_SECRET_VALID, "loaded bind secret"),
                Condition::success(TYPE_LDAP_CONNECTION_VALID, "ok"),
            ],
            1,
            earlier,
        );

        let merged = merge_conditions(
            &previous,
            vec![
                Condition::success(TYPE_BIND_SECRET_VALID, "loaded bind secret"),
                Condition::failure(TYPE_LDAP_CONNECTION_VALID, REASON_LDAP_CONNECTION_ERROR, "boom"),
            ],
            2,
            now,
        );

        assert_eq!(merged[0].last_transition_time, earlier);
        assert_eq!(merged[1].last_transition_time, now);
        assert_eq!(merged[1].observed_generation, 2);
    }

    #[test]
    fn test_stale_condition_types_are_dropped() {
        let previous = merge_conditions(
            &[],
            vec![Condition::success(TYPE_LDAP_CONNECTION_VALID, "ok")],
            1,
            OffsetDateTime::UNIX_EPOCH,
        );
        let merged = merge_conditions(
            &previous,
            vec![Condition::failure(TYPE_BIND_SECRET_VALID, REASON_SECRET_NOT_FOUND, "gone")],
            1,
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_eq!(merged.len(), 1);
        assert!(find_condition(&merged, TYPE_LDAP_CONNECTION_VALID).is_none());
    }

    #[test]
    fn test_phase() {
        let ok = Condition::success(TYPE_BIND_SECRET_VALID, "x");
        let bad = Condition::failure(TYPE_LDAP_CONNECTION_VALID, REASON_LDAP_CONNECTION_ERROR, "y");
        assert_eq!(phase_for(&[ok.clone()]), Phase::Ready);
        assert_eq!(phase_for(&[ok, bad]), Phase::Error);
    }

    #[test]
    fn test_serializes_like_api_conditions() {
        let mut c = Condition::success(TYPE_BIND_SECRET_VALID, "loaded bind secret");
        c.observed_generation = 3;
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["type"], "BindSecretValid");
        assert_eq!(value["status"], "True");
        assert_eq!(value["observedGeneration"], 3);
        assert_eq!(value["lastTransitionTime"], "1970-01-01T00:00:00Z");
    }
}
