//! Controller error types.

use thiserror::Error;

/// Errors raised by resource and secret stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} \"{namespace}/{name}\" not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("conflict updating {kind} \"{namespace}/{name}\": {message}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors returned by a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The pass completed but some resource needs another attempt soon.
    #[error("synthetic requeue request")]
    SyntheticRequeue,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Whether the runner should retry with backoff.
    #[must_use]
    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::SyntheticRequeue)
    }
}

pub type ReconcileResult<T = ()> = Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            ReconcileError::SyntheticRequeue.to_string(),
            "synthetic requeue request"
        );
        let err = StoreError::NotFound {
            kind: "LDAPIdentityProvider",
            namespace: "ns".into(),
            name: "corp".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "LDAPIdentityProvider \"ns/corp\" not found");
        assert!(!ReconcileError::from(err).is_requeue());
    }
}
