//! `ExecCredential` documents printed for client-go exec credential plugins.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const EXEC_CREDENTIAL_KIND: &str = "ExecCredential";
pub const EXEC_CREDENTIAL_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    pub kind: String,
    pub api_version: String,
    #[serde(default)]
    pub spec: ExecCredentialSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecCredentialStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecCredentialSpec {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiration_timestamp: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

impl ExecCredential {
    #[must_use]
    pub fn new(status: ExecCredentialStatus) -> Self {
        Self {
            kind: EXEC_CREDENTIAL_KIND.to_string(),
            api_version: EXEC_CREDENTIAL_API_VERSION.to_string(),
            spec: ExecCredentialSpec::default(),
            status: Some(status),
        }
    }

    /// A credential carrying a bearer token and nothing else.
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(ExecCredentialStatus {
            token: Some(token.into()),
            ..ExecCredentialStatus::default()
        })
    }
}
