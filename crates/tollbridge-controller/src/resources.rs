//! Resource model for directory upstreams and their bind secrets.
//!
//! Resources serialize in camelCase so they read the same whether they come
//! from a configuration file or from an API server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

/// Secret type holding `username` and `password` keys.
pub const SECRET_TYPE_BASIC_AUTH: &str = "kubernetes.io/basic-auth";
/// Key of the bind username in a basic-auth secret.
pub const SECRET_USERNAME_KEY: &str = "username";
/// Key of the bind password in a basic-auth secret.
pub const SECRET_PASSWORD_KEY: &str = "password";

/// Identity and versioning metadata shared by every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// Incremented on every spec change.
    pub generation: i64,
    /// Opaque version, changed on every write.
    pub resource_version: String,
}

/// A directory upstream resource (`LDAPIdentityProvider` or
/// `ActiveDirectoryIdentityProvider`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectoryIdentityProvider {
    pub metadata: ObjectMeta,
    pub spec: DirectoryProviderSpec,
    pub status: DirectoryProviderStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectoryProviderSpec {
    /// `host` or `host:port` of the directory server.
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
    pub bind: BindSpec,
    pub user_search: UserSearchSpec,
    pub group_search: GroupSearchSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSpec {
    /// Base64 encoded PEM bundle of trusted CAs.
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindSpec {
    /// Name of a basic-auth secret in the resource's namespace.
    pub secret_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSearchSpec {
    pub base: String,
    pub filter: String,
    pub attributes: UserSearchAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSearchAttributes {
    pub username: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSearchSpec {
    pub base: String,
    pub filter: String,
    pub attributes: GroupSearchAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSearchAttributes {
    pub group_name: String,
}

/// Overall health of a directory upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Ready,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectoryProviderStatus {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A secret. Values are raw bytes; in serialized form they are plain strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(rename = "type")]
    pub secret_type: String,
    #[serde(with = "string_values")]
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Builds a basic-auth secret.
    #[must_use]
    pub fn basic_auth(
        namespace: impl Into<String>,
        name: impl Into<String>,
        resource_version: impl Into<String>,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                resource_version: resource_version.into(),
                ..ObjectMeta::default()
            },
            secret_type: SECRET_TYPE_BASIC_AUTH.to_string(),
            data: BTreeMap::from([
                (SECRET_USERNAME_KEY.to_string(), username.as_bytes().to_vec()),
                (SECRET_PASSWORD_KEY.to_string(), password.as_bytes().to_vec()),
            ]),
        }
    }
}

mod string_values {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        data: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        data.iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(v)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let data = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(data.into_iter().map(|(k, v)| (k, v.into_bytes())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_round_trips_camel_case() {
        let value = json!({
            "metadata": {"name": "corp", "namespace": "tollbridge", "generation": 3},
            "spec": {
                "host": "ldap.example.com:636",
                "tls": {"certificateAuthorityData": "Zm9v"},
                "bind": {"secretName": "corp-bind"},
                "userSearch": {
                    "base": "ou=people",
                    "attributes": {"username": "uid", "uid": "uidNumber"}
                },
                "groupSearch": {"base": "ou=groups", "attributes": {"groupName": "cn"}}
            }
        });

        let provider: DirectoryIdentityProvider = serde_json::from_value(value).unwrap();

        assert_eq!(provider.metadata.generation, 3);
        assert_eq!(provider.spec.bind.secret_name, "corp-bind");
        assert_eq!(
            provider.spec.tls.as_ref().map(|t| t.certificate_authority_data.as_str()),
            Some("Zm9v")
        );
        assert_eq!(provider.spec.user_search.attributes.uid, "uidNumber");
        assert_eq!(provider.status.phase, Phase::Pending);

        let out = serde_json::to_value(&provider).unwrap();
        assert_eq!(out["spec"]["groupSearch"]["attributes"]["groupName"], "cn");
    }

    #[test]
    fn test_secret_data_is_plain_strings() {
        let secret: Secret = serde_json::from_value(json!({
            "metadata": {"name": "bind", "namespace": "ns", "resourceVersion": "7"},
            "type": "kubernetes.io/basic-auth",
            "data": {"username": "cn=svc", "password": "pw"}
        }))
        .unwrap();

        assert_eq!(
            secret,
            Secret::basic_auth("ns", "bind", "7", "cn=svc", "pw")
        );
    }
}
