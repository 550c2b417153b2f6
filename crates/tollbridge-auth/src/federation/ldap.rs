//! LDAP and Active Directory upstream providers.
//!
//! A provider authenticates end users against a directory in three steps:
//!
//! 1. bind as the configured service account
//! 2. search for exactly one user entry matching the submitted username
//! 3. bind as that entry with the submitted password
//!
//! On success the user's group memberships are looked up and an
//! [`AuthenticateResponse`] is returned. Unknown users and wrong passwords
//! are not errors: they yield `Ok(None)`.
//!
//! Network access goes through the [`LdapDialer`] and [`LdapConn`] traits so
//! the controller and the tests can substitute their own connections. The
//! production implementation is [`Ldap3Dialer`], built on `ldap3` with a
//! `native-tls` connector.
//!
//! # Security
//!
//! - Empty passwords are rejected before dialing, since many directories
//!   treat them as an unauthenticated bind that succeeds.
//! - Usernames are escaped before being interpolated into search filters.
//! - Connections are always closed, including on error paths.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions};
use time::OffsetDateTime;

use super::session::downstream_subject_from_upstream_ldap;

/// Pseudo attribute name selecting the entry's distinguished name.
pub const DISTINGUISHED_NAME_ATTRIBUTE: &str = "dn";

/// Placeholder replaced by the escaped username or user DN in filters.
pub const FILTER_PLACEHOLDER: &str = "{}";

const DEFAULT_GROUP_SEARCH_FILTER: &str = "member={}";
const INVALID_CREDENTIALS_RESULT_CODE: u32 = 49;
const SIZE_LIMIT_EXCEEDED_RESULT_CODE: u32 = 4;
const USER_SEARCH_SIZE_LIMIT: i32 = 2;

// =============================================================================
// Active Directory defaults
// =============================================================================

/// Default user search filter for Active Directory upstreams.
pub const AD_DEFAULT_USER_SEARCH_FILTER: &str = "(&(objectClass=person)(!(objectClass=computer))(!(showInAdvancedViewOnly=TRUE))(|(sAMAccountName={})(userPrincipalName={})))";
/// Default username attribute for Active Directory upstreams.
pub const AD_DEFAULT_USERNAME_ATTRIBUTE: &str = "userPrincipalName";
/// Default UID attribute for Active Directory upstreams.
pub const AD_DEFAULT_UID_ATTRIBUTE: &str = "objectGUID";
/// Default group search filter for Active Directory upstreams. Uses the
/// in-chain matching rule so nested group memberships are included.
pub const AD_DEFAULT_GROUP_SEARCH_FILTER: &str =
    "(&(objectClass=group)(member:1.2.840.113556.1.4.1941:={}))";
/// Default group name attribute for Active Directory upstreams.
pub const AD_DEFAULT_GROUP_NAME_ATTRIBUTE: &str = "sAMAccountName";

/// The two kinds of directory upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryKind {
    Ldap,
    ActiveDirectory,
}

impl DirectoryKind {
    /// Name of the resource kind configuring upstreams of this kind.
    #[must_use]
    pub fn resource_kind(self) -> &'static str {
        match self {
            Self::Ldap => "LDAPIdentityProvider",
            Self::ActiveDirectory => "ActiveDirectoryIdentityProvider",
        }
    }
}

impl fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ldap => "ldap",
            Self::ActiveDirectory => "active_directory",
        })
    }
}

// =============================================================================
// Connection seam
// =============================================================================

/// Errors raised by a single directory operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LdapConnError {
    #[error("LDAP Result Code 49 \"Invalid Credentials\": {0}")]
    InvalidCredentials(String),

    #[error("{0}")]
    Operation(String),
}

impl LdapConnError {
    /// Returns true if the directory rejected the bind credentials.
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(self, Self::InvalidCredentials(_))
    }
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Only the base entry itself.
    Base,
    /// The base entry and everything below it.
    Subtree,
}

/// A directory search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,
    pub attributes: Vec<String>,
    /// Maximum number of entries to return; `0` means no limit.
    pub size_limit: i32,
}

/// One entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
    /// Attributes whose values are not valid UTF-8.
    pub binary_attributes: HashMap<String, Vec<Vec<u8>>>,
}

impl LdapEntry {
    /// Creates an entry with textual attributes.
    #[must_use]
    pub fn new<I, K, V>(dn: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            dn: dn.into(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into_iter().map(Into::into).collect()))
                .collect(),
            binary_attributes: HashMap::new(),
        }
    }
}

/// An open directory connection.
#[async_trait]
pub trait LdapConn: Send {
    async fn bind(&mut self, username: &str, password: &str) -> Result<(), LdapConnError>;

    async fn search(&mut self, request: SearchRequest) -> Result<Vec<LdapEntry>, LdapConnError>;

    /// Closes the connection. Errors are ignored.
    async fn close(&mut self);
}

/// Opens directory connections.
#[async_trait]
pub trait LdapDialer: Send + Sync {
    async fn dial(
        &self,
        host: &str,
        ca_bundle: Option<&[u8]>,
    ) -> Result<Box<dyn LdapConn>, LdapConnError>;
}

/// Production dialer: LDAPS via `ldap3` and `native-tls`.
#[derive(Debug, Clone)]
pub struct Ldap3Dialer {
    connect_timeout: Duration,
}

impl Default for Ldap3Dialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Ldap3Dialer {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn tls_connector(ca_bundle: &[u8]) -> Result<native_tls::TlsConnector, LdapConnError> {
        let certificates = ca_certificates(ca_bundle);
        if certificates.is_empty() {
            return Err(LdapConnError::Operation(
                "could not parse CA bundle: no certificates found".to_string(),
            ));
        }

        let mut builder = native_tls::TlsConnector::builder();
        builder.disable_built_in_roots(true);
        for certificate in certificates {
            builder.add_root_certificate(certificate);
        }
        builder
            .build()
            .map_err(|e| LdapConnError::Operation(format!("could not build TLS connector: {e}")))
    }
}

/// Parses the certificates of a PEM bundle.
///
/// Blocks that are not tagged `CERTIFICATE`, or whose DER does not parse as a
/// certificate, are skipped. An empty result means the bundle is unusable.
#[must_use]
pub fn ca_certificates(bundle: &[u8]) -> Vec<native_tls::Certificate> {
    pem::parse_many(bundle)
        .unwrap_or_default()
        .iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .filter_map(|block| native_tls::Certificate::from_der(block.contents()).ok())
        .collect()
}

#[async_trait]
impl LdapDialer for Ldap3Dialer {
    async fn dial(
        &self,
        host: &str,
        ca_bundle: Option<&[u8]>,
    ) -> Result<Box<dyn LdapConn>, LdapConnError> {
        let mut settings = LdapConnSettings::new().set_conn_timeout(self.connect_timeout);
        if let Some(ca_bundle) = ca_bundle.filter(|ca| !ca.is_empty()) {
            settings = settings.set_connector(Self::tls_connector(ca_bundle)?);
        }

        let url = format!("ldaps://{host}");
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| LdapConnError::Operation(e.to_string()))?;

        let host = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!(host = %host, error = %e, "LDAP connection terminated");
            }
        });

        Ok(Box::new(Ldap3Conn { ldap }))
    }
}

struct Ldap3Conn {
    ldap: ldap3::Ldap,
}

fn classify_ldap3_error(error: ldap3::LdapError) -> LdapConnError {
    match error {
        ldap3::LdapError::LdapResult { result } if result.rc == INVALID_CREDENTIALS_RESULT_CODE => {
            LdapConnError::InvalidCredentials(result.text)
        }
        other => LdapConnError::Operation(other.to_string()),
    }
}

#[async_trait]
impl LdapConn for Ldap3Conn {
    async fn bind(&mut self, username: &str, password: &str) -> Result<(), LdapConnError> {
        self.ldap
            .simple_bind(username, password)
            .await
            .and_then(|result| result.success())
            .map(|_| ())
            .map_err(classify_ldap3_error)
    }

    async fn search(&mut self, request: SearchRequest) -> Result<Vec<LdapEntry>, LdapConnError> {
        let scope = match request.scope {
            SearchScope::Base => Scope::Base,
            SearchScope::Subtree => Scope::Subtree,
        };
        let ldap3::SearchResult(entries, result) = self
            .ldap
            .with_search_options(SearchOptions::new().sizelimit(request.size_limit))
            .search(&request.base, scope, &request.filter, request.attributes)
            .await
            .map_err(classify_ldap3_error)?;

        if result.rc != 0 && result.rc != SIZE_LIMIT_EXCEEDED_RESULT_CODE {
            return Err(classify_ldap3_error(ldap3::LdapError::LdapResult { result }));
        }

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                LdapEntry {
                    dn: entry.dn,
                    attributes: entry.attrs,
                    binary_attributes: entry.bin_attrs,
                }
            })
            .collect())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            tracing::debug!(error = %e, "LDAP unbind failed");
        }
    }
}

// =============================================================================
// Provider configuration
// =============================================================================

/// Where and how to find user entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSearchConfig {
    pub base: String,
    /// Filter with `{}` placeholders. Empty means `<username attribute>={}`.
    pub filter: String,
    pub username_attribute: String,
    pub uid_attribute: String,
}

/// Where and how to find group memberships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSearchConfig {
    /// Empty disables group lookups.
    pub base: String,
    /// Filter with a `{}` placeholder for the user DN. Empty means `member={}`.
    pub filter: String,
    /// Attribute holding the group name. Empty or `dn` means the entry DN.
    pub group_name_attribute: String,
}

/// Configuration of one directory upstream.
#[derive(Clone)]
pub struct LdapProviderConfig {
    pub name: String,
    pub resource_uid: String,
    /// `host` or `host:port`.
    pub host: String,
    /// PEM bundle of trusted CAs. `None` uses the system roots.
    pub ca_bundle: Option<Vec<u8>>,
    pub bind_username: String,
    pub bind_password: String,
    pub user_search: UserSearchConfig,
    pub group_search: GroupSearchConfig,
    pub dialer: Arc<dyn LdapDialer>,
    /// Upper bound for one whole directory operation.
    pub timeout: Duration,
}

impl LdapProviderConfig {
    /// Creates a config with the given identity and dialer and everything
    /// else empty.
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, dialer: Arc<dyn LdapDialer>) -> Self {
        Self {
            name: name.into(),
            resource_uid: String::new(),
            host: host.into(),
            ca_bundle: None,
            bind_username: String::new(),
            bind_password: String::new(),
            user_search: UserSearchConfig::default(),
            group_search: GroupSearchConfig::default(),
            dialer,
            timeout: Duration::from_secs(30),
        }
    }

    /// Fills empty search settings with Active Directory defaults.
    #[must_use]
    pub fn with_active_directory_defaults(mut self) -> Self {
        fn default_if_empty(value: &mut String, default: &str) {
            if value.is_empty() {
                *value = default.to_string();
            }
        }
        default_if_empty(&mut self.user_search.filter, AD_DEFAULT_USER_SEARCH_FILTER);
        default_if_empty(
            &mut self.user_search.username_attribute,
            AD_DEFAULT_USERNAME_ATTRIBUTE,
        );
        default_if_empty(&mut self.user_search.uid_attribute, AD_DEFAULT_UID_ATTRIBUTE);
        default_if_empty(&mut self.group_search.filter, AD_DEFAULT_GROUP_SEARCH_FILTER);
        default_if_empty(
            &mut self.group_search.group_name_attribute,
            AD_DEFAULT_GROUP_NAME_ATTRIBUTE,
        );
        self
    }
}

impl fmt::Debug for LdapProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapProviderConfig")
            .field("name", &self.name)
            .field("resource_uid", &self.resource_uid)
            .field("host", &self.host)
            .field("ca_bundle", &self.ca_bundle.as_ref().map(Vec::len))
            .field("bind_username", &self.bind_username)
            .field("bind_password", &"[REDACTED]")
            .field("user_search", &self.user_search)
            .field("group_search", &self.group_search)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PartialEq for LdapProviderConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.resource_uid == other.resource_uid
            && self.host == other.host
            && self.ca_bundle == other.ca_bundle
            && self.bind_username == other.bind_username
            && self.bind_password == other.bind_password
            && self.user_search == other.user_search
            && self.group_search == other.group_search
            && self.timeout == other.timeout
            && Arc::ptr_eq(&self.dialer, &other.dialer)
    }
}

// =============================================================================
// Results and errors
// =============================================================================

/// The directory identity of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
}

/// Result of a successful directory login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub user: AuthenticatedUser,
    /// DN of the user entry, kept for refreshes.
    pub dn: String,
    pub extra_refresh_attributes: BTreeMap<String, String>,
}

/// What a downstream session remembers about a directory login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRefreshAttributes {
    pub username: String,
    pub subject: String,
    pub dn: String,
    pub auth_time: OffsetDateTime,
    pub additional_attributes: BTreeMap<String, String>,
}

/// Errors raised by directory providers.
#[derive(Debug, thiserror::Error)]
pub enum LdapError {
    #[error("error dialing host \"{host}\": {source}")]
    Dial {
        host: String,
        #[source]
        source: LdapConnError,
    },

    #[error("error binding as \"{username}\": {source}")]
    Bind {
        username: String,
        #[source]
        source: LdapConnError,
    },

    #[error("error searching for user \"{username}\": {source}")]
    Search {
        username: String,
        #[source]
        source: LdapConnError,
    },

    #[error("searching for user \"{username}\" resulted in {count} search results, but expected 1 result")]
    UnexpectedResultCount { username: String, count: usize },

    #[error(
        "found {count} values for attribute \"{attribute}\" while searching for user \"{username}\", but expected 1 result"
    )]
    AttributeValueCount {
        attribute: String,
        username: String,
        count: usize,
    },

    #[error(
        "found empty value for attribute \"{attribute}\" while searching for user \"{username}\", but expected value to be non-empty"
    )]
    EmptyAttribute { attribute: String, username: String },

    #[error("error binding for user \"{username}\" using provided password against DN \"{dn}\": {source}")]
    UserBind {
        username: String,
        dn: String,
        #[source]
        source: LdapConnError,
    },

    #[error("error searching for group memberships for user with DN \"{dn}\": {source}")]
    GroupSearch {
        dn: String,
        #[source]
        source: LdapConnError,
    },

    #[error(
        "searching for user \"{dn}\" produced a different username than the previous value. expected: \"{expected}\", actual: \"{actual}\""
    )]
    RefreshUsernameChanged {
        dn: String,
        expected: String,
        actual: String,
    },

    #[error(
        "searching for user \"{dn}\" produced a different subject than the previous value. expected: \"{expected}\", actual: \"{actual}\""
    )]
    RefreshSubjectChanged {
        dn: String,
        expected: String,
        actual: String,
    },

    #[error("LDAP operation against \"{host}\" timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

impl LdapError {
    /// Returns true for connectivity problems, as opposed to directory
    /// content problems.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Dial { .. } | Self::Timeout { .. })
    }

    /// Returns true if a previously authenticated identity no longer matches.
    pub fn is_identity_changed(&self) -> bool {
        matches!(
            self,
            Self::RefreshUsernameChanged { .. } | Self::RefreshSubjectChanged { .. }
        )
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Capabilities of a directory upstream as seen by login consumers.
#[async_trait]
pub trait UpstreamLdapIdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    fn resource_uid(&self) -> &str;

    /// Identifies the directory in downstream subjects:
    /// `ldaps://<host>?base=<user search base>`.
    fn url(&self) -> String;

    /// Authenticates a user. `Ok(None)` means unknown user or wrong password.
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticateResponse>, LdapError>;

    /// Checks that a previously authenticated user still exists with the
    /// same username and subject.
    async fn perform_refresh(&self, stored: &StoredRefreshAttributes) -> Result<(), LdapError>;
}

/// A directory upstream built from an [`LdapProviderConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamLdapProvider {
    config: LdapProviderConfig,
}

impl UpstreamLdapProvider {
    #[must_use]
    pub fn new(config: LdapProviderConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &LdapProviderConfig {
        &self.config
    }

    /// Dials the directory and binds as the service account.
    pub async fn test_connection(&self) -> Result<(), LdapError> {
        self.bounded(async {
            let mut conn = self.connect().await?;
            let result = self.bind_service_account(conn.as_mut()).await;
            conn.close().await;
            result
        })
        .await
    }

    async fn connect(&self) -> Result<Box<dyn LdapConn>, LdapError> {
        self.config
            .dialer
            .dial(&self.config.host, self.config.ca_bundle.as_deref())
            .await
            .map_err(|source| LdapError::Dial {
                host: self.config.host.clone(),
                source,
            })
    }

    async fn bounded<T>(
        &self,
        work: impl Future<Output = Result<T, LdapError>>,
    ) -> Result<T, LdapError> {
        tokio::time::timeout(self.config.timeout, work)
            .await
            .map_err(|_| LdapError::Timeout {
                host: self.config.host.clone(),
                timeout: self.config.timeout,
            })?
    }

    async fn bind_service_account(&self, conn: &mut dyn LdapConn) -> Result<(), LdapError> {
        conn.bind(&self.config.bind_username, &self.config.bind_password)
            .await
            .map_err(|source| LdapError::Bind {
                username: self.config.bind_username.clone(),
                source,
            })
    }

    fn user_search_filter(&self, username: &str) -> String {
        let escaped = ldap3::ldap_escape(username);
        let search = &self.config.user_search;
        if search.filter.is_empty() {
            return format!("({}={escaped})", search.username_attribute);
        }
        wrap_filter(search.filter.replace(FILTER_PLACEHOLDER, &escaped))
    }

    fn group_search_filter(&self, user_dn: &str) -> String {
        let escaped = ldap3::ldap_escape(user_dn);
        let filter = if self.config.group_search.filter.is_empty() {
            DEFAULT_GROUP_SEARCH_FILTER
        } else {
            self.config.group_search.filter.as_str()
        };
        wrap_filter(filter.replace(FILTER_PLACEHOLDER, &escaped))
    }

    fn user_attributes(&self) -> Vec<String> {
        let search = &self.config.user_search;
        let mut attributes = Vec::new();
        for attribute in [&search.username_attribute, &search.uid_attribute] {
            if attribute != DISTINGUISHED_NAME_ATTRIBUTE && !attributes.contains(attribute) {
                attributes.push(attribute.clone());
            }
        }
        attributes
    }

    async fn search_user(
        &self,
        conn: &mut dyn LdapConn,
        username: &str,
    ) -> Result<Option<LdapEntry>, LdapError> {
        let request = SearchRequest {
            base: self.config.user_search.base.clone(),
            scope: SearchScope::Subtree,
            filter: self.user_search_filter(username),
            attributes: self.user_attributes(),
            size_limit: USER_SEARCH_SIZE_LIMIT,
        };
        let mut entries = conn
            .search(request)
            .await
            .map_err(|source| LdapError::Search {
                username: username.to_string(),
                source,
            })?;

        match entries.len() {
            0 => Ok(None),
            1 => Ok(entries.pop()),
            count => Err(LdapError::UnexpectedResultCount {
                username: username.to_string(),
                count,
            }),
        }
    }

    async fn search_groups(
        &self,
        conn: &mut dyn LdapConn,
        user_dn: &str,
    ) -> Result<Vec<String>, LdapError> {
        let search = &self.config.group_search;
        if search.base.is_empty() {
            return Ok(Vec::new());
        }

        let name_attribute = if search.group_name_attribute.is_empty() {
            DISTINGUISHED_NAME_ATTRIBUTE
        } else {
            search.group_name_attribute.as_str()
        };
        let attributes = if name_attribute == DISTINGUISHED_NAME_ATTRIBUTE {
            // "1.1" asks the server for no attributes at all.
            vec!["1.1".to_string()]
        } else {
            vec![name_attribute.to_string()]
        };

        let entries = conn
            .search(SearchRequest {
                base: search.base.clone(),
                scope: SearchScope::Subtree,
                filter: self.group_search_filter(user_dn),
                attributes,
                size_limit: 0,
            })
            .await
            .map_err(|source| LdapError::GroupSearch {
                dn: user_dn.to_string(),
                source,
            })?;

        let mut groups = Vec::with_capacity(entries.len());
        for entry in &entries {
            if name_attribute == DISTINGUISHED_NAME_ATTRIBUTE {
                groups.push(entry.dn.clone());
            } else {
                groups.push(single_value(entry, name_attribute, user_dn)?);
            }
        }
        groups.sort();
        Ok(groups)
    }

    fn uid_of(&self, entry: &LdapEntry, username: &str) -> Result<String, LdapError> {
        let attribute = &self.config.user_search.uid_attribute;
        if attribute == DISTINGUISHED_NAME_ATTRIBUTE {
            return Ok(entry.dn.clone());
        }
        match entry.binary_attributes.get(attribute.as_str()) {
            Some(values) if !entry.attributes.contains_key(attribute.as_str()) => {
                let [value] = values.as_slice() else {
                    return Err(LdapError::AttributeValueCount {
                        attribute: attribute.clone(),
                        username: username.to_string(),
                        count: values.len(),
                    });
                };
                if attribute.eq_ignore_ascii_case(AD_DEFAULT_UID_ATTRIBUTE)
                    && let Some(guid) = format_guid(value)
                {
                    return Ok(guid);
                }
                Ok(STANDARD.encode(value))
            }
            _ => single_value(entry, attribute, username),
        }
    }

    fn username_of(&self, entry: &LdapEntry, username: &str) -> Result<String, LdapError> {
        let attribute = &self.config.user_search.username_attribute;
        if attribute == DISTINGUISHED_NAME_ATTRIBUTE {
            return Ok(entry.dn.clone());
        }
        single_value(entry, attribute, username)
    }

    async fn authenticate_with(
        &self,
        conn: &mut dyn LdapConn,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticateResponse>, LdapError> {
        self.bind_service_account(conn).await?;

        let Some(entry) = self.search_user(conn, username).await? else {
            tracing::debug!(upstream = %self.config.name, "LDAP user not found");
            return Ok(None);
        };

        let mapped_username = self.username_of(&entry, username)?;
        let uid = self.uid_of(&entry, username)?;

        match conn.bind(&entry.dn, password).await {
            Ok(()) => {}
            Err(e) if e.is_invalid_credentials() => {
                tracing::debug!(upstream = %self.config.name, "LDAP user bind rejected");
                return Ok(None);
            }
            Err(source) => {
                return Err(LdapError::UserBind {
                    username: username.to_string(),
                    dn: entry.dn,
                    source,
                });
            }
        }

        // Group lookups run with the service account's permissions.
        self.bind_service_account(conn).await?;
        let groups = self.search_groups(conn, &entry.dn).await?;

        Ok(Some(AuthenticateResponse {
            user: AuthenticatedUser {
                username: mapped_username,
                uid,
                groups,
            },
            dn: entry.dn,
            extra_refresh_attributes: BTreeMap::new(),
        }))
    }

    async fn refresh_with(
        &self,
        conn: &mut dyn LdapConn,
        stored: &StoredRefreshAttributes,
    ) -> Result<(), LdapError> {
        self.bind_service_account(conn).await?;

        let mut entries = conn
            .search(SearchRequest {
                base: stored.dn.clone(),
                scope: SearchScope::Base,
                filter: "(objectClass=*)".to_string(),
                attributes: self.user_attributes(),
                size_limit: USER_SEARCH_SIZE_LIMIT,
            })
            .await
            .map_err(|source| LdapError::Search {
                username: stored.dn.clone(),
                source,
            })?;
        if entries.len() != 1 {
            return Err(LdapError::UnexpectedResultCount {
                username: stored.dn.clone(),
                count: entries.len(),
            });
        }
        let Some(entry) = entries.pop() else {
            return Err(LdapError::UnexpectedResultCount {
                username: stored.dn.clone(),
                count: 0,
            });
        };

        let username = self.username_of(&entry, &stored.dn)?;
        if username != stored.username {
            return Err(LdapError::RefreshUsernameChanged {
                dn: stored.dn.clone(),
                expected: stored.username.clone(),
                actual: username,
            });
        }

        let uid = self.uid_of(&entry, &stored.dn)?;
        let subject = downstream_subject_from_upstream_ldap(&self.url(), &uid);
        if subject != stored.subject {
            return Err(LdapError::RefreshSubjectChanged {
                dn: stored.dn.clone(),
                expected: stored.subject.clone(),
                actual: subject,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamLdapIdentityProvider for UpstreamLdapProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn resource_uid(&self) -> &str {
        &self.config.resource_uid
    }

    fn url(&self) -> String {
        let base: String =
            url::form_urlencoded::byte_serialize(self.config.user_search.base.as_bytes()).collect();
        format!("ldaps://{}?base={base}", self.config.host)
    }

    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticateResponse>, LdapError> {
        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }
        self.bounded(async {
            let mut conn = self.connect().await?;
            let result = self.authenticate_with(conn.as_mut(), username, password).await;
            conn.close().await;
            result
        })
        .await
    }

    async fn perform_refresh(&self, stored: &StoredRefreshAttributes) -> Result<(), LdapError> {
        self.bounded(async {
            let mut conn = self.connect().await?;
            let result = self.refresh_with(conn.as_mut(), stored).await;
            conn.close().await;
            result
        })
        .await
    }
}

fn wrap_filter(filter: String) -> String {
    if filter.starts_with('(') && filter.ends_with(')') {
        filter
    } else {
        format!("({filter})")
    }
}

fn single_value(entry: &LdapEntry, attribute: &str, username: &str) -> Result<String, LdapError> {
    let values = entry
        .attributes
        .get(attribute)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let [value] = values else {
        return Err(LdapError::AttributeValueCount {
            attribute: attribute.to_string(),
            username: username.to_string(),
            count: values.len(),
        });
    };
    if value.is_empty() {
        return Err(LdapError::EmptyAttribute {
            attribute: attribute.to_string(),
            username: username.to_string(),
        });
    }
    Ok(value.clone())
}

/// Formats a 16 byte Active Directory `objectGUID` in its usual textual form.
fn format_guid(bytes: &[u8]) -> Option<String> {
    let b: &[u8; 16] = bytes.try_into().ok()?;
    Some(format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory directory. Binds succeed when the password matches; searches
    /// return the entries registered for their base.
    #[derive(Default)]
    struct FakeDirectory {
        passwords: HashMap<String, String>,
        entries: HashMap<String, Vec<LdapEntry>>,
        fail_dial: bool,
        log: Mutex<Vec<String>>,
        searches: Mutex<Vec<SearchRequest>>,
    }

    impl FakeDirectory {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    struct FakeConn(Arc<FakeDirectory>);

    #[async_trait]
    impl LdapConn for FakeConn {
        async fn bind(&mut self, username: &str, password: &str) -> Result<(), LdapConnError> {
            self.0.log.lock().unwrap().push(format!("bind {username}"));
            match self.0.passwords.get(username) {
                Some(expected) if expected == password => Ok(()),
                Some(_) => Err(LdapConnError::InvalidCredentials(String::new())),
                None => Err(LdapConnError::Operation("no such object".to_string())),
            }
        }

        async fn search(&mut self, request: SearchRequest) -> Result<Vec<LdapEntry>, LdapConnError> {
            self.0.log.lock().unwrap().push(format!("search {}", request.base));
            self.0.searches.lock().unwrap().push(request.clone());
            Ok(self.0.entries.get(&request.base).cloned().unwrap_or_default())
        }

        async fn close(&mut self) {
            self.0.log.lock().unwrap().push("close".to_string());
        }
    }

    struct FakeDialer(Arc<FakeDirectory>);

    #[async_trait]
    impl LdapDialer for FakeDialer {
        async fn dial(
            &self,
            _host: &str,
            _ca_bundle: Option<&[u8]>,
        ) -> Result<Box<dyn LdapConn>, LdapConnError> {
            self.0.log.lock().unwrap().push("dial".to_string());
            if self.0.fail_dial {
                return Err(LdapConnError::Operation("connection refused".to_string()));
            }
            Ok(Box::new(FakeConn(self.0.clone())))
        }
    }

    const SERVICE_DN: &str = "cn=svc,dc=example,dc=com";
    const USER_DN: &str = "uid=pat,ou=people,dc=example,dc=com";

    fn directory() -> FakeDirectory {
        let mut directory = FakeDirectory::default();
        directory.passwords.insert(SERVICE_DN.into(), "svc-pass".into());
        directory.passwords.insert(USER_DN.into(), "pat-pass".into());
        directory.entries.insert(
            "ou=people,dc=example,dc=com".into(),
            vec![LdapEntry::new(
                USER_DN,
                [("uid", vec!["pat"]), ("uidNumber", vec!["1001"])],
            )],
        );
        directory.entries.insert(
            "ou=groups,dc=example,dc=com".into(),
            vec![
                LdapEntry::new("cn=ops,ou=groups", [("cn", vec!["ops"])]),
                LdapEntry::new("cn=dev,ou=groups", [("cn", vec!["dev"])]),
            ],
        );
        directory
    }

    fn provider(directory: FakeDirectory) -> (UpstreamLdapProvider, Arc<FakeDirectory>) {
        let directory = Arc::new(directory);
        let mut config = LdapProviderConfig::new(
            "corp-ldap",
            "ldap.example.com:636",
            Arc::new(FakeDialer(directory.clone())),
        );
        config.bind_username = SERVICE_DN.into();
        config.bind_password = "svc-pass".into();
        config.user_search = UserSearchConfig {
            base: "ou=people,dc=example,dc=com".into(),
            filter: String::new(),
            username_attribute: "uid".into(),
            uid_attribute: "uidNumber".into(),
        };
        config.group_search = GroupSearchConfig {
            base: "ou=groups,dc=example,dc=com".into(),
            filter: String::new(),
            group_name_attribute: "cn".into(),
        };
        (UpstreamLdapProvider::new(config), directory)
    }

    #[tokio::test]
    async fn test_authenticate_user_success() {
        let (provider, directory) = provider(directory());

        let response = provider
            .authenticate_user("pat", "pat-pass")
            .await
            .unwrap()
            .expect("user should be found");

        assert_eq!(response.user.username, "pat");
        assert_eq!(response.user.uid, "1001");
        assert_eq!(response.user.groups, vec!["dev", "ops"]);
        assert_eq!(response.dn, USER_DN);
        assert_eq!(directory.log().last().map(String::as_str), Some("close"));

        let searches = directory.searches.lock().unwrap().clone();
        assert_eq!(searches[0].filter, "(uid=pat)");
        assert_eq!(searches[0].size_limit, 2);
        assert_eq!(searches[1].filter, format!("(member={})", ldap3::ldap_escape(USER_DN)));
    }

    #[tokio::test]
    async fn test_authenticate_user_wrong_password_is_not_found() {
        let (provider, directory) = provider(directory());

        let response = provider.authenticate_user("pat", "wrong").await.unwrap();

        assert!(response.is_none());
        assert_eq!(directory.log().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_authenticate_user_unknown_user_is_not_found() {
        let mut dir = directory();
        dir.entries.remove("ou=people,dc=example,dc=com");
        let (provider, _) = provider(dir);

        assert!(provider.authenticate_user("nobody", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_user_empty_password_never_dials() {
        let (provider, directory) = provider(directory());

        assert!(provider.authenticate_user("pat", "").await.unwrap().is_none());
        assert!(directory.log().is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_user_ambiguous_search() {
        let mut dir = directory();
        dir.entries.insert(
            "ou=people,dc=example,dc=com".into(),
            vec![
                LdapEntry::new("uid=a", [("uid", vec!["pat"]), ("uidNumber", vec!["1"])]),
                LdapEntry::new("uid=b", [("uid", vec!["pat"]), ("uidNumber", vec!["2"])]),
            ],
        );
        let (provider, directory) = provider(dir);

        let err = provider.authenticate_user("pat", "pat-pass").await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "searching for user \"pat\" resulted in 2 search results, but expected 1 result"
        );
        assert_eq!(directory.log().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_authenticate_user_service_bind_failure() {
        let mut dir = directory();
        dir.passwords.insert(SERVICE_DN.into(), "rotated".into());
        let (provider, directory) = provider(dir);

        let err = provider.authenticate_user("pat", "pat-pass").await.unwrap_err();

        assert!(matches!(err, LdapError::Bind { .. }));
        assert!(err.to_string().starts_with(&format!("error binding as \"{SERVICE_DN}\"")));
        assert_eq!(directory.log(), vec!["dial".to_string(), format!("bind {SERVICE_DN}"), "close".to_string()]);
    }

    #[tokio::test]
    async fn test_authenticate_user_missing_attribute() {
        let mut dir = directory();
        dir.entries.insert(
            "ou=people,dc=example,dc=com".into(),
            vec![LdapEntry::new(USER_DN, [("uid", vec!["pat"])])],
        );
        let (provider, _) = provider(dir);

        let err = provider.authenticate_user("pat", "pat-pass").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "found 0 values for attribute \"uidNumber\" while searching for user \"pat\", but expected 1 result"
        );
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let mut dir = directory();
        dir.fail_dial = true;
        let (provider, _) = provider(dir);

        let err = provider.test_connection().await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(
            err.to_string(),
            "error dialing host \"ldap.example.com:636\": connection refused"
        );
    }

    #[tokio::test]
    async fn test_test_connection_binds_and_closes() {
        let (provider, directory) = provider(directory());

        provider.test_connection().await.unwrap();

        assert_eq!(directory.log(), vec!["dial".to_string(), format!("bind {SERVICE_DN}"), "close".to_string()]);
    }

    #[tokio::test]
    async fn test_group_names_default_to_dn() {
        let (mut provider, _) = provider(directory());
        provider.config.group_search.group_name_attribute = String::new();

        let response = provider
            .authenticate_user("pat", "pat-pass")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.user.groups, vec!["cn=dev,ou=groups", "cn=ops,ou=groups"]);
    }

    #[tokio::test]
    async fn test_perform_refresh() {
        let mut dir = directory();
        dir.entries.insert(
            USER_DN.into(),
            vec![LdapEntry::new(
                USER_DN,
                [("uid", vec!["pat"]), ("uidNumber", vec!["1001"])],
            )],
        );
        let (provider, _) = provider(dir);
        let stored = StoredRefreshAttributes {
            username: "pat".into(),
            subject: downstream_subject_from_upstream_ldap(&provider.url(), "1001"),
            dn: USER_DN.into(),
            auth_time: OffsetDateTime::now_utc(),
            additional_attributes: BTreeMap::new(),
        };

        provider.perform_refresh(&stored).await.unwrap();

        let renamed = StoredRefreshAttributes {
            username: "patricia".into(),
            ..stored.clone()
        };
        let err = provider.perform_refresh(&renamed).await.unwrap_err();
        assert!(err.is_identity_changed());

        let other_subject = StoredRefreshAttributes {
            subject: "ldaps://elsewhere?sub=1001".into(),
            ..stored
        };
        let err = provider.perform_refresh(&other_subject).await.unwrap_err();
        assert!(matches!(err, LdapError::RefreshSubjectChanged { .. }));
    }

    #[test]
    fn test_url_escapes_base() {
        let (provider, _) = provider(directory());
        assert_eq!(
            provider.url(),
            "ldaps://ldap.example.com:636?base=ou%3Dpeople%2Cdc%3Dexample%2Cdc%3Dcom"
        );
    }

    #[test]
    fn test_user_search_filter() {
        let (mut provider, _) = provider(directory());
        assert_eq!(provider.user_search_filter("a*b"), "(uid=a\\2ab)");

        provider.config.user_search.filter = "&(objectClass=person)(mail={})".into();
        assert_eq!(
            provider.user_search_filter("pat"),
            "(&(objectClass=person)(mail=pat))"
        );
    }

    #[test]
    fn test_active_directory_defaults_fill_only_empty_fields() {
        let dialer: Arc<dyn LdapDialer> = Arc::new(Ldap3Dialer::default());
        let mut config = LdapProviderConfig::new("ad", "dc.example.com", dialer);
        config.user_search.username_attribute = "sAMAccountName".into();

        let config = config.with_active_directory_defaults();

        assert_eq!(config.user_search.username_attribute, "sAMAccountName");
        assert_eq!(config.user_search.uid_attribute, AD_DEFAULT_UID_ATTRIBUTE);
        assert_eq!(config.user_search.filter, AD_DEFAULT_USER_SEARCH_FILTER);
        assert_eq!(config.group_search.filter, AD_DEFAULT_GROUP_SEARCH_FILTER);
        assert_eq!(
            config.group_search.group_name_attribute,
            AD_DEFAULT_GROUP_NAME_ATTRIBUTE
        );
    }

    #[test]
    fn test_format_guid() {
        let bytes = [
            0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        assert_eq!(
            format_guid(&bytes).as_deref(),
            Some("00112233-4455-6677-8899-aabbccddeeff")
        );
        assert_eq!(format_guid(&[1, 2, 3]), None);
    }

    #[test]
    fn test_config_equality_compares_dialer_identity() {
        let dialer: Arc<dyn LdapDialer> = Arc::new(Ldap3Dialer::default());
        let a = LdapProviderConfig::new("x", "h", dialer.clone());
        let b = LdapProviderConfig::new("x", "h", dialer);
        let c = LdapProviderConfig::new("x", "h", Arc::new(Ldap3Dialer::default()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_debug_redacts_password() {
        let (provider, _) = provider(directory());
        let debug = format!("{:?}", provider.config());
        assert!(!debug.contains("svc-pass"));
        assert!(debug.contains("[REDACTED]"));
    }
}
