//! Upstream identity provider federation.
//!
//! This module connects downstream logins to upstream identity providers:
//!
//! - OpenID Connect discovery, JWKS caching and ID token verification
//! - the upstream OIDC client (authcode, password grant, refresh, revocation)
//! - LDAP and Active Directory upstreams
//! - the shared registry of currently configured upstreams
//! - downstream session derivation from upstream identities
//! - login consumers tying the pieces together

pub mod claims;
pub mod discovery;
pub mod jwks;
pub mod ldap;
pub mod login;
pub mod oidc;
pub mod pkce;
pub mod provider;
pub mod registry;
pub mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use claims::{ClaimTypeError, Claims};
pub use discovery::{DiscoveryDocument, DiscoveryError, OidcDiscoveryClient, ProviderMetadata};
pub use jwks::{JwksError, ProviderJwksCache, ProviderJwksCacheConfig};
pub use ldap::{
    AuthenticateResponse, AuthenticatedUser, DirectoryKind, ca_certificates, GroupSearchConfig, Ldap3Dialer,
    LdapConn, LdapConnError, LdapDialer, LdapEntry, LdapError, LdapProviderConfig,
    SearchRequest, SearchScope, StoredRefreshAttributes, UpstreamLdapIdentityProvider,
    UpstreamLdapProvider, UserSearchConfig,
};
pub use login::{
    DirectoryLogin, LoginError, OidcLogin, UpstreamLoginService, UpstreamStateParam,
};
pub use oidc::{
    OidcClientError, RevocationError, UpstreamOidcClient, UpstreamOidcConfig,
    UpstreamOidcIdentityProvider, UserInfoError, build_http_client,
    extract_upstream_subject_from_downstream,
};
pub use pkce::{Nonce, NonceMismatch, PkceCode};
pub use provider::{DiscoveredProvider, OidcProviderBackend, ProviderError, UserInfo, VerifiedIdToken};
pub use registry::{DirectoryProviders, OidcProviders, UpstreamRegistry};
pub use session::{
    AuthorizeRequest, AuthorizeRequester, DownstreamSession, UnprocessableClaims,
    downstream_subject_from_upstream_ldap, downstream_subject_from_upstream_oidc,
    get_groups_from_upstream_id_token, get_subject_and_username_from_upstream_id_token,
    grant_scopes_if_requested, make_downstream_session,
};
pub use token::{AccessToken, IdToken, OAuth2Token, RefreshToken, Token};
