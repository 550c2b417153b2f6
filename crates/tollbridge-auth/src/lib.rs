//! # tollbridge-auth
//!
//! Upstream identity federation core for Tollbridge.
//!
//! This crate provides:
//! - A lock-free registry of the currently configured upstream providers
//! - An upstream OpenID Connect client with authcode, password, refresh and
//!   revocation support
//! - LDAP and Active Directory upstream providers
//! - Downstream session derivation with claim mapping rules
//! - Login consumers that complete downstream logins
//!
//! ## Overview
//!
//! Controllers (see `tollbridge-controller`) and the supervisor publish
//! provider lists into an [`UpstreamRegistry`]. Login consumers take one
//! snapshot of the registry per request, exchange credentials with the chosen
//! upstream and turn the validated upstream identity into a
//! [`DownstreamSession`].
//!
//! ## Modules
//!
//! - [`config`] - Federation settings and static OIDC upstream settings
//! - [`federation`] - Upstream providers, registry, sessions and login flows

pub mod config;
pub mod federation;

pub use config::{ConfigError, FederationConfig, OidcUpstreamSettings};
pub use federation::{
    Claims, DirectoryKind, DownstreamSession, LdapError, LoginError, OidcClientError,
    UnprocessableClaims, UpstreamLdapIdentityProvider, UpstreamLdapProvider, UpstreamLoginService,
    UpstreamOidcClient, UpstreamOidcIdentityProvider, UpstreamRegistry,
};

/// Type alias for login results.
pub type LoginResult<T> = Result<T, LoginError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tollbridge_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::LoginResult;
    pub use crate::config::{ConfigError, FederationConfig, OidcUpstreamSettings};
    pub use crate::federation::{
        AuthenticateResponse, Claims, DirectoryKind, DownstreamSession, LdapDialer, LdapError,
        LdapProviderConfig, LoginError, Nonce, OidcClientError, PkceCode,
        StoredRefreshAttributes, Token, UnprocessableClaims, UpstreamLdapIdentityProvider,
        UpstreamLdapProvider, UpstreamLoginService, UpstreamOidcClient,
        UpstreamOidcIdentityProvider, UpstreamRegistry,
    };
}
