//! Authentication module for Wizpix

pub mod cookies;
#[cfg(test)]
mod edge_case_tests;
pub mod keys;
pub mod middleware;
pub mod password;
pub mod tokens;

pub use cookies::{CookiePolicy, REFRESH_COOKIE};
pub use keys::{KeyProvider, KeyUnavailable, PemFileKeyProvider, StaticKeyProvider};
pub use middleware::{
    client_meta, extract_bearer_token, extract_ip_address, extract_refresh_cookie, require_auth,
    AuthError, AuthState, AuthUser,
};
pub use password::{hash_password, verify_password};
pub use tokens::{
    AccessClaims, ClientMeta, IssuedRefreshToken, RefreshClaims, TokenError, TokenService,
};
