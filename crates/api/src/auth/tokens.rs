//! Access and refresh token issuance, verification and rotation
//!
//! Access tokens are short-lived RS256 JWTs carrying the user's id and email.
//! Refresh tokens carry a rotation id (`jti`) that must be backed by an
//! unrevoked row in the store; rotating one revokes it and links the new row
//! as its child, so a second rotation of the same `jti` is detected as reuse.

use std::sync::Arc;

use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, Header, Validation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use wizpix_shared::models::{NewRefreshToken, RotationOutcome, User};
use wizpix_shared::{Store, StoreError};

use super::keys::KeyProvider;

const ACCESS_TYPE: &str = "access";
const REFRESH_TYPE: &str = "refresh";
const REUSE_REASON: &str = "reuse_detected";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Signing key unavailable: {0}")]
    SigningKeyUnavailable(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("Token expired")]
    TokenExpired,
    #[error("Token malformed")]
    TokenMalformed,
    #[error("Token revoked")]
    TokenRevoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub email: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub jti: String,
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    pub email: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

/// Request metadata stored with each refresh token row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub jti: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct TokenService {
    store: Arc<dyn Store>,
    keys: Arc<dyn KeyProvider>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn Store>,
        keys: Arc<dyn KeyProvider>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access_token(&self, user: &User) -> Result<String, TokenError> {
        let now = OffsetDateTime::now_utc();
        let claims = AccessClaims {
            sub: user.id,
            email: user.email.clone(),
            typ: ACCESS_TYPE.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + self.access_ttl).unix_timestamp(),
        };
        self.sign(&claims)
    }

    /// Persist a new rotation id and sign a refresh token for it
    pub async fn issue_refresh_token(
        &self,
        user: &User,
        meta: &ClientMeta,
    ) -> Result<IssuedRefreshToken, TokenError> {
        // Fail on a missing key before a row is written
        self.keys
            .encoding_key()
            .map_err(|e| TokenError::SigningKeyUnavailable(e.0))?;

        let next = self.new_row(user.id, meta);
        self.store.insert_refresh_token(&next).await?;

        let token = self.sign_refresh(&next, &user.email)?;
        tracing::debug!(user_id = %user.id, jti = %next.jti, "Refresh token issued");
        Ok(IssuedRefreshToken {
            token,
            jti: next.jti,
            expires_at: next.expires_at,
        })
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let claims: AccessClaims = self.decode(token)?;
        if claims.typ != ACCESS_TYPE {
            return Err(TokenError::TokenMalformed);
        }
        Ok(claims)
    }

    /// Check signature and expiry, then require an unrevoked backing row
    pub async fn verify_refresh_token(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        let claims: RefreshClaims = self.decode(token)?;
        if claims.typ != REFRESH_TYPE {
            return Err(TokenError::TokenMalformed);
        }

        match self.store.find_refresh_token(&claims.jti).await? {
            Some(record) if record.user_id != claims.user_id => Err(TokenError::TokenMalformed),
            Some(record) if record.is_revoked() => {
                // A rotated token coming back means a copy is in someone else's hands
                let revoked = if record.replaced_by.is_some() {
                    self.store
                        .revoke_refresh_chain(&claims.jti, REUSE_REASON)
                        .await?
                } else {
                    0
                };
                tracing::warn!(
                    jti = %claims.jti,
                    user_id = %claims.user_id,
                    reason = ?record.revocation_reason,
                    revoked_descendants = revoked,
                    "Revoked refresh token presented, possible token replay"
                );
                Err(TokenError::TokenRevoked)
            }
            Some(_) => Ok(claims),
            None => {
                tracing::warn!(jti = %claims.jti, "Refresh token has no backing record");
                Err(TokenError::TokenRevoked)
            }
        }
    }

    /// Revoke the presented rotation id and issue its successor
    ///
    /// Rotating an id that is already revoked is treated as reuse: the whole
    /// chain descending from it is revoked and `TokenRevoked` is returned.
    pub async fn rotate_refresh_token(
        &self,
        old: &RefreshClaims,
        meta: &ClientMeta,
    ) -> Result<IssuedRefreshToken, TokenError> {
        self.keys
            .encoding_key()
            .map_err(|e| TokenError::SigningKeyUnavailable(e.0))?;

        let next = self.new_row(old.user_id, meta);
        match self.store.rotate_refresh_token(&old.jti, &next).await? {
            RotationOutcome::Rotated(record) => {
                let token = self.sign_refresh(&next, &old.email)?;
                tracing::debug!(
                    user_id = %old.user_id,
                    old_jti = %old.jti,
                    new_jti = %record.jti,
                    "Refresh token rotated"
                );
                Ok(IssuedRefreshToken {
                    token,
                    jti: record.jti,
                    expires_at: record.expires_at,
                })
            }
            RotationOutcome::AlreadyRevoked(record) => {
                let revoked = self
                    .store
                    .revoke_refresh_chain(&record.jti, REUSE_REASON)
                    .await?;
                tracing::warn!(
                    jti = %record.jti,
                    user_id = %record.user_id,
                    replaced_by = ?record.replaced_by,
                    revoked_descendants = revoked,
                    "Refresh token reuse detected"
                );
                Err(TokenError::TokenRevoked)
            }
            RotationOutcome::NotFound => {
                tracing::warn!(jti = %old.jti, "Rotation requested for unknown refresh token");
                Err(TokenError::TokenRevoked)
            }
        }
    }

    /// Revoke every live refresh token of a user. Safe to repeat.
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, TokenError> {
        let revoked = self
            .store
            .revoke_all_refresh_tokens(user_id, "logout")
            .await?;
        tracing::info!(user_id = %user_id, revoked = revoked, "Refresh tokens revoked");
        Ok(revoked)
    }

    fn new_row(&self, user_id: Uuid, meta: &ClientMeta) -> NewRefreshToken {
        NewRefreshToken {
            jti: Uuid::new_v4().to_string(),
            user_id,
            expires_at: OffsetDateTime::now_utc() + self.refresh_ttl,
            ip_address: meta.ip_address.clone(),
            user_agent: meta.user_agent.clone(),
        }
    }

    fn sign_refresh(&self, row: &NewRefreshToken, email: &str) -> Result<String, TokenError> {
        let claims = RefreshClaims {
            jti: row.jti.clone(),
            user_id: row.user_id,
            email: email.to_string(),
            typ: REFRESH_TYPE.to_string(),
            iat: OffsetDateTime::now_utc().unix_timestamp(),
            exp: row.expires_at.unix_timestamp(),
        };
        self.sign(&claims)
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        let key = self
            .keys
            .encoding_key()
            .map_err(|e| TokenError::SigningKeyUnavailable(e.0))?;
        encode(&Header::new(Algorithm::RS256), claims, &key)
            .map_err(|e| TokenError::SigningKeyUnavailable(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        let key = self
            .keys
            .decoding_key()
            .map_err(|e| TokenError::SigningKeyUnavailable(e.0))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 5;

        decode::<T>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::TokenExpired,
                _ => TokenError::TokenMalformed,
            })
    }
}
