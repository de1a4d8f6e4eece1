//! Edge Case Tests for Authentication System
//!
//! Tests critical boundary conditions and race conditions in:
//! - Refresh token rotation (AUTH-R01 to AUTH-R04)
//! - Signing key failures (AUTH-K01 to AUTH-K02)

#![allow(clippy::unwrap_used)]

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use time::Duration;
    use wizpix_shared::models::User;
    use wizpix_shared::MemoryStore;

    use super::super::keys::{test_keys, KeyProvider, StaticKeyProvider};
    use super::super::tokens::TokenService;

    pub async fn tokens_with(keys: Arc<dyn KeyProvider>) -> (TokenService, Arc<MemoryStore>, User) {
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_user("grace@example.com", "hash").await;
        let service = TokenService::new(
            store.clone(),
            keys,
            Duration::minutes(15),
            Duration::minutes(60),
        );
        (service, store, user)
    }

    pub async fn tokens() -> (TokenService, Arc<MemoryStore>, User) {
        let keys =
            StaticKeyProvider::from_pem(test_keys::PRIVATE_PEM, test_keys::PUBLIC_PEM).unwrap();
        tokens_with(Arc::new(keys)).await
    }
}

#[cfg(test)]
mod rotation_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;
    use wizpix_shared::Store;

    use super::super::tokens::{ClientMeta, TokenError};
    use super::support::tokens;

    // =========================================================================
    // AUTH-R01: Two concurrent rotations of one jti - exactly one succeeds
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_rotation_succeeds_once() {
        let (service, _, user) = tokens().await;
        let issued = service
            .issue_refresh_token(&user, &ClientMeta::default())
            .await
            .unwrap();
        let claims = service.verify_refresh_token(&issued.token).await.unwrap();

        let service = Arc::new(service);
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let service = service.clone();
            let barrier = barrier.clone();
            let claims = claims.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .rotate_refresh_token(&claims, &ClientMeta::default())
                    .await
            }));
        }

        let mut successes = 0;
        let mut revoked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(TokenError::TokenRevoked) => revoked += 1,
                Err(other) => panic!("unexpected rotation error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(revoked, 1);
    }

    // =========================================================================
    // AUTH-R02: Rotating a revoked jti creates no new live token
    // =========================================================================
    #[tokio::test]
    async fn test_rotating_revoked_jti_creates_nothing() {
        let (service, store, user) = tokens().await;
        let issued = service
            .issue_refresh_token(&user, &ClientMeta::default())
            .await
            .unwrap();
        let claims = service.verify_refresh_token(&issued.token).await.unwrap();
        service.revoke_all_for_user(user.id).await.unwrap();

        let err = service
            .rotate_refresh_token(&claims, &ClientMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::TokenRevoked));

        // Nothing live was left behind by the failed rotation
        assert_eq!(store.revoke_all_refresh_tokens(user.id, "check").await.unwrap(), 0);
    }

    // =========================================================================
    // AUTH-R03: Replaying a rotated token revokes its descendants
    // =========================================================================
    #[tokio::test]
    async fn test_replay_revokes_descendants() {
        let (service, store, user) = tokens().await;
        let first = service
            .issue_refresh_token(&user, &ClientMeta::default())
            .await
            .unwrap();
        let first_claims = service.verify_refresh_token(&first.token).await.unwrap();

        let second = service
            .rotate_refresh_token(&first_claims, &ClientMeta::default())
            .await
            .unwrap();
        let second_claims = service.verify_refresh_token(&second.token).await.unwrap();
        let third = service
            .rotate_refresh_token(&second_claims, &ClientMeta::default())
            .await
            .unwrap();

        // A stolen copy of the first token is replayed
        let err = service
            .rotate_refresh_token(&first_claims, &ClientMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::TokenRevoked));

        let latest = store.find_refresh_token(&third.jti).await.unwrap().unwrap();
        assert!(latest.is_revoked());
        assert_eq!(latest.revocation_reason.as_deref(), Some("reuse_detected"));
        assert!(matches!(
            service.verify_refresh_token(&third.token).await,
            Err(TokenError::TokenRevoked)
        ));
    }

    // =========================================================================
    // AUTH-R04: Tokens of other users are untouched by logout
    // =========================================================================
    #[tokio::test]
    async fn test_revoke_all_is_scoped_to_user() {
        let (service, store, user) = tokens().await;
        let other = store.insert_user("linus@example.com", "hash").await;

        service
            .issue_refresh_token(&user, &ClientMeta::default())
            .await
            .unwrap();
        let others = service
            .issue_refresh_token(&other, &ClientMeta::default())
            .await
            .unwrap();

        assert_eq!(service.revoke_all_for_user(user.id).await.unwrap(), 1);
        assert!(service.verify_refresh_token(&others.token).await.is_ok());
    }
}

#[cfg(test)]
mod key_tests {
    use std::sync::Arc;

    use jsonwebtoken::{DecodingKey, EncodingKey};
    use wizpix_shared::Store;

    use super::super::keys::{test_keys, KeyProvider, KeyUnavailable, PemFileKeyProvider};
    use super::super::tokens::{ClientMeta, TokenError};
    use super::support::tokens_with;

    struct VerifyOnly;

    impl KeyProvider for VerifyOnly {
        fn encoding_key(&self) -> Result<EncodingKey, KeyUnavailable> {
            Err(KeyUnavailable("private key withheld".into()))
        }

        fn decoding_key(&self) -> Result<DecodingKey, KeyUnavailable> {
            DecodingKey::from_rsa_pem(test_keys::PUBLIC_PEM.as_bytes())
                .map_err(|e| KeyUnavailable(e.to_string()))
        }
    }

    // =========================================================================
    // AUTH-K01: Missing private key - no refresh row is written
    // =========================================================================
    #[tokio::test]
    async fn test_unavailable_key_writes_no_row() {
        let (service, store, user) = tokens_with(Arc::new(VerifyOnly)).await;

        let err = service
            .issue_refresh_token(&user, &ClientMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::SigningKeyUnavailable(_)));
        assert!(matches!(
            service.issue_access_token(&user),
            Err(TokenError::SigningKeyUnavailable(_))
        ));
        assert_eq!(store.revoke_all_refresh_tokens(user.id, "check").await.unwrap(), 0);
    }

    // =========================================================================
    // AUTH-K02: Key files that do not exist surface as unavailable
    // =========================================================================
    #[tokio::test]
    async fn test_missing_key_files() {
        let provider = PemFileKeyProvider::new("/missing/private.pem", "/missing/public.pem");
        let (service, _, user) = tokens_with(Arc::new(provider)).await;
        assert!(matches!(
            service.issue_access_token(&user),
            Err(TokenError::SigningKeyUnavailable(_))
        ));
        assert!(matches!(
            service.verify_access_token("a.b.c"),
            Err(TokenError::SigningKeyUnavailable(_))
        ));
    }
}
