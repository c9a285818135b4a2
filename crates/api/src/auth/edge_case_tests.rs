//! Edge Case Tests for Authentication
//!
//! Tests critical boundary conditions in:
//! - JWT token handling (AUTH-J01 to AUTH-J07)
//! - Password hashing and strength (AUTH-P01 to AUTH-P04)

#[cfg(test)]
mod jwt_tests {
    use super::super::jwt::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use revisume_shared::UserId;
    use time::OffsetDateTime;

    const TEST_SECRET: &str = "test-secret-key-at-least-32-chars!";

    fn token_expiring_at(exp: i64) -> String {
        let claims = Claims {
            sub: UserId(1),
            email: "test@example.com".to_string(),
            iat: exp - 3600,
            exp,
            jti: "jti-fixed".to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap()
    }

    // =========================================================================
    // AUTH-J01: Fresh token validates and carries the user id
    // =========================================================================
    #[test]
    fn test_fresh_token_valid() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        let (token, jti) = jwt
            .generate_access_token(UserId(7), "test@example.com")
            .expect("Should generate token");

        let claims = jwt.validate_token(&token).expect("Fresh token should be valid");
        assert_eq!(claims.sub, UserId(7));
        assert_eq!(claims.jti, jti);
        assert_eq!(claims.exp - claims.iat, jwt.access_token_expiry_seconds());
    }

    // =========================================================================
    // AUTH-J02: Token expired 30s ago - still valid (60s leeway)
    // =========================================================================
    #[test]
    fn test_token_within_leeway() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        assert!(jwt.validate_token(&token_expiring_at(now - 30)).is_ok());
    }

    // =========================================================================
    // AUTH-J03: Token expired beyond the leeway - Expired
    // =========================================================================
    #[test]
    fn test_token_past_leeway_expired() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let result = jwt.validate_token(&token_expiring_at(now - JWT_LEEWAY_SECS as i64 - 60));
        assert!(matches!(result, Err(JwtError::Expired)));
    }

    // =========================================================================
    // AUTH-J04: Token signed with a different secret - Invalid
    // =========================================================================
    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new("another-secret-key-at-least-32-chars", 24);
        let verifier = JwtManager::new(TEST_SECRET, 24);
        let (token, _) = issuer
            .generate_access_token(UserId(1), "test@example.com")
            .unwrap();
        assert!(matches!(
            verifier.validate_token(&token),
            Err(JwtError::Invalid(_))
        ));
    }

    // =========================================================================
    // AUTH-J05: Malformed tokens - Invalid, never a panic
    // =========================================================================
    #[test]
    fn test_malformed_tokens_rejected() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        for token in ["", "not-a-jwt", "a.b.c", "eyJhbGciOiJub25lIn0.e30."] {
            assert!(
                matches!(jwt.validate_token(token), Err(JwtError::Invalid(_))),
                "{:?} should be rejected",
                token
            );
        }
    }

    // =========================================================================
    // AUTH-J06: Every token gets a distinct jti
    // =========================================================================
    #[test]
    fn test_jti_unique_per_token() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        let (_, first) = jwt.generate_access_token(UserId(1), "a@example.com").unwrap();
        let (_, second) = jwt.generate_access_token(UserId(1), "a@example.com").unwrap();
        assert_ne!(first, second);
    }

    // =========================================================================
    // AUTH-J07: Access token duration follows configuration
    // =========================================================================
    #[test]
    fn test_access_token_expiry_hours() {
        assert_eq!(JwtManager::new(TEST_SECRET, 24).access_token_expiry_seconds(), 86_400);
        assert_eq!(JwtManager::new(TEST_SECRET, 1).access_token_expiry_seconds(), 3_600);
    }
}

#[cfg(test)]
mod password_tests {
    use super::super::password::*;
    use crate::error::ApiError;

    // =========================================================================
    // AUTH-P01: Hash then verify
    // =========================================================================
    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("correct horse battery!", &hash));
    }

    // =========================================================================
    // AUTH-P02: Same password hashes differently (random salt)
    // =========================================================================
    #[test]
    fn test_salted_hashes_differ() {
        let a = hash_password("password123").unwrap();
        let b = hash_password("password123").unwrap();
        assert_ne!(a, b);
        assert!(verify_password("password123", &a));
        assert!(verify_password("password123", &b));
    }

    // =========================================================================
    // AUTH-P03: Malformed stored hash - false, not an error
    // =========================================================================
    #[test]
    fn test_malformed_hash_rejects() {
        assert!(!verify_password("password123", ""));
        assert!(!verify_password("password123", "plaintext"));
    }

    // =========================================================================
    // AUTH-P04: Exactly MIN_PASSWORD_LENGTH characters is accepted
    // =========================================================================
    #[test]
    fn test_password_length_boundary() {
        let at_min = "x".repeat(MIN_PASSWORD_LENGTH);
        let below = "x".repeat(MIN_PASSWORD_LENGTH - 1);
        assert!(validate_password_strength(&at_min).is_ok());
        assert!(matches!(
            validate_password_strength(&below),
            Err(ApiError::BadRequest(_))
        ));
        // Counted in characters, not bytes
        assert!(validate_password_strength("ééééééé").is_err());
    }
}
