//! JWT issuing and validation

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use revisume_shared::UserId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Leeway applied to `exp` checks, in seconds
pub const JWT_LEEWAY_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Failed to encode token: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.expiry_hours * 3600
    }

    /// Issue an access token. Returns the token and its `jti`.
    pub fn generate_access_token(
        &self,
        user_id: UserId,
        email: &str,
    ) -> Result<(String, String), JwtError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let jti = Uuid::new_v4().to_string();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iat: now,
            exp: now + self.access_token_expiry_seconds(),
            jti: jti.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encode(e.to_string()))?;
        Ok((token, jti))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = JWT_LEEWAY_SECS;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e.to_string()),
            })
    }
}
