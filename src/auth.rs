use axum::{extract::Extension, Json};
use chrono::Utc;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::billing::{Tier, UsageEvaluator};
use crate::error::AppResult;
use crate::extractor::AuthUser;

/// Who a verified credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,
    #[error("credential invalid or expired: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// key: identity-verifier -> credential to user identity
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// HS256 bearer tokens signed with the shared `JWT_SECRET`.
pub struct JwtIdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let decoded = decode::<Claims>(credential, &self.key, &self.validation)?;
        Ok(Identity {
            user_id: decoded.claims.sub,
            email: decoded.claims.email,
        })
    }
}

#[derive(Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub email: Option<String>,
    pub tier: Tier,
}

pub async fn current_user(
    Extension(evaluator): Extension<UsageEvaluator>,
    AuthUser { user_id, email }: AuthUser,
) -> AppResult<Json<UserInfo>> {
    let tier = evaluator.current_tier(&user_id, Utc::now()).await?;
    Ok(Json(UserInfo {
        user_id,
        email,
        tier,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(claims: serde_json::Value, secret: &[u8]) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn valid_token_yields_identity() {
        let credential = token(
            serde_json::json!({"sub": "user-7", "email": "u7@example.com", "exp": 9999999999u64}),
            b"secret",
        );
        let identity = JwtIdentityVerifier::new("secret").verify(&credential).unwrap();
        assert_eq!(identity.user_id, "user-7");
        assert_eq!(identity.email.as_deref(), Some("u7@example.com"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let credential = token(serde_json::json!({"sub": "user-7", "exp": 1000}), b"secret");
        assert!(matches!(
            JwtIdentityVerifier::new("secret").verify(&credential),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let credential = token(
            serde_json::json!({"sub": "user-7", "exp": 9999999999u64}),
            b"someone-else",
        );
        assert!(JwtIdentityVerifier::new("secret").verify(&credential).is_err());
    }
}
