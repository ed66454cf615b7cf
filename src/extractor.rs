use std::sync::Arc;

use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::debug;

use crate::auth::{AuthError, IdentityVerifier};
use crate::error::AppError;

pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let verifier = parts
            .extensions
            .get::<Arc<dyn IdentityVerifier>>()
            .cloned()
            .ok_or_else(|| AppError::Message("identity verifier not configured".into()))?;

        let token_opt = if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("auth_token=").map(|s| s.to_string())
            })
        } else {
            None
        };
        let token_opt = token_opt.or_else(|| {
            parts
                .headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|authz| authz.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.trim().to_string()))
        });

        let identity = token_opt
            .ok_or(AuthError::Missing)
            .and_then(|token| verifier.verify(&token))
            .map_err(|err| {
                debug!(%err, "rejecting request credential");
                AppError::Unauthorized
            })?;

        Ok(AuthUser {
            user_id: identity.user_id,
            email: identity.email,
        })
    }
}
