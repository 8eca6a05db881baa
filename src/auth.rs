//! Bearer-token authentication and role checks.

use anyhow::anyhow;
use axum::{extract::FromRequestParts, http::header};
use metrics::counter;
use rand::{distributions::Alphanumeric, thread_rng, Rng as _};
use sha2::{Digest as _, Sha256};

use crate::{
    metrics::AUTH_FAILED,
    models::{Role, User},
    AppState, Error, Result,
};

/// Length of newly issued bearer tokens.
const TOKEN_LEN: usize = 40;

/// Generate a new bearer token. Only its hash is ever stored.
pub fn generate_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Hex-encoded SHA-256 of a bearer token.
pub fn hash_token(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// An active user resolved from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

impl AuthenticatedUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn is_admin(&self) -> bool {
        self.0.role == Role::Admin
    }

    /// Fails with 403 unless the user holds one of `roles`.
    pub fn require_any(&self, roles: &[Role]) -> Result<()> {
        if roles.contains(&self.0.role) {
            Ok(())
        } else {
            Err(Error::forbidden(anyhow!(
                "role {:?} is not authorized to access this route",
                self.0.role
            )))
        }
    }

    pub fn require_admin(&self) -> Result<()> {
        self.require_any(&[Role::Admin])
    }
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let Some(token) = token else {
            counter!(AUTH_FAILED).increment(1);
            return Err(Error::unauthorized(anyhow!("not authorized, no token")));
        };

        let user: Option<User> =
            sqlx::query_as("SELECT * FROM users WHERE token_hash = ? AND is_active = 1")
                .bind(hash_token(token))
                .fetch_optional(&state.db)
                .await?;

        match user {
            Some(user) => Ok(Self(user)),
            None => {
                counter!(AUTH_FAILED).increment(1);
                Err(Error::unauthorized(anyhow!("not authorized, token failed")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_random_and_hash_stably() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_ne!(a, b);

        assert_eq!(hash_token(&a), hash_token(&a));
        assert_eq!(hash_token(&a).len(), 64);
        assert_ne!(hash_token(&a), hash_token(&b));
    }
}
