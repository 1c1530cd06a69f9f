//! GraphQL authentication
//!
//! Bearer tokens are HS256 JWTs. The HTTP handler verifies the token from the
//! `Authorization` header; the WebSocket handler also accepts it as the
//! `Authorization` connection-init parameter. A verified [`AuthUser`] is placed
//! in the request data; resolvers that need one call [`AuthExt::auth_user`].

use async_graphql::{Context, ErrorExtensions, Result};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// Viewer extracted from a verified token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    username: String,
    exp: i64,
}

/// Verify a JWT and extract the viewer
pub fn verify_token(token: &str, secret: &str) -> Result<AuthUser> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_aud = false;

    let token_data = decode::<AccessTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.trim().as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "JWT verification failed");
        async_graphql::Error::new(format!("Invalid token: {}", e))
            .extend_with(|_, e| e.set("code", "UNAUTHORIZED"))
    })?;

    Ok(AuthUser {
        user_id: token_data.claims.sub,
        username: token_data.claims.username,
    })
}

/// Sign a token for `user_id`, valid for `ttl_secs`
pub fn issue_token(user_id: &str, username: &str, secret: &str, ttl_secs: i64) -> anyhow::Result<String> {
    let claims = AccessTokenClaims {
        sub: user_id.to_string(),
        username: username.to_string(),
        exp: Utc::now().timestamp() + ttl_secs,
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.trim().as_bytes()),
    )?)
}

/// Extension trait to get the authenticated viewer from GraphQL context
pub trait AuthExt {
    /// The viewer, or an `UNAUTHORIZED` error
    fn auth_user(&self) -> Result<&AuthUser>;
}

impl<'a> AuthExt for Context<'a> {
    fn auth_user(&self) -> Result<&AuthUser> {
        self.data_opt::<AuthUser>().ok_or_else(|| {
            async_graphql::Error::new("Authentication required")
                .extend_with(|_, e| e.set("code", "UNAUTHORIZED"))
        })
    }
}

/// `FORBIDDEN` unless the viewer is `owner_id`
pub fn require_owner(user: &AuthUser, owner_id: &str, what: &str) -> Result<()> {
    if user.user_id == owner_id {
        Ok(())
    } else {
        Err(async_graphql::Error::new(format!("Only the author may modify this {what}"))
            .extend_with(|_, e| e.set("code", "FORBIDDEN")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_issue_then_verify() {
        let token = issue_token("u1", "ada", "secret", 60).unwrap();
        let user = verify_token(&token, "secret").unwrap();
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.username, "ada");
    }

    #[test]
    fn test_rejects_wrong_secret_and_expired() {
        let token = issue_token("u1", "ada", "secret", 60).unwrap();
        assert!(verify_token(&token, "other").is_err());

        let expired = issue_token("u1", "ada", "secret", -3600).unwrap();
        assert!(verify_token(&expired, "secret").is_err());
    }
}
