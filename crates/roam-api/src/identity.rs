use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::debug;

use roam_types::api::Claims;
use roam_types::models::UserId;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// The verified caller, inserted into request extensions by
/// [`require_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub UserId);

/// Turns identity-provider tokens into internal user ids.
#[derive(Clone)]
pub struct Identity {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Identity {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> ApiResult<UserId> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!("Token rejected: {}", e);
            ApiError::Unauthenticated
        })?;

        let sub = data.claims.sub.trim();
        if sub.is_empty() {
            return Err(ApiError::Unauthenticated);
        }
        Ok(sub.to_string())
    }

    /// Mint a token the same way the identity provider does. Development
    /// and test tooling only.
    pub fn issue(&self, user_id: &str, ttl: chrono::Duration) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }
}

/// Extract and validate the bearer token from the Authorization header.
pub async fn require_identity(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthenticated)?;
        state.identity.verify(token)?
    };

    req.extensions_mut().insert(CurrentUser(user_id));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let identity = Identity::new("test-secret");
        let token = identity.issue("alice", chrono::Duration::hours(1)).unwrap();
        assert_eq!(identity.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let issuer = Identity::new("someone-else");
        let token = issuer.issue("alice", chrono::Duration::hours(1)).unwrap();
        let identity = Identity::new("test-secret");
        assert!(matches!(identity.verify(&token), Err(ApiError::Unauthenticated)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let identity = Identity::new("test-secret");
        let token = identity.issue("alice", chrono::Duration::hours(-2)).unwrap();
        assert!(matches!(identity.verify(&token), Err(ApiError::Unauthenticated)));
    }

    #[test]
    fn garbage_and_blank_subjects_are_rejected() {
        let identity = Identity::new("test-secret");
        assert!(identity.verify("not-a-jwt").is_err());
        let blank = identity.issue("  ", chrono::Duration::hours(1)).unwrap();
        assert!(identity.verify(&blank).is_err());
    }
}
