//! Bearer authentication middleware
//!
//! API routes require an HS256 bearer token whose `sub` claim names the
//! owner. The `/ws` endpoint deliberately bypasses this middleware.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

use super::super::AppState;

/// Authenticated owner id, inserted as a request extension
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

/// Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id
    pub sub: String,

    /// Expiration timestamp (seconds)
    pub exp: usize,
}

/// Require a valid bearer token on API routes
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            return ApiError::Unauthorized("missing or invalid authorization header".to_string())
                .into_response();
        }
    };

    let claims = match validate_token(token, &state.config.api.jwt_secret) {
        Ok(claims) => claims,
        Err(message) => {
            return ApiError::Unauthorized(message.to_string()).into_response();
        }
    };

    request.extensions_mut().insert(OwnerId(claims.sub));
    next.run(request).await
}

/// Decode and validate an HS256 token
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, &'static str> {
    let validation = Validation::new(Algorithm::HS256);
    let key = DecodingKey::from_secret(secret.as_bytes());

    let token_data = decode::<Claims>(token, &key, &validation).map_err(|_| "invalid token")?;

    let now = chrono::Utc::now().timestamp() as usize;
    if token_data.claims.exp < now {
        return Err("token expired");
    }

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(sub: &str, secret: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_owner() {
        let token = token("user-1", "topsecret", 3600);
        let claims = validate_token(&token, "topsecret").unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = token("user-1", "topsecret", 3600);
        assert!(validate_token(&token, "other").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = token("user-1", "topsecret", -3600);
        assert!(validate_token(&token, "topsecret").is_err());
    }
}
