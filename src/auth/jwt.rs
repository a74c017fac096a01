//! JWT verification
//!
//! Tokens are issued by the identity provider; this service only verifies
//! them with the shared HS256 secret.

use crate::config::AuthConfig;
use crate::error::AppError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Role claimed by the provider (`authenticated`, `service_role`...)
    #[serde(default)]
    pub role: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Decode and validate a JWT token
pub fn decode_token(token: &str, config: &AuthConfig) -> Result<Claims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    match &config.jwt_audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            AppError::Unauthorized("Token expired".to_string())
        }
        jsonwebtoken::errors::ErrorKind::InvalidToken => {
            AppError::Unauthorized("Invalid token".to_string())
        }
        _ => AppError::Unauthorized(format!("Token validation failed: {}", e)),
    })?;

    Ok(token_data.claims)
}


#[cfg(test)]
mod tests {
    use super::testing::issue;
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_valid_token_decodes() {
        let config = AuthConfig::default();
        let token = issue("user-1", &config.jwt_secret, Duration::minutes(5), None);

        let claims = decode_token(&token, &config).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("user-1@example.com"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = AuthConfig::default();
        let token = issue("user-1", &config.jwt_secret, Duration::hours(-2), None);

        let err = decode_token(&token, &config).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(msg) if msg == "Token expired"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue("user-1", "some-other-secret", Duration::minutes(5), None);
        assert!(decode_token(&token, &AuthConfig::default()).is_err());
    }

    #[test]
    fn test_audience_checked_only_when_configured() {
        let config = AuthConfig {
            jwt_audience: Some("authenticated".to_string()),
            ..AuthConfig::default()
        };
        let right = issue("user-1", &config.jwt_secret, Duration::minutes(5), Some("authenticated"));
        let wrong = issue("user-1", &config.jwt_secret, Duration::minutes(5), Some("anon"));

        assert!(decode_token(&right, &config).is_ok());
        assert!(decode_token(&wrong, &config).is_err());
        assert!(decode_token(&wrong, &AuthConfig::default()).is_ok());
    }
}
