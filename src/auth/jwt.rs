//! Principal resolution from bearer tokens
//!
//! The identity provider is external; Beacon only verifies the HS256 token
//! it issued (or that was issued with the shared secret) and reads the
//! subject and role out of it.
//!
//! Security notes:
//! - Tokens are signed with HS256 (HMAC-SHA256)
//! - Default expiry is 1 hour
//! - In production, JWT_SECRET should be a strong random value from environment

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::auth::permissions::roles;
use crate::types::{BeaconError, Result};

/// An authenticated identity plus its resolved role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// Role used for permission checks when there may be no principal
pub fn effective_role(principal: Option<&Principal>) -> &str {
    principal.map(|p| p.role.as_str()).unwrap_or(roles::ANONYMOUS)
}

/// Payload stored in JWT token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Role name as known to the permission catalog
    pub role: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Principal {
            id: claims.sub,
            role: claims.role,
        }
    }
}

/// JWT validator and generator
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    expiry_seconds: u64,
}

impl JwtValidator {
    /// Create a new JWT validator
    ///
    /// Returns an error if the secret is empty or too short
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self> {
        if secret.is_empty() {
            return Err(BeaconError::Config(
                "JWT_SECRET is required in production mode".into(),
            ));
        }

        if secret.len() < 32 {
            return Err(BeaconError::Config(
                "JWT_SECRET must be at least 32 characters".into(),
            ));
        }

        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Create a validator for dev mode
    pub fn new_dev() -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds: 3600,
        }
    }

    fn now_secs() -> Result<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|e| BeaconError::Internal(format!("System time error: {}", e)))
    }

    /// Issue a token for a principal
    pub fn generate_token(&self, principal: &Principal) -> Result<String> {
        let now = Self::now_secs()?;

        let claims = Claims {
            sub: principal.id.clone(),
            role: principal.role.clone(),
            iat: now,
            exp: now + self.expiry_seconds,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| BeaconError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Verify and decode a JWT token into its principal
    pub fn verify_token(&self, token: &str) -> Result<Principal> {
        let validation = Validation::default();

        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        ) {
            Ok(token_data) => {
                if token_data.claims.sub.is_empty() {
                    return Err(BeaconError::Unauthorized("Token has no subject".into()));
                }
                Ok(token_data.claims.into())
            }
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let error_msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    _ => "Token validation failed",
                };
                Err(BeaconError::Unauthorized(error_msg.into()))
            }
        }
    }

    /// Resolve the caller from an optional Authorization header.
    ///
    /// No header means an anonymous caller; a present but invalid token is
    /// an error rather than a silent downgrade to anonymous.
    pub fn principal_from_header(&self, auth_header: Option<&str>) -> Result<Option<Principal>> {
        match auth_header {
            None => Ok(None),
            Some(header) => {
                let token = extract_token_from_header(Some(header))
                    .ok_or_else(|| BeaconError::Unauthorized("Malformed Authorization header".into()))?;
                self.verify_token(token).map(Some)
            }
        }
    }
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_validator() -> JwtValidator {
        JwtValidator::new(
            "test-secret-that-is-at-least-32-characters-long".into(),
            3600,
        )
        .unwrap()
    }

    #[test]
    fn test_generate_and_verify_token() {
        let validator = test_validator();
        let principal = Principal::new("user-123", "coordinator");

        let token = validator.generate_token(&principal).unwrap();
        assert!(!token.is_empty());

        let verified = validator.verify_token(&token).unwrap();
        assert_eq!(verified, principal);
    }

    #[test]
    fn test_invalid_token() {
        let validator = test_validator();
        let err = validator.verify_token("invalid-token").unwrap_err();
        assert!(matches!(err, BeaconError::Unauthorized(_)));
    }

    #[test]
    fn test_wrong_secret() {
        let validator1 = test_validator();
        let validator2 = JwtValidator::new(
            "different-secret-that-is-at-least-32-characters".into(),
            3600,
        )
        .unwrap();

        let token = validator1
            .generate_token(&Principal::new("user-123", "reporter"))
            .unwrap();
        assert!(validator2.verify_token(&token).is_err());
    }

    #[test]
    fn test_principal_from_header() {
        let validator = test_validator();
        let token = validator
            .generate_token(&Principal::new("user-9", "responder"))
            .unwrap();

        assert_eq!(validator.principal_from_header(None).unwrap(), None);

        let principal = validator
            .principal_from_header(Some(&format!("Bearer {}", token)))
            .unwrap()
            .unwrap();
        assert_eq!(principal.id, "user-9");
        assert_eq!(principal.role, "responder");

        assert!(validator.principal_from_header(Some("Basic abc")).is_err());
        assert!(validator.principal_from_header(Some("Bearer nope")).is_err());
    }

    #[test]
    fn test_effective_role() {
        assert_eq!(effective_role(None), roles::ANONYMOUS);
        let p = Principal::new("u", "admin");
        assert_eq!(effective_role(Some(&p)), "admin");
    }

    #[test]
    fn test_extract_token_from_header() {
        assert_eq!(extract_token_from_header(Some("Bearer abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(Some("abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(None), None);
        assert_eq!(extract_token_from_header(Some("")), None);
        assert_eq!(extract_token_from_header(Some("Bearer ")), None);
        assert_eq!(extract_token_from_header(Some("Basic abc123")), None);
    }

    #[test]
    fn test_secret_validation() {
        assert!(JwtValidator::new("short".into(), 3600).is_err());
        assert!(JwtValidator::new("".into(), 3600).is_err());
        assert!(JwtValidator::new("this-secret-is-at-least-32-chars-long".into(), 3600).is_ok());
    }
}
