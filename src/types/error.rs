//! Error types for Beacon
//!
//! Permission and transition errors are reported to the immediate caller.
//! Advisory and connectivity failures are absorbed by the background paths
//! that hit them and only surface here when a foreground operation cannot
//! proceed without the store.

use hyper::StatusCode;

/// Main error type for Beacon operations
#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("Permission denied: role '{role}' lacks '{token}'")]
    PermissionDenied { role: String, token: String },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Stale write rejected: {0}")]
    StaleWriteRejected(String),

    #[error("Advisory unavailable: {0}")]
    AdvisoryUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BeaconError {
    pub fn permission_denied(role: impl Into<String>, token: impl Into<String>) -> Self {
        Self::PermissionDenied {
            role: role.into(),
            token: token.into(),
        }
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Self::InvalidStateTransition(_) => StatusCode::CONFLICT,
            Self::StaleWriteRejected(_) => StatusCode::CONFLICT,
            Self::AdvisoryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind, used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::InvalidStateTransition(_) => "InvalidStateTransition",
            Self::StaleWriteRejected(_) => "StaleWriteRejected",
            Self::AdvisoryUnavailable(_) => "AdvisoryUnavailable",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::NotFound(_) => "NotFound",
            Self::BadRequest(_) => "BadRequest",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Config(_) => "Config",
            Self::Internal(_) => "Internal",
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
        .to_string();
        (status, body)
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for BeaconError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for BeaconError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for BeaconError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<bson::ser::Error> for BeaconError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Internal(format!("BSON encode error: {}", err))
    }
}

impl From<bson::de::Error> for BeaconError {
    fn from(err: bson::de::Error) -> Self {
        Self::Internal(format!("BSON decode error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for BeaconError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

/// Result type alias for Beacon operations
pub type Result<T> = std::result::Result<T, BeaconError>;
