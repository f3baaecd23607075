//! Configuration for Beacon
//!
//! CLI arguments and environment variable handling using clap.
//! A `.env` file is loaded first by `main`.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{JwtValidator, PermissionCatalog};
use crate::types::{BeaconError, Result};

/// Store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// In-process store (development, tests, single node)
    Memory,
    /// MongoDB-backed store
    Mongo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Beacon - incident lifecycle and live dispatch gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "beacon")]
#[command(about = "Incident lifecycle, access control and live dispatch gateway")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (dev JWT secret, store fallback to memory)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Store backend
    #[arg(long = "store", env = "STORE_BACKEND", value_enum, default_value = "memory")]
    pub store: StoreBackend,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "beacon")]
    pub mongodb_db: String,

    /// JWT secret for token verification (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// JSON role catalog replacing the built-in one
    #[arg(long, env = "PERMISSIONS_FILE")]
    pub permissions_file: Option<PathBuf>,

    /// Minimum seconds between location writes per user
    #[arg(long, env = "LOCATION_WINDOW_SECS", default_value = "10")]
    pub location_window_secs: u64,

    /// OpenAI-compatible base URL for advisory calls (advisory off if unset)
    #[arg(long, env = "ADVISORY_URL")]
    pub advisory_url: Option<String>,

    /// Model used for advisory calls
    #[arg(long, env = "ADVISORY_MODEL", default_value = "gpt-4o-mini")]
    pub advisory_model: String,

    /// API key for the advisory service
    #[arg(long, env = "ADVISORY_API_KEY")]
    pub advisory_api_key: Option<String>,

    /// Best-effort timeout per advisory call in milliseconds
    #[arg(long, env = "ADVISORY_TIMEOUT_MS", default_value = "8000")]
    pub advisory_timeout_ms: u64,

    /// Delay before a live view re-queries after a store failure
    #[arg(long, env = "SYNC_RETRY_MS", default_value = "2000")]
    pub sync_retry_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.dev_mode {
            match &self.jwt_secret {
                None => return Err("JWT_SECRET is required in production mode".to_string()),
                Some(secret) if secret.len() < 32 => {
                    return Err("JWT_SECRET must be at least 32 characters".to_string())
                }
                Some(_) => {}
            }
        }

        if self.location_window_secs == 0 {
            return Err("LOCATION_WINDOW_SECS must be greater than zero".to_string());
        }

        if self.advisory_timeout_ms == 0 {
            return Err("ADVISORY_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.sync_retry_ms == 0 {
            return Err("SYNC_RETRY_MS must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Token validator (dev secret when none is configured in dev mode)
    pub fn jwt_validator(&self) -> Result<JwtValidator> {
        match (&self.jwt_secret, self.dev_mode) {
            (Some(secret), _) => JwtValidator::new(secret.clone(), self.jwt_expiry_seconds),
            (None, true) => Ok(JwtValidator::new_dev()),
            (None, false) => Err(BeaconError::Config(
                "JWT_SECRET is required in production mode".into(),
            )),
        }
    }

    /// Permission catalog from `--permissions-file`, or the built-in one
    pub fn permission_catalog(&self) -> Result<PermissionCatalog> {
        match &self.permissions_file {
            Some(path) => PermissionCatalog::load(path),
            None => Ok(PermissionCatalog::builtin()),
        }
    }

    pub fn location_window(&self) -> Duration {
        Duration::from_secs(self.location_window_secs)
    }

    pub fn advisory_timeout(&self) -> Duration {
        Duration::from_millis(self.advisory_timeout_ms)
    }

    pub fn sync_retry(&self) -> Duration {
        Duration::from_millis(self.sync_retry_ms)
    }
}
