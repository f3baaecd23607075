//! Health check endpoint
//!
//! `/health` (and `/healthz`) is a liveness probe: it answers 200 while the
//! process is serving, whatever the store or advisory service are doing.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
    pub node_id: String,
    pub mode: &'static str,
    /// `memory` or `mongo`
    pub store: &'static str,
    pub advisory_enabled: bool,
    pub advisory_backend: String,
    pub active_watches: usize,
    pub active_location_feeds: usize,
}

pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        node_id: state.args.node_id.to_string(),
        mode: if state.args.dev_mode { "development" } else { "production" },
        store: state.store.backend(),
        advisory_enabled: state.advisory.is_enabled(),
        advisory_backend: state.advisory.backend_id().to_string(),
        active_watches: state.sync.active_watches(),
        active_location_feeds: state.locations.active_feeds(),
    };
    json_response(StatusCode::OK, &response)
}
