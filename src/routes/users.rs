//! `PUT /users/{id}/location`: administrative location override

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

use super::{error_response, parse_json, respond};
use crate::auth::Principal;
use crate::location::PositionSample;
use crate::server::AppState;
use crate::types::BeaconError;

pub async fn handle_set_location(
    state: &AppState,
    principal: Option<&Principal>,
    user_id: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let Some(principal) = principal else {
        return error_response(BeaconError::Unauthorized("Sign-in required".into()));
    };
    let sample: PositionSample = match parse_json(body) {
        Ok(sample) => sample,
        Err(e) => return error_response(e),
    };
    let result = state
        .locations
        .set_location(principal, user_id, sample)
        .await
        .map(|_| json!({ "userId": user_id, "updated": true }));
    respond(StatusCode::OK, result)
}
