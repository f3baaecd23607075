//! Incident routes
//!
//! - `POST   /incidents`
//! - `GET    /incidents?orderBy=..&equalTo=..&limit=..&descending=..`
//! - `GET    /incidents/{id}`
//! - `PATCH  /incidents/{id}`
//! - `DELETE /incidents/{id}`
//! - `POST   /incidents/{id}/transition`

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

use super::{error_response, parse_json, respond, ViewParams};
use crate::auth::Principal;
use crate::incident::{IncidentUpdate, NewIncident, TransitionRequest};
use crate::server::AppState;

pub async fn handle_create_incident(
    state: &AppState,
    principal: Option<&Principal>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let report: NewIncident = match parse_json(body) {
        Ok(report) => report,
        Err(e) => return error_response(e),
    };
    respond(StatusCode::CREATED, state.incidents.create(principal, report).await)
}

pub async fn handle_list_incidents(
    state: &AppState,
    principal: Option<&Principal>,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let query = match ViewParams::parse(query).and_then(|p| p.query()) {
        Ok(query) => query,
        Err(e) => return error_response(e),
    };
    respond(StatusCode::OK, state.incidents.list(principal, &query).await)
}

pub async fn handle_get_incident(
    state: &AppState,
    principal: Option<&Principal>,
    id: &str,
) -> Response<Full<Bytes>> {
    respond(StatusCode::OK, state.incidents.get(principal, id).await)
}

pub async fn handle_update_incident(
    state: &AppState,
    principal: Option<&Principal>,
    id: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let update: IncidentUpdate = match parse_json(body) {
        Ok(update) => update,
        Err(e) => return error_response(e),
    };
    respond(
        StatusCode::OK,
        state.incidents.update_details(principal, id, update).await,
    )
}

pub async fn handle_delete_incident(
    state: &AppState,
    principal: Option<&Principal>,
    id: &str,
) -> Response<Full<Bytes>> {
    let result = state
        .incidents
        .delete(principal, id)
        .await
        .map(|_| json!({ "deleted": id }));
    respond(StatusCode::OK, result)
}

/// Status change, retried once if another writer moved the status first
pub async fn handle_transition_incident(
    state: &AppState,
    principal: Option<&Principal>,
    id: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let request: TransitionRequest = match parse_json(body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    respond(
        StatusCode::OK,
        state
            .incidents
            .transition_retrying_once(principal, id, &request)
            .await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::roles;
    use crate::incident::{Incident, IncidentStatus};
    use crate::server::http::tests::test_state;
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn report() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "title": "Flooded underpass",
            "description": "Water above the curb on 5th street",
            "category": "flood",
            "location": { "latitude": 14.6, "longitude": 121.0 }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_anonymous_create_then_coordinator_verifies() {
        let state = test_state();
        let response = handle_create_incident(&state, None, &report()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Incident = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(created.status, IncidentStatus::Reported);
        assert!(created.reporter_id.is_none());

        let coordinator = Principal::new("c-1", roles::COORDINATOR);
        let body = serde_json::to_vec(&json!({ "to": "Verified" })).unwrap();
        let response =
            handle_transition_incident(&state, Some(&coordinator), &created.id, &body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "Verified");
    }

    #[tokio::test]
    async fn test_responder_cannot_verify() {
        let state = test_state();
        let created: Incident =
            serde_json::from_value(body_json(handle_create_incident(&state, None, &report()).await).await)
                .unwrap();

        let responder = Principal::new("r-1", roles::RESPONDER);
        let body = serde_json::to_vec(&json!({ "to": "Verified" })).unwrap();
        let response =
            handle_transition_incident(&state, Some(&responder), &created.id, &body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "PermissionDenied");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let state = test_state();
        let response = handle_create_incident(&state, None, b"{not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_incident_is_not_found() {
        let state = test_state();
        let reporter = Principal::new("u-1", roles::REPORTER);
        let response = handle_get_incident(&state, Some(&reporter), "missing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
