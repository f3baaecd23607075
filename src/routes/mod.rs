//! HTTP routes for Beacon
//!
//! Handlers take the already-resolved caller and the collected request
//! body, and return a complete JSON response. Routing and body collection
//! live in `server::http`.

pub mod categories;
pub mod health;
pub mod incidents;
pub mod permissions;
pub mod users;

pub use categories::{handle_create_category, handle_delete_category, handle_list_categories};
pub use health::health_check;
pub use incidents::{
    handle_create_incident, handle_delete_incident, handle_get_incident, handle_list_incidents,
    handle_transition_incident, handle_update_incident,
};
pub use permissions::handle_my_permissions;
pub use users::handle_set_location;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::store::Query;
use crate::sync::ViewTarget;
use crate::types::{BeaconError, Result};

/// Largest request body accepted by any route
pub const MAX_BODY_BYTES: usize = 256 * 1024;

/// Query-string parameters shared by list routes and `/ws/watch`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewParams {
    pub collection: Option<String>,
    pub id: Option<String>,
    pub order_by: Option<String>,
    /// JSON literal (`true`, `3`, `"x"`) or a bare string
    pub equal_to: Option<String>,
    pub limit: Option<usize>,
    pub descending: Option<bool>,
    pub token: Option<String>,
}

impl ViewParams {
    pub fn parse(query: Option<&str>) -> Result<Self> {
        serde_urlencoded::from_str(query.unwrap_or(""))
            .map_err(|e| BeaconError::BadRequest(format!("Invalid query string: {}", e)))
    }

    pub fn query(&self) -> Result<Query> {
        let query = Query {
            order_by: self.order_by.clone(),
            equal_to: self.equal_to.as_deref().map(parse_literal),
            limit: self.limit,
            descending: self.descending.unwrap_or(false),
        };
        query.validate()?;
        Ok(query)
    }

    /// Document target when `id` is given, collection target otherwise,
    /// no target without a collection
    pub fn target(&self) -> Result<Option<ViewTarget>> {
        let Some(collection) = self.collection.as_deref() else {
            return Ok(None);
        };
        match self.id.as_deref() {
            Some(id) => Ok(Some(ViewTarget::document(collection, id))),
            None => Ok(Some(ViewTarget::collection(collection, self.query()?))),
        }
    }
}

fn parse_literal(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Decode a JSON request body
pub fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.is_empty() {
        return Err(BeaconError::BadRequest("Request body is empty".into()));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(BeaconError::BadRequest(format!(
            "Request body exceeds {} bytes",
            MAX_BODY_BYTES
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .header("Cache-Control", "no-store")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => error_response(BeaconError::Internal(format!("Serialization failed: {}", e))),
    }
}

/// JSON error response, status taken from the error kind
pub fn error_response(err: BeaconError) -> Response<Full<Bytes>> {
    if err.status_code().is_server_error() {
        warn!(kind = err.kind(), error = %err, "Request failed");
    } else {
        debug!(kind = err.kind(), error = %err, "Request rejected");
    }
    let (status, body) = err.into_status_code_and_body();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// `value` as JSON with `status`, or the error response
pub fn respond<T: Serialize>(status: StatusCode, result: Result<T>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => json_response(status, &value),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_view_params_document_target() {
        let params = ViewParams::parse(Some("collection=incidents&id=abc")).unwrap();
        assert_eq!(
            params.target().unwrap(),
            Some(ViewTarget::document("incidents", "abc"))
        );
    }

    #[test]
    fn test_view_params_filtered_collection() {
        let params =
            ViewParams::parse(Some("collection=incidents&orderBy=assignedTo&equalTo=Team-A&limit=5"))
                .unwrap();
        let target = params.target().unwrap().unwrap();
        assert_eq!(
            target,
            ViewTarget::collection(
                "incidents",
                Query::order_by("assignedTo").equal_to("Team-A").with_limit(5)
            )
        );

        let params = ViewParams::parse(Some("collection=categories&orderBy=parentId&equalTo=null"))
            .unwrap();
        assert_eq!(params.query().unwrap().equal_to, Some(json!(null)));
    }

    #[test]
    fn test_view_params_without_collection_is_no_target() {
        let params = ViewParams::parse(None).unwrap();
        assert_eq!(params.target().unwrap(), None);
    }

    #[test]
    fn test_equal_to_requires_order_by() {
        let params = ViewParams::parse(Some("collection=incidents&equalTo=x")).unwrap();
        assert!(matches!(params.target(), Err(BeaconError::BadRequest(_))));
    }

    #[test]
    fn test_parse_json_rejects_empty_body() {
        let result: Result<Value> = parse_json(b"");
        assert!(matches!(result, Err(BeaconError::BadRequest(_))));
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(BeaconError::NotFound("incident 'x'".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
