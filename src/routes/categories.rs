//! Category routes
//!
//! Listing is open to everyone since report forms need the tree;
//! changes need `categories.manage`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

use super::{error_response, parse_json, respond};
use crate::auth::Principal;
use crate::incident::NewCategory;
use crate::server::AppState;

pub async fn handle_list_categories(state: &AppState) -> Response<Full<Bytes>> {
    respond(StatusCode::OK, state.categories.list().await)
}

pub async fn handle_create_category(
    state: &AppState,
    principal: Option<&Principal>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let new: NewCategory = match parse_json(body) {
        Ok(new) => new,
        Err(e) => return error_response(e),
    };
    respond(StatusCode::CREATED, state.categories.create(principal, new).await)
}

pub async fn handle_delete_category(
    state: &AppState,
    principal: Option<&Principal>,
    id: &str,
) -> Response<Full<Bytes>> {
    let result = state
        .categories
        .delete(principal, id)
        .await
        .map(|_| json!({ "deleted": id }));
    respond(StatusCode::OK, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::roles;
    use crate::server::http::tests::test_state;

    #[tokio::test]
    async fn test_only_admin_manages_categories() {
        let state = test_state();
        let body = serde_json::to_vec(&json!({ "name": "Fire" })).unwrap();

        let coordinator = Principal::new("c-1", roles::COORDINATOR);
        let response = handle_create_category(&state, Some(&coordinator), &body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = Principal::new("a-1", roles::ADMIN);
        let response = handle_create_category(&state, Some(&admin), &body).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = handle_list_categories(&state).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
