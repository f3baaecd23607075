//! `GET /me/permissions`: the caller's effective role, tokens and the
//! status changes it may make, for UI gating

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;

use super::json_response;
use crate::auth::{effective_role, Principal};
use crate::incident::machine::permitted_transitions;
use crate::incident::IncidentStatus;
use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsResponse {
    pub user_id: Option<String>,
    pub role: String,
    pub known_role: bool,
    pub permissions: Vec<String>,
    /// Target statuses by current status; statuses with none are omitted
    pub transitions: BTreeMap<&'static str, Vec<IncidentStatus>>,
}

pub fn handle_my_permissions(
    state: &AppState,
    principal: Option<&Principal>,
) -> Response<Full<Bytes>> {
    let role = effective_role(principal);
    let mut permissions = state.catalog.permissions_for(role);
    permissions.sort();

    let transitions = IncidentStatus::ALL
        .into_iter()
        .map(|from| (from.as_str(), permitted_transitions(&state.catalog, role, from)))
        .filter(|(_, to)| !to.is_empty())
        .collect();

    json_response(
        StatusCode::OK,
        &PermissionsResponse {
            user_id: principal.map(|p| p.id.clone()),
            role: role.to_string(),
            known_role: state.catalog.knows_role(role),
            permissions,
            transitions,
        },
    )
}
