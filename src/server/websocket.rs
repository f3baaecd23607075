//! WebSocket upgrade and connection handling
//!
//! - `/ws/watch`: streams the states of one live view. The client picks the
//!   initial target through the query string and may retarget later.
//! - `/ws/location`: a device pushes position samples for its user; the
//!   feed behind it is throttled and stops when the socket closes.
//!
//! Authentication flow:
//! 1. Try JWT token from Authorization header
//! 2. Try JWT token from query string (?token=...)
//! 3. Otherwise the caller is anonymous

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::auth::{effective_role, tokens, PermissionCatalog, Principal};
use crate::location::{ChannelSource, GeoError, LocationFeed, PositionSample};
use crate::routes::{error_response, ViewParams};
use crate::server::http::AppState;
use crate::store::{Query, CATEGORIES, INCIDENTS, USERS};
use crate::sync::{ViewState, ViewTarget};
use crate::types::{BeaconError, Result};

type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

type WsResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Samples buffered between the socket and the feed task
const LOCATION_BUFFER: usize = 16;

/// Messages from a `/ws/watch` client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WatchClientMessage {
    /// Follow another target; no `collection` means no target
    #[serde(rename_all = "camelCase")]
    Retarget {
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        order_by: Option<String>,
        #[serde(default)]
        equal_to: Option<Value>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        descending: bool,
    },
    Ping,
}

/// Messages sent to a `/ws/watch` client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WatchServerMessage {
    State {
        target: Option<ViewTarget>,
        state: ViewState,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Messages from a `/ws/location` client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LocationClientMessage {
    Position(PositionSample),
    /// The device failed to acquire a position
    Error { code: GeoErrorCode },
    Ping,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum GeoErrorCode {
    PermissionDenied,
    Unavailable,
    Timeout,
}

impl From<GeoErrorCode> for GeoError {
    fn from(code: GeoErrorCode) -> Self {
        match code {
            GeoErrorCode::PermissionDenied => GeoError::PermissionDenied,
            GeoErrorCode::Unavailable => GeoError::Unavailable,
            GeoErrorCode::Timeout => GeoError::Timeout,
        }
    }
}

/// Messages sent to a `/ws/location` client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LocationServerMessage {
    #[serde(rename_all = "camelCase")]
    Started {
        user_id: String,
        window_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Pong {
        written: u64,
        dropped: u64,
        errors: u64,
    },
    Error {
        message: String,
    },
}

/// Who may follow a target.
///
/// Incidents need `incidents.view`; categories are public; user profiles
/// are visible to their owner and to anyone who manages users or
/// dispatches teams.
pub fn authorize_view(
    catalog: &PermissionCatalog,
    principal: Option<&Principal>,
    target: &ViewTarget,
) -> Result<()> {
    let role = effective_role(principal);
    match target.collection_name() {
        INCIDENTS => catalog.require(role, tokens::INCIDENTS_VIEW),
        CATEGORIES => Ok(()),
        USERS => {
            let own_profile = matches!(
                (target, principal),
                (ViewTarget::Document { path }, Some(p)) if path.id == p.id
            );
            if own_profile
                || catalog.has_any(role, &[tokens::USERS_MANAGE, tokens::INCIDENTS_DISPATCH])
            {
                Ok(())
            } else {
                Err(BeaconError::permission_denied(role, tokens::USERS_MANAGE))
            }
        }
        other => Err(BeaconError::BadRequest(format!("Unknown collection '{}'", other))),
    }
}

fn retarget_from(message: WatchClientMessage) -> Result<Option<ViewTarget>> {
    let WatchClientMessage::Retarget {
        collection,
        id,
        order_by,
        equal_to,
        limit,
        descending,
    } = message
    else {
        return Ok(None);
    };
    let Some(collection) = collection else {
        return Ok(None);
    };
    if let Some(id) = id {
        return Ok(Some(ViewTarget::document(collection, id)));
    }
    let query = Query {
        order_by,
        equal_to,
        limit,
        descending,
    };
    query.validate()?;
    Ok(Some(ViewTarget::collection(collection, query)))
}

fn caller(state: &AppState, req: &Request<Incoming>, params: &ViewParams) -> Result<Option<Principal>> {
    let auth_header = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    state.principal(auth_header, params.token.as_deref())
}

fn upgrade_failed(e: impl std::fmt::Display) -> Response<Full<Bytes>> {
    error!("WebSocket upgrade error: {}", e);
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Full::new(Bytes::from(format!("WebSocket upgrade failed: {e}"))))
        .unwrap()
}

async fn send_json<T: Serialize>(
    sender: &mut futures_util::stream::SplitSink<HyperWebSocket, WsMessage>,
    message: &T,
) -> WsResult {
    let json = serde_json::to_string(message)?;
    sender.send(WsMessage::Text(json)).await?;
    Ok(())
}

/// Handle WebSocket upgrade for `/ws/watch`
pub async fn handle_watch_upgrade(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let setup = ViewParams::parse(req.uri().query()).and_then(|params| {
        let principal = caller(&state, &req, &params)?;
        let target = params.target()?;
        if let Some(target) = &target {
            authorize_view(&state.catalog, principal.as_ref(), target)?;
        }
        Ok((principal, target))
    });
    let (principal, target) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            warn!(error = %e, "Watch WebSocket rejected");
            return error_response(e);
        }
    };

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => {
                        if let Err(e) = handle_watch_connection(ws, state, principal, target).await {
                            warn!("Watch WebSocket error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("WebSocket upgrade failed: {:?}", e);
                    }
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => upgrade_failed(e),
    }
}

async fn handle_watch_connection(
    ws: HyperWebSocket,
    state: Arc<AppState>,
    principal: Option<Principal>,
    target: Option<ViewTarget>,
) -> WsResult {
    let (mut sender, mut receiver) = ws.split();
    let mut view = state.sync.watch(target);

    info!(
        user_id = principal.as_ref().map(|p| p.id.as_str()),
        view = ?view.target(),
        "Watch WebSocket connected"
    );

    send_json(
        &mut sender,
        &WatchServerMessage::State {
            target: view.target(),
            state: view.state(),
        },
    )
    .await?;

    let outcome: WsResult = loop {
        tokio::select! {
            changed = view.changed() => {
                let Ok(next) = changed else { break Ok(()) };
                let message = WatchServerMessage::State { target: view.target(), state: next };
                if let Err(e) = send_json(&mut sender, &message).await {
                    break Err(e);
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = match serde_json::from_str::<WatchClientMessage>(&text) {
                            Ok(WatchClientMessage::Ping) => Some(WatchServerMessage::Pong),
                            Ok(message) => {
                                let next = retarget_from(message).and_then(|target| {
                                    if let Some(t) = &target {
                                        authorize_view(&state.catalog, principal.as_ref(), t)?;
                                    }
                                    Ok(target)
                                });
                                match next {
                                    Ok(target) => {
                                        debug!(view = ?target, "Watch retargeted");
                                        view.retarget(target);
                                        None
                                    }
                                    Err(e) => Some(WatchServerMessage::Error { message: e.to_string() }),
                                }
                            }
                            Err(e) => Some(WatchServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            }),
                        };
                        if let Some(reply) = reply {
                            if let Err(e) = send_json(&mut sender, &reply).await {
                                break Err(e);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => break Err(e.into()),
                    _ => {}
                }
            }
        }
    };

    view.close().await;
    info!("Watch WebSocket connection closed");
    outcome
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationParams {
    user_id: Option<String>,
    token: Option<String>,
}

/// Resolve and authorize the caller and the user whose feed it publishes
fn location_caller(
    state: &AppState,
    query: Option<&str>,
    auth_header: Option<&str>,
) -> Result<(Principal, String)> {
    let params = serde_urlencoded::from_str::<LocationParams>(query.unwrap_or(""))
        .map_err(|e| BeaconError::BadRequest(format!("Invalid query string: {}", e)))?;
    let principal = state
        .principal(auth_header, params.token.as_deref())?
        .ok_or_else(|| BeaconError::Unauthorized("Sign-in required".into()))?;
    let user_id = params.user_id.unwrap_or_else(|| principal.id.clone());
    state.locations.authorize(&principal, &user_id)?;
    Ok((principal, user_id))
}

/// Handle WebSocket upgrade for `/ws/location`.
///
/// The feed is opened only after the handshake completes, so a failed
/// upgrade leaves the user's running feed in place.
pub async fn handle_location_upgrade<B>(
    state: Arc<AppState>,
    req: Request<B>,
) -> Response<Full<Bytes>> {
    let auth_header = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let (principal, user_id) = match location_caller(&state, req.uri().query(), auth_header) {
        Ok(caller) => caller,
        Err(e) => {
            warn!(error = %e, "Location WebSocket rejected");
            return error_response(e);
        }
    };

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            let window_ms = state.locations.window().as_millis() as u64;
            tokio::spawn(async move {
                let ws = match websocket.await {
                    Ok(ws) => ws,
                    Err(e) => {
                        error!("WebSocket upgrade failed: {:?}", e);
                        return;
                    }
                };
                let (tx, source) = ChannelSource::new(LOCATION_BUFFER);
                let feed = match state.locations.open_feed(&principal, &user_id, source) {
                    Ok(feed) => feed,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Location feed not opened");
                        return;
                    }
                };
                if let Err(e) = handle_location_connection(ws, feed, tx, window_ms).await {
                    warn!("Location WebSocket error: {}", e);
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => upgrade_failed(e),
    }
}

async fn handle_location_connection(
    ws: HyperWebSocket,
    feed: LocationFeed,
    tx: tokio::sync::mpsc::Sender<crate::location::GeoResult>,
    window_ms: u64,
) -> WsResult {
    let (mut sender, mut receiver) = ws.split();
    let user_id = feed.user_id().to_string();

    send_json(
        &mut sender,
        &LocationServerMessage::Started {
            user_id: user_id.clone(),
            window_ms,
        },
    )
    .await?;

    let outcome: WsResult = loop {
        let Some(msg) = receiver.next().await else { break Ok(()) };
        match msg {
            Ok(WsMessage::Text(text)) => {
                let item = match serde_json::from_str::<LocationClientMessage>(&text) {
                    Ok(LocationClientMessage::Position(sample)) => Ok(sample),
                    Ok(LocationClientMessage::Error { code }) => Err(GeoError::from(code)),
                    Ok(LocationClientMessage::Ping) => {
                        let stats = feed.stats();
                        let pong = LocationServerMessage::Pong {
                            written: stats.written(),
                            dropped: stats.dropped(),
                            errors: stats.errors(),
                        };
                        if let Err(e) = send_json(&mut sender, &pong).await {
                            break Err(e);
                        }
                        continue;
                    }
                    Err(e) => {
                        let reply = LocationServerMessage::Error {
                            message: format!("Invalid message: {}", e),
                        };
                        if let Err(e) = send_json(&mut sender, &reply).await {
                            break Err(e);
                        }
                        continue;
                    }
                };
                // Fails once the feed has ended, e.g. replaced by a newer one
                if tx.send(item).await.is_err() {
                    let reply = LocationServerMessage::Error {
                        message: "Location feed ended".into(),
                    };
                    let _ = send_json(&mut sender, &reply).await;
                    break Ok(());
                }
            }
            Ok(WsMessage::Ping(data)) => {
                let _ = sender.send(WsMessage::Pong(data)).await;
            }
            Ok(WsMessage::Close(_)) => break Ok(()),
            Err(e) => break Err(e.into()),
            _ => {}
        }
    };

    drop(tx);
    feed.stop().await;
    info!(user_id = %user_id, "Location WebSocket connection closed");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::roles;
    use serde_json::json;

    #[test]
    fn test_view_authorization() {
        let catalog = PermissionCatalog::builtin();
        let incidents = ViewTarget::collection(INCIDENTS, Query::order_by("dateReported"));
        assert!(authorize_view(&catalog, None, &incidents).is_err());

        let reporter = Principal::new("u-1", roles::REPORTER);
        assert!(authorize_view(&catalog, Some(&reporter), &incidents).is_ok());

        let categories = ViewTarget::collection(CATEGORIES, Query::new());
        assert!(authorize_view(&catalog, None, &categories).is_ok());

        let own = ViewTarget::document(USERS, "u-1");
        let other = ViewTarget::document(USERS, "u-2");
        assert!(authorize_view(&catalog, Some(&reporter), &own).is_ok());
        assert!(authorize_view(&catalog, Some(&reporter), &other).is_err());

        let coordinator = Principal::new("c-1", roles::COORDINATOR);
        assert!(authorize_view(&catalog, Some(&coordinator), &other).is_ok());

        let unknown = ViewTarget::document("secrets", "x");
        assert!(matches!(
            authorize_view(&catalog, Some(&coordinator), &unknown),
            Err(BeaconError::BadRequest(_))
        ));
    }

    #[test]
    fn test_retarget_message_parsing() {
        let message: WatchClientMessage = serde_json::from_value(json!({
            "type": "retarget",
            "collection": "incidents",
            "orderBy": "assignedTo",
            "equalTo": "Team-A"
        }))
        .unwrap();
        assert_eq!(
            retarget_from(message).unwrap(),
            Some(ViewTarget::collection(
                INCIDENTS,
                Query::order_by("assignedTo").equal_to("Team-A")
            ))
        );

        let message: WatchClientMessage =
            serde_json::from_value(json!({ "type": "retarget" })).unwrap();
        assert_eq!(retarget_from(message).unwrap(), None);

        let message: WatchClientMessage = serde_json::from_value(json!({
            "type": "retarget", "collection": "incidents", "equalTo": 1
        }))
        .unwrap();
        assert!(retarget_from(message).is_err());
    }

    #[test]
    fn test_location_message_parsing() {
        let message: LocationClientMessage = serde_json::from_value(json!({
            "type": "position", "latitude": 1.0, "longitude": 2.0, "accuracy": 5.0
        }))
        .unwrap();
        assert!(matches!(message, LocationClientMessage::Position(s) if s.longitude == 2.0));

        let message: LocationClientMessage =
            serde_json::from_value(json!({ "type": "error", "code": "timeout" })).unwrap();
        assert!(matches!(
            message,
            LocationClientMessage::Error { code: GeoErrorCode::Timeout }
        ));
    }

    #[test]
    fn test_state_frame_shape() {
        let frame = WatchServerMessage::State {
            target: None,
            state: ViewState::idle(0),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["state"]["loading"], false);
        assert!(json["target"].is_null());
    }

    #[tokio::test]
    async fn test_failed_handshake_keeps_running_feed() {
        let state = Arc::new(crate::server::http::tests::test_state());
        let responder = Principal::new("r-1", roles::RESPONDER);
        let (_tx, source) = ChannelSource::new(4);
        let running = state.locations.open_feed(&responder, "r-1", source).unwrap();

        let token = state.jwt.generate_token(&responder).unwrap();
        let req = Request::builder()
            .uri(format!("/ws/location?token={}", token))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        let response = handle_location_upgrade(state.clone(), req).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.locations.is_active("r-1"));
        assert!(!running.is_finished());
        running.stop().await;
    }

    #[tokio::test]
    async fn test_location_upgrade_rejects_before_handshake() {
        let state = Arc::new(crate::server::http::tests::test_state());
        let req = Request::builder().uri("/ws/location").body(()).unwrap();
        let response = handle_location_upgrade(state.clone(), req).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let reporter = Principal::new("u-1", roles::REPORTER);
        let token = state.jwt.generate_token(&reporter).unwrap();
        let req = Request::builder()
            .uri(format!("/ws/location?token={}", token))
            .body(())
            .unwrap();
        let response = handle_location_upgrade(state.clone(), req).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.locations.active_feeds(), 0);
    }
}
