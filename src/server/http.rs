//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Mutations are plain
//! REST routes; live views and location feeds are WebSocket upgrades.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_LENGTH};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::advisory::{AdvisoryBackend, AdvisoryBridge};
use crate::auth::{JwtValidator, PermissionCatalog, Principal};
use crate::config::Args;
use crate::incident::{CategoryService, IncidentService};
use crate::location::LocationService;
use crate::routes::{self, error_response, MAX_BODY_BYTES};
use crate::server::websocket;
use crate::store::DocumentStore;
use crate::sync::SyncHub;
use crate::types::{BeaconError, Result};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Arc<dyn DocumentStore>,
    pub catalog: Arc<PermissionCatalog>,
    pub jwt: JwtValidator,
    pub incidents: IncidentService,
    pub categories: CategoryService,
    /// Per-user location feeds (one writer per user)
    pub locations: LocationService,
    /// Live views backing `/ws/watch`
    pub sync: SyncHub,
    pub advisory: Arc<AdvisoryBridge>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        args: Args,
        store: Arc<dyn DocumentStore>,
        catalog: PermissionCatalog,
        jwt: JwtValidator,
        advisory: Arc<dyn AdvisoryBackend>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let advisory = Arc::new(AdvisoryBridge::new(
            advisory,
            Arc::clone(&store),
            args.advisory_timeout(),
        ));

        let incidents = IncidentService::new(Arc::clone(&store), Arc::clone(&catalog))
            .with_advisory(Arc::clone(&advisory));
        let categories = CategoryService::new(Arc::clone(&store), Arc::clone(&catalog));
        let locations =
            LocationService::new(Arc::clone(&store), Arc::clone(&catalog), args.location_window());
        let sync = SyncHub::new(Arc::clone(&store), args.sync_retry());

        Self {
            args,
            store,
            catalog,
            jwt,
            incidents,
            categories,
            locations,
            sync,
            advisory,
            started_at: Instant::now(),
        }
    }

    /// Resolve the caller from the Authorization header, falling back to a
    /// `?token=` query value (browsers cannot set headers on WebSockets)
    pub fn principal(
        &self,
        auth_header: Option<&str>,
        query_token: Option<&str>,
    ) -> Result<Option<Principal>> {
        match (auth_header, query_token) {
            (Some(header), _) => self.jwt.principal_from_header(Some(header)),
            (None, Some(token)) => self.jwt.verify_token(token).map(Some),
            (None, None) => Ok(None),
        }
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Beacon listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - dev JWT secret may be in use");
    }

    info!(
        store = state.store.backend(),
        advisory = state.advisory.backend_id(),
        advisory_enabled = state.advisory.is_enabled(),
        location_window_secs = state.locations.window().as_secs(),
        "Services ready"
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
                // Back off on fd exhaustion and similar
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    debug!("[{}] {} {}", addr, method, path);

    if method == Method::OPTIONS {
        return Ok(to_boxed(preflight_response()));
    }

    // WebSocket routes take the request whole
    if method == Method::GET {
        match path.as_str() {
            "/ws/watch" | "/ws/location" if !hyper_tungstenite::is_upgrade_request(&req) => {
                return Ok(to_boxed(error_response(BeaconError::BadRequest(
                    "Endpoint requires WebSocket upgrade".into(),
                ))));
            }
            "/ws/watch" => return Ok(to_boxed(websocket::handle_watch_upgrade(state, req).await)),
            "/ws/location" => {
                return Ok(to_boxed(websocket::handle_location_upgrade(state, req).await))
            }
            _ => {}
        }
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let declared_length = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_length.is_some_and(|len| len > MAX_BODY_BYTES) {
        return Ok(to_boxed(error_response(BeaconError::BadRequest(format!(
            "Request body exceeds {} bytes",
            MAX_BODY_BYTES
        )))));
    }

    let body = match read_body(req.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return Ok(to_boxed(error_response(e))),
    };

    let response = dispatch(
        &state,
        &method,
        &path,
        query.as_deref(),
        auth_header.as_deref(),
        &body,
    )
    .await;

    debug!("[{}] {} {} -> {}", addr, method, path, response.status());
    Ok(to_boxed(response))
}

/// Collect a request body, failing as soon as it grows past `limit` bytes.
/// Covers chunked bodies that declare no length.
pub(crate) async fn read_body<B>(body: B, limit: usize) -> Result<Bytes>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(BeaconError::BadRequest(format!(
            "Request body exceeds {} bytes",
            limit
        ))),
        Err(e) => Err(BeaconError::BadRequest(format!(
            "Failed to read request body: {}",
            e
        ))),
    }
}

/// Route a request whose body has already been collected
pub async fn dispatch(
    state: &AppState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    auth_header: Option<&str>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if method == Method::GET && matches!(segments.as_slice(), ["health"] | ["healthz"]) {
        return routes::health_check(state);
    }

    let principal = match state.principal(auth_header, None) {
        Ok(principal) => principal,
        Err(e) => return error_response(e),
    };
    let principal = principal.as_ref();

    match (method, segments.as_slice()) {
        (&Method::GET, ["me", "permissions"]) => routes::handle_my_permissions(state, principal),

        (&Method::GET, ["incidents"]) => {
            routes::handle_list_incidents(state, principal, query).await
        }
        (&Method::POST, ["incidents"]) => {
            routes::handle_create_incident(state, principal, body).await
        }
        (&Method::GET, ["incidents", id]) => {
            routes::handle_get_incident(state, principal, id).await
        }
        (&Method::PATCH, ["incidents", id]) => {
            routes::handle_update_incident(state, principal, id, body).await
        }
        (&Method::DELETE, ["incidents", id]) => {
            routes::handle_delete_incident(state, principal, id).await
        }
        (&Method::POST, ["incidents", id, "transition"]) => {
            routes::handle_transition_incident(state, principal, id, body).await
        }

        (&Method::GET, ["categories"]) => routes::handle_list_categories(state).await,
        (&Method::POST, ["categories"]) => {
            routes::handle_create_category(state, principal, body).await
        }
        (&Method::DELETE, ["categories", id]) => {
            routes::handle_delete_category(state, principal, id).await
        }

        (&Method::PUT, ["users", id, "location"]) => {
            routes::handle_set_location(state, principal, id, body).await
        }

        _ => not_found_response(path),
    }
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PATCH, PUT, DELETE, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "NotFound",
        "path": path,
    });
    routes::json_response(StatusCode::NOT_FOUND, &body)
}
