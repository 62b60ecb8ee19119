//! HTTP front door.
//!
//! axum server exposing the JSON-RPC endpoint at `POST /`, the health report
//! at `GET /health`, the metrics snapshot at `GET /metrics`, and the admin
//! enable/disable surface. JSON-RPC error envelopes ride on HTTP 200; only
//! transport-level gateway failures change the status (400 unparseable, 503
//! no backend, 504 timeout, 502 proxy failure). Non-POST on `/` gets the
//! default 405.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use hyper::body::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use snowgate_common::http::{json_response, parse_body, JsonResponse};
use snowgate_common::{GatewayError, Result, RpcError, RpcResponse};

use crate::balancer::Strategy;
use crate::gateway::Gateway;
use crate::node::Network;

/// Cookie carrying the sticky-session id.
const SESSION_COOKIE: &str = "avax_session";
/// Header alternative to the cookie.
const SESSION_HEADER: &str = "x-session-id";

pub struct HttpServer {
    gateway: Arc<Gateway>,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// The axum router; split out so tests can serve it on an ephemeral port.
    pub fn router(&self) -> axum::Router {
        axum::Router::new()
            .route("/", post(handle_jsonrpc))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .route("/admin/nodes/{id}/enable", post(handle_enable))
            .route("/admin/nodes/{id}/disable", post(handle_disable))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.gateway))
    }

    /// Binds and serves until the process is stopped.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        info!("gateway listening on {local}");

        axum::serve(listener, app)
            .await
            .map_err(|e| GatewayError::Transport(format!("server error: {e}")))?;
        Ok(())
    }
}

async fn handle_jsonrpc(
    State(gateway): State<Arc<Gateway>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    // Query conveniences: ?network=...&strategy=...&capability=...
    let network = match params.get("network") {
        Some(raw) => match raw.parse::<Network>() {
            Ok(network) => Some(network),
            Err(e) => return bad_request(&e),
        },
        None => None,
    };
    let strategy = match params.get("strategy") {
        Some(raw) => match raw.parse::<Strategy>() {
            Ok(strategy) => strategy,
            Err(e) => return bad_request(&e),
        },
        None => Strategy::default(),
    };
    let capability = params.get("capability").map(String::as_str);

    // Sticky carrier: cookie, then header, then a freshly minted id.
    let (session_id, minted) = match strategy {
        Strategy::Sticky => {
            let existing = cookie_value(&headers, SESSION_COOKIE).or_else(|| {
                headers
                    .get(SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
            match existing {
                Some(sid) => (Some(sid), false),
                None => (Some(Uuid::new_v4().to_string()), true),
            }
        }
        _ => (None, false),
    };

    let payload = match parse_body(&body) {
        Ok(payload) => payload,
        Err(e) => {
            let envelope = RpcResponse::error(serde_json::Value::Null, e.to_rpc_error());
            return json_response(e.http_status(), &json!(envelope));
        }
    };

    let outcome = gateway
        .handle(payload, network, strategy, capability, session_id.as_deref())
        .await;

    let mut response = json_response(outcome.status, &outcome.body);
    if minted {
        if let Some(sid) = &session_id {
            let cookie = format!(
                "{SESSION_COOKIE}={sid}; Path=/; Max-Age={}; SameSite=Strict",
                gateway.balancer().config().session_ttl.as_secs()
            );
            if let Ok(value) = cookie.parse() {
                response.headers_mut().insert("Set-Cookie", value);
            }
        }
    }
    response
}

async fn handle_health(State(gateway): State<Arc<Gateway>>) -> JsonResponse {
    json_response(StatusCode::OK, &json!(gateway.health_report()))
}

async fn handle_metrics(State(gateway): State<Arc<Gateway>>) -> JsonResponse {
    json_response(StatusCode::OK, &gateway.metrics_snapshot())
}

async fn handle_enable(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> JsonResponse {
    set_node_health(&gateway, &id, true)
}

async fn handle_disable(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> JsonResponse {
    set_node_health(&gateway, &id, false)
}

fn set_node_health(gateway: &Gateway, id: &str, healthy: bool) -> JsonResponse {
    if gateway.registry().get(id).is_none() {
        return json_response(
            StatusCode::NOT_FOUND,
            &json!({"error": format!("unknown node: {id}")}),
        );
    }
    gateway.health().force_update_health(id, healthy);
    json_response(StatusCode::OK, &json!({"id": id, "healthy": healthy}))
}

fn bad_request(message: &str) -> JsonResponse {
    let envelope = RpcResponse::error(
        serde_json::Value::Null,
        RpcError::invalid_params(message),
    );
    json_response(StatusCode::BAD_REQUEST, &json!(envelope))
}

/// Extracts a cookie value from the Cookie header.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get("cookie")?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|pair| {
        pair.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_string)
    })
}
