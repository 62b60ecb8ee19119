use hyper::StatusCode;
use thiserror::Error;

use super::jsonrpc::{self, RpcError};

/// Gateway error taxonomy.
///
/// Every variant knows its JSON-RPC error code and the HTTP status the front
/// door should answer with. Upstream JSON-RPC *application* errors are not
/// represented here; those pass through verbatim inside the response body.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Request body of {0} bytes exceeds maximum allowed size of {1} bytes")]
    PayloadTooLarge(usize, usize),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Upstream rejected authentication")]
    UpstreamAuth,

    #[error("Upstream rate limit exceeded")]
    RateLimited,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("No node available: {0}")]
    NoNodeAvailable(String),

    #[error("All admissible circuits are open")]
    CircuitOpen,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// JSON-RPC error object synthesised for this failure.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            GatewayError::Parse(_) => RpcError::parse_error(),
            GatewayError::PayloadTooLarge(..) => RpcError::invalid_request(&self.to_string()),
            GatewayError::Timeout(_) => RpcError::internal_error(&self.to_string()),
            GatewayError::ConnectionRefused(_) => RpcError::node_unavailable(&self.to_string()),
            GatewayError::UpstreamAuth => {
                RpcError::new(jsonrpc::AUTHENTICATION_ERROR, "Authentication required")
            }
            GatewayError::RateLimited => {
                RpcError::new(jsonrpc::RATE_LIMITED, "Rate limit exceeded")
            }
            GatewayError::NoNodeAvailable(_) => RpcError::node_unavailable(&self.to_string()),
            GatewayError::CircuitOpen => RpcError::circuit_open(),
            GatewayError::Cache(msg) => RpcError::new(jsonrpc::CACHE_ERROR, msg.clone()),
            other => RpcError::server_error(&other.to_string()),
        }
    }

    /// HTTP status surfaced by the front door for this failure.
    ///
    /// JSON-RPC error envelopes normally ride on 200; only transport-level
    /// gateway failures change the status.
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::Parse(_) | GatewayError::PayloadTooLarge(..) => StatusCode::BAD_REQUEST,
            GatewayError::NoNodeAvailable(_) | GatewayError::CircuitOpen => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ConnectionRefused(_)
            | GatewayError::UpstreamAuth
            | GatewayError::RateLimited
            | GatewayError::Upstream(_)
            | GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient failures worth another attempt against the same node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::ConnectionRefused(_)
                | GatewayError::RateLimited
                | GatewayError::Upstream(_)
                | GatewayError::Transport(_)
        )
    }
}
