//! JSON-RPC 2.0 protocol types.
//!
//! Wire format per the JSON-RPC 2.0 specification:
//! - Request: `{"jsonrpc": "2.0", "method": "...", "params": ..., "id": ...}`
//! - Response: `{"jsonrpc": "2.0", "result": ..., "id": ...}` or
//!   `{"jsonrpc": "2.0", "error": {...}, "id": ...}`
//!
//! A response carries exactly one of `result` or `error`; the absent field is
//! omitted from the serialized form rather than emitted as `null`.
//!
//! # Error codes
//!
//! Standard JSON-RPC 2.0 codes plus the gateway's own range:
//! - `-32700` parse error, `-32600` invalid request, `-32601` method not
//!   found, `-32602` invalid params, `-32603` internal error
//! - `-32000` upstream server error
//! - `-32001` upstream authentication, `-32003` node unavailable,
//!   `-32005` rate limit, `-32006` circuit open, `-32007` cache error

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    /// Protocol version, must be "2.0"
    pub jsonrpc: String,
    /// Name of the method to invoke
    pub method: String,
    /// Parameter values; the gateway normalizes these to an array
    #[serde(default)]
    pub params: Value,
    /// Request identifier (number or string)
    pub id: Value,
}

impl RpcRequest {
    /// Creates a request with normalized (array) params.
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response carrying either a result or an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Invalid JSON was received by the server
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error (includes upstream timeouts)
pub const INTERNAL_ERROR: i64 = -32603;
/// Generic upstream server error
pub const SERVER_ERROR: i64 = -32000;
/// Upstream rejected the gateway's credentials
pub const AUTHENTICATION_ERROR: i64 = -32001;
/// No backend node reachable
pub const NODE_UNAVAILABLE: i64 = -32003;
/// Upstream rate limit hit
pub const RATE_LIMITED: i64 = -32005;
/// Every admissible circuit is open
pub const CIRCUIT_OPEN: i64 = -32006;
/// Response cache failure
pub const CACHE_ERROR: i64 = -32007;

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a human-readable cause in the `data` field.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.data = Some(Value::String(details.into()));
        self
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(msg: &str) -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request").with_details(msg)
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params(msg: &str) -> Self {
        Self::new(INVALID_PARAMS, msg)
    }

    pub fn internal_error(msg: &str) -> Self {
        Self::new(INTERNAL_ERROR, msg)
    }

    pub fn server_error(msg: &str) -> Self {
        Self::new(SERVER_ERROR, msg)
    }

    pub fn node_unavailable(msg: &str) -> Self {
        Self::new(NODE_UNAVAILABLE, "Node unavailable").with_details(msg)
    }

    pub fn circuit_open() -> Self {
        Self::new(CIRCUIT_OPEN, "All circuits open for the requested network")
    }
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// True when the response carries an error object.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
