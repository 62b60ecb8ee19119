//! HTTP body helpers for the JSON-RPC front door.
//!
//! Decodes raw POST bodies into validated [`RpcPayload`]s and renders
//! JSON-RPC values back into HTTP responses.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde_json::Value;

use crate::protocol::error::GatewayError;
use crate::protocol::payload::RpcPayload;

/// Maximum inbound payload size in bytes (10 MB).
///
/// Requests above this size are rejected before JSON decoding to bound
/// memory use per connection.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// HTTP response with a fully buffered body.
pub type JsonResponse = Response<Full<Bytes>>;

/// Decodes and validates an inbound body.
///
/// # Errors
///
/// - [`GatewayError::PayloadTooLarge`] when the body exceeds [`MAX_PAYLOAD_SIZE`]
/// - [`GatewayError::Parse`] when the body is empty or not JSON
pub fn parse_body(body: &[u8]) -> Result<RpcPayload, GatewayError> {
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(GatewayError::PayloadTooLarge(body.len(), MAX_PAYLOAD_SIZE));
    }
    if body.is_empty() {
        return Err(GatewayError::Parse("empty request body".into()));
    }
    let value: Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::Parse(e.to_string()))?;
    Ok(RpcPayload::parse(value))
}

/// Renders a JSON value as an HTTP response with the given status.
pub fn json_response(status: StatusCode, body: &Value) -> JsonResponse {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response parts are valid")
}
