//! Centralized request validation.
//!
//! All inbound bodies pass through [`RpcPayload::parse`] exactly once; the
//! rest of the gateway operates on the resulting tagged variant instead of
//! re-checking shapes ad hoc. A batch keeps its invalid entries in place so
//! the response array preserves per-index id correspondence.

use serde_json::{json, Value};

use super::jsonrpc::{RpcError, RpcRequest, RpcResponse};

/// One entry of a payload after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    /// Structurally valid request with normalized (array) params
    Valid(RpcRequest),
    /// Failed validation; answered locally with the echoed id
    Invalid { id: Value, error: RpcError },
}

impl RpcCall {
    /// The id this call will be answered under (`null` when unparseable).
    pub fn id(&self) -> Value {
        match self {
            RpcCall::Valid(req) => req.id.clone(),
            RpcCall::Invalid { id, .. } => id.clone(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, RpcCall::Valid(_))
    }

    /// Local error response for an invalid call.
    pub fn to_error_response(&self) -> Option<RpcResponse> {
        match self {
            RpcCall::Valid(_) => None,
            RpcCall::Invalid { id, error } => Some(RpcResponse::error(id.clone(), error.clone())),
        }
    }
}

/// A parsed inbound payload: one call or an ordered batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcPayload {
    Single(RpcCall),
    Batch(Vec<RpcCall>),
}

impl RpcPayload {
    /// Validates a decoded JSON body into the tagged payload form.
    ///
    /// Never fails: malformed shapes become `Invalid` calls that echo the id
    /// when one could be extracted. JSON that does not decode at all is
    /// rejected earlier, by the HTTP layer.
    pub fn parse(body: Value) -> Self {
        match body {
            Value::Array(entries) => {
                if entries.is_empty() {
                    return RpcPayload::Single(RpcCall::Invalid {
                        id: Value::Null,
                        error: RpcError::invalid_request("empty batch"),
                    });
                }
                RpcPayload::Batch(entries.into_iter().map(validate_entry).collect())
            }
            other => RpcPayload::Single(validate_entry(other)),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, RpcPayload::Batch(_))
    }

    pub fn calls(&self) -> &[RpcCall] {
        match self {
            RpcPayload::Single(call) => std::slice::from_ref(call),
            RpcPayload::Batch(calls) => calls,
        }
    }

    /// True when every entry passed validation.
    pub fn all_valid(&self) -> bool {
        self.calls().iter().all(RpcCall::is_valid)
    }

    /// The valid requests, in order (invalid entries skipped).
    pub fn valid_requests(&self) -> Vec<&RpcRequest> {
        self.calls()
            .iter()
            .filter_map(|call| match call {
                RpcCall::Valid(req) => Some(req),
                RpcCall::Invalid { .. } => None,
            })
            .collect()
    }
}

/// Validates one request object and normalizes its params.
fn validate_entry(value: Value) -> RpcCall {
    let obj = match value {
        Value::Object(obj) => obj,
        _ => {
            return RpcCall::Invalid {
                id: Value::Null,
                error: RpcError::invalid_request("request must be an object"),
            }
        }
    };

    // Extract the id first so later failures can echo it.
    let id = match obj.get("id") {
        Some(Value::Number(n)) => Value::Number(n.clone()),
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Null) | None => {
            return RpcCall::Invalid {
                id: Value::Null,
                error: RpcError::invalid_request("id is required; notifications are not supported"),
            }
        }
        Some(_) => {
            return RpcCall::Invalid {
                id: Value::Null,
                error: RpcError::invalid_request("id must be a number or string"),
            }
        }
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == "2.0" => {}
        _ => {
            return RpcCall::Invalid {
                id,
                error: RpcError::invalid_request("jsonrpc version must be \"2.0\""),
            }
        }
    }

    let method = match obj.get("method") {
        Some(Value::String(m)) if !m.is_empty() => m.clone(),
        _ => {
            return RpcCall::Invalid {
                id,
                error: RpcError::invalid_request("method must be a non-empty string"),
            }
        }
    };

    let params = normalize_params(obj.get("params").cloned());

    RpcCall::Valid(RpcRequest::new(method, params, id))
}

/// Absent params become `[]`; a bare scalar or object becomes a one-element
/// array; arrays pass through.
fn normalize_params(params: Option<Value>) -> Value {
    match params {
        None | Some(Value::Null) => json!([]),
        Some(Value::Array(items)) => Value::Array(items),
        Some(scalar) => json!([scalar]),
    }
}
