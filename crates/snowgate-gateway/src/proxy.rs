//! Request forwarding with retries and outcome accounting.
//!
//! The proxy owns the request lifecycle after validation: pick a node, try
//! the upstream with bounded retries, classify the failure or pass the
//! response through, and record the final outcome into the breaker and the
//! cache. Intermediate attempt failures never mark the breaker; only the
//! final outcome does.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hyper::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use snowgate_common::{GatewayError, RpcCall, RpcError, RpcPayload, RpcResponse};

use crate::balancer::{LoadBalancer, Strategy};
use crate::cache::{self, ResponseCache};
use crate::node::{Network, NodeId};
use crate::registry::NodeRegistry;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Per-attempt upstream timeout
    pub timeout: Duration,
    /// Additional attempts after the first
    pub retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// User-Agent header on forwarded requests
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 2,
            retry_delay: Duration::from_secs(1),
            user_agent: format!("snowgate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProxyConfig {
    /// Defaults for the HTTP front-handler path.
    ///
    /// The front door sits under its own outer deadline, so it grants
    /// upstreams 15 s per attempt instead of the 5 s library default.
    pub fn front_handler() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            ..Self::default()
        }
    }
}

/// Forwarded-request accounting for one node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeRequestStats {
    pub requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_at_ms: Option<u64>,
}

/// Result of handling one inbound payload: the JSON body to return and the
/// HTTP status the front door should use.
#[derive(Debug, Clone)]
pub struct ProxyOutcome {
    pub body: Value,
    pub status: StatusCode,
}

impl ProxyOutcome {
    fn ok(body: Value) -> Self {
        Self {
            body,
            status: StatusCode::OK,
        }
    }
}

pub struct RpcProxy {
    client: reqwest::Client,
    registry: Arc<NodeRegistry>,
    balancer: Arc<LoadBalancer>,
    cache: Arc<ResponseCache>,
    config: ProxyConfig,
    node_stats: RwLock<HashMap<NodeId, NodeRequestStats>>,
}

impl RpcProxy {
    pub fn new(
        registry: Arc<NodeRegistry>,
        balancer: Arc<LoadBalancer>,
        cache: Arc<ResponseCache>,
        config: ProxyConfig,
    ) -> snowgate_common::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            registry,
            balancer,
            cache,
            config,
            node_stats: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Handles a validated payload end to end: cache, selection, forward,
    /// outcome accounting.
    pub async fn handle(
        &self,
        payload: RpcPayload,
        network: Network,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> ProxyOutcome {
        // Payloads with no forwardable entry are answered locally.
        if payload.valid_requests().is_empty() {
            return ProxyOutcome::ok(local_error_body(&payload));
        }

        let cacheable = cache::payload_cacheable(&payload);
        let cache_key = cache::payload_cache_key(&payload);
        let method_label = cache_label(&payload);

        if cacheable {
            if let Some(key) = &cache_key {
                if let Some(hit) = self.cache.get(key, &method_label) {
                    debug!(key = key.as_str(), "cache hit");
                    return ProxyOutcome::ok(hit);
                }
            }
        }

        let Some(node) = self.balancer.select(network, strategy, capability, session_id) else {
            let healthy = self.registry.list_healthy_by_network(network);
            let error = if healthy.is_empty() {
                GatewayError::NoNodeAvailable(format!("no healthy node for {network}"))
            } else if capability
                .map(|cap| !healthy.iter().any(|n| n.has_capability(cap)))
                .unwrap_or(false)
            {
                GatewayError::NoNodeAvailable(format!(
                    "no healthy node for {network} with capability {}",
                    capability.unwrap_or_default()
                ))
            } else {
                GatewayError::CircuitOpen
            };
            return ProxyOutcome {
                body: payload_error_body(&payload, &error.to_rpc_error()),
                status: error.http_status(),
            };
        };

        self.record_node_request(&node.id);

        let upstream_body = upstream_request_body(&payload);
        let mut last_error = GatewayError::Upstream("no attempt made".into());

        for attempt in 0..=self.config.retries {
            match self.forward_once(&node.url, &upstream_body).await {
                Ok(upstream) => {
                    self.balancer.record_successful_request(&node.id);
                    return self.finish_success(&payload, upstream, cacheable, cache_key);
                }
                Err(e) => {
                    if attempt < self.config.retries && e.is_retryable() {
                        warn!(
                            node = node.id.as_str(),
                            attempt = attempt + 1,
                            error = %e,
                            "forward attempt failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                        last_error = e;
                        continue;
                    }
                    last_error = e;
                    break;
                }
            }
        }

        self.balancer.record_failed_request(&node.id);
        warn!(node = node.id.as_str(), error = %last_error, "forward failed after retries");
        ProxyOutcome {
            body: payload_error_body(&payload, &last_error.to_rpc_error()),
            status: last_error.http_status(),
        }
    }

    /// One attempt against one node.
    async fn forward_once(
        &self,
        url: &str,
        body: &Value,
    ) -> std::result::Result<Value, GatewayError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(self.config.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.timeout.as_millis() as u64)
                } else if e.is_connect() {
                    GatewayError::ConnectionRefused(e.to_string())
                } else {
                    GatewayError::Transport(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(GatewayError::UpstreamAuth),
            StatusCode::TOO_MANY_REQUESTS => return Err(GatewayError::RateLimited),
            status if !status.is_success() => {
                return Err(GatewayError::Upstream(format!("upstream HTTP {status}")))
            }
            _ => {}
        }

        response.json().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.config.timeout.as_millis() as u64)
            } else {
                GatewayError::Upstream(format!("upstream body not JSON: {e}"))
            }
        })
    }

    /// Final-success bookkeeping: merge, cache, invalidate.
    fn finish_success(
        &self,
        payload: &RpcPayload,
        upstream: Value,
        cacheable: bool,
        cache_key: Option<String>,
    ) -> ProxyOutcome {
        let body = if payload.is_batch() {
            merge_batch_responses(payload, upstream)
        } else {
            upstream
        };

        if cacheable {
            if let Some(key) = cache_key {
                let ttl = cache::payload_ttl(payload);
                // insert refuses payloads carrying an error field
                self.cache.insert(key, body.clone(), ttl);
            }
        }

        // State-changing methods that actually succeeded invalidate the read
        // entries they can affect.
        for req in payload.valid_requests() {
            if entry_succeeded(&body, &req.id) {
                self.cache.invalidate_on_state_change(&req.method);
            }
        }

        ProxyOutcome::ok(body)
    }

    fn record_node_request(&self, id: &str) {
        let mut stats = self.node_stats.write().unwrap();
        let s = stats.entry(id.to_string()).or_default();
        s.requests += 1;
        s.last_request_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .ok();
    }

    /// Forwarded-request counters per node.
    pub fn node_request_stats(&self) -> HashMap<NodeId, NodeRequestStats> {
        self.node_stats.read().unwrap().clone()
    }
}

/// Metrics label for the cache: the method for a single call, "batch"
/// otherwise.
fn cache_label(payload: &RpcPayload) -> String {
    match payload {
        RpcPayload::Single(RpcCall::Valid(req)) => req.method.clone(),
        RpcPayload::Single(RpcCall::Invalid { .. }) => "invalid".into(),
        RpcPayload::Batch(_) => "batch".into(),
    }
}

/// Body sent upstream: the single request, or the array of valid entries.
fn upstream_request_body(payload: &RpcPayload) -> Value {
    match payload {
        RpcPayload::Single(RpcCall::Valid(req)) => json!(req),
        RpcPayload::Batch(_) => {
            Value::Array(payload.valid_requests().iter().map(|r| json!(r)).collect())
        }
        RpcPayload::Single(RpcCall::Invalid { .. }) => Value::Null,
    }
}

/// Response body when every entry is answered locally (validation errors).
fn local_error_body(payload: &RpcPayload) -> Value {
    match payload {
        RpcPayload::Single(call) => match call.to_error_response() {
            Some(res) => json!(res),
            None => Value::Null,
        },
        RpcPayload::Batch(calls) => Value::Array(
            calls
                .iter()
                .map(|call| match call.to_error_response() {
                    Some(res) => json!(res),
                    None => Value::Null,
                })
                .collect(),
        ),
    }
}

/// Response body when the forward failed: every valid entry maps to the
/// synthesised error under its own id, invalid entries keep their
/// validation errors.
fn payload_error_body(payload: &RpcPayload, error: &RpcError) -> Value {
    let entry = |call: &RpcCall| match call {
        RpcCall::Valid(req) => json!(RpcResponse::error(req.id.clone(), error.clone())),
        RpcCall::Invalid { id, error } => json!(RpcResponse::error(id.clone(), error.clone())),
    };
    match payload {
        RpcPayload::Single(call) => entry(call),
        RpcPayload::Batch(calls) => Value::Array(calls.iter().map(entry).collect()),
    }
}

/// Reassembles a batch response in the original entry order.
///
/// The upstream may answer the forwarded entries in any order; responses are
/// matched back by id. Invalid entries keep their local validation errors at
/// the same index. A forwarded entry the upstream did not answer gets a
/// synthesised internal error.
fn merge_batch_responses(payload: &RpcPayload, upstream: Value) -> Value {
    let upstream_entries: Vec<Value> = match upstream {
        Value::Array(items) => items,
        // A non-array reply to a batch is a broken upstream; surface it per
        // entry rather than returning an unkeyed blob.
        other => {
            let error = RpcError::internal_error("upstream returned a non-batch response")
                .with_details(other.to_string());
            return payload_error_body(payload, &error);
        }
    };

    let mut by_id: HashMap<String, Value> = upstream_entries
        .into_iter()
        .filter_map(|entry| {
            entry
                .get("id")
                .map(|id| (canonical_id(id), entry.clone()))
        })
        .collect();

    let entries: Vec<Value> = payload
        .calls()
        .iter()
        .map(|call| match call {
            RpcCall::Invalid { id, error } => {
                json!(RpcResponse::error(id.clone(), error.clone()))
            }
            RpcCall::Valid(req) => by_id.remove(&canonical_id(&req.id)).unwrap_or_else(|| {
                json!(RpcResponse::error(
                    req.id.clone(),
                    RpcError::internal_error("upstream omitted a batch entry"),
                ))
            }),
        })
        .collect();

    Value::Array(entries)
}

/// Did the response entry for this id complete without an error object?
fn entry_succeeded(body: &Value, id: &Value) -> bool {
    match body {
        Value::Object(map) => {
            map.get("id") == Some(id) && !map.contains_key("error")
        }
        Value::Array(items) => items.iter().any(|entry| {
            entry.get("id") == Some(id)
                && entry
                    .as_object()
                    .map(|o| !o.contains_key("error"))
                    .unwrap_or(false)
        }),
        _ => false,
    }
}

fn canonical_id(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch_payload() -> RpcPayload {
        RpcPayload::parse(json!([
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1},
            {"jsonrpc": "2.0", "params": [], "id": 2},
            {"jsonrpc": "2.0", "method": "eth_gasPrice", "params": [], "id": 3},
        ]))
    }

    #[test]
    fn upstream_body_excludes_invalid_entries() {
        let body = upstream_request_body(&batch_payload());
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["id"], json!(1));
        assert_eq!(entries[1]["id"], json!(3));
    }

    #[test]
    fn merge_restores_original_order_and_local_errors() {
        let payload = batch_payload();
        // Upstream answers out of order.
        let upstream = json!([
            {"jsonrpc": "2.0", "result": "0x5", "id": 3},
            {"jsonrpc": "2.0", "result": "0x10", "id": 1},
        ]);
        let merged = merge_batch_responses(&payload, upstream);
        let entries = merged.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["result"], json!("0x10"));
        assert_eq!(entries[1]["error"]["code"], json!(-32600));
        assert_eq!(entries[1]["id"], json!(2));
        assert_eq!(entries[2]["result"], json!("0x5"));
    }

    #[test]
    fn merge_synthesises_errors_for_omitted_entries() {
        let payload = batch_payload();
        let upstream = json!([{"jsonrpc": "2.0", "result": "0x10", "id": 1}]);
        let merged = merge_batch_responses(&payload, upstream);
        let entries = merged.as_array().unwrap();
        assert_eq!(entries[2]["error"]["code"], json!(-32603));
        assert_eq!(entries[2]["id"], json!(3));
    }

    #[test]
    fn merge_handles_non_array_upstream() {
        let payload = batch_payload();
        let merged = merge_batch_responses(&payload, json!({"unexpected": true}));
        let entries = merged.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["error"]["code"], json!(-32603));
        // The invalid entry keeps its validation error.
        assert_eq!(entries[1]["error"]["code"], json!(-32600));
    }

    #[test]
    fn error_body_maps_every_entry_id() {
        let payload = batch_payload();
        let body = payload_error_body(&payload, &RpcError::internal_error("timeout"));
        let entries = body.as_array().unwrap();
        assert_eq!(entries[0]["id"], json!(1));
        assert_eq!(entries[0]["error"]["code"], json!(-32603));
        assert_eq!(entries[1]["error"]["code"], json!(-32600));
        assert_eq!(entries[2]["id"], json!(3));
    }

    #[test]
    fn entry_succeeded_checks_single_and_batch() {
        let single_ok = json!({"jsonrpc": "2.0", "result": "0x1", "id": 1});
        let single_err = json!({"jsonrpc": "2.0", "error": {"code": -32000, "message": "x"}, "id": 1});
        assert!(entry_succeeded(&single_ok, &json!(1)));
        assert!(!entry_succeeded(&single_err, &json!(1)));
        assert!(!entry_succeeded(&single_ok, &json!(2)));

        let batch = json!([
            {"jsonrpc": "2.0", "result": "0x1", "id": 1},
            {"jsonrpc": "2.0", "error": {"code": -32000, "message": "x"}, "id": 2},
        ]);
        assert!(entry_succeeded(&batch, &json!(1)));
        assert!(!entry_succeeded(&batch, &json!(2)));
    }

    #[test]
    fn local_error_body_for_single_invalid() {
        let payload = RpcPayload::parse(json!({"jsonrpc": "2.0", "method": "x"}));
        let body = local_error_body(&payload);
        assert_eq!(body["error"]["code"], json!(-32600));
        assert_eq!(body["id"], Value::Null);
    }

    #[test]
    fn front_handler_variant_widens_the_attempt_timeout() {
        let library = ProxyConfig::default();
        let front = ProxyConfig::front_handler();
        assert_eq!(library.timeout, Duration::from_secs(5));
        assert_eq!(front.timeout, Duration::from_secs(15));
        // Only the timeout differs between the two variants.
        assert_eq!(front.retries, library.retries);
        assert_eq!(front.retry_delay, library.retry_delay);
    }

    #[test]
    fn cache_label_for_payload_shapes() {
        let single = RpcPayload::parse(
            json!({"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1}),
        );
        assert_eq!(cache_label(&single), "eth_blockNumber");
        assert_eq!(cache_label(&batch_payload()), "batch");
    }
}
