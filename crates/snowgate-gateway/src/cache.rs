//! Method-aware response cache.
//!
//! Keys are a deterministic canonicalisation of method and params, so
//! equivalent requests collide regardless of object key order. State-changing
//! methods are never cached and proactively invalidate the read entries they
//! can affect. Capacity is bounded; overflow evicts the entry closest to
//! expiry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use snowgate_common::{GatewayError, Result, RpcPayload};

/// Method prefixes that must never be served from cache.
const NON_CACHEABLE_PREFIXES: &[&str] = &[
    "eth_sendTransaction",
    "eth_sendRawTransaction",
    "eth_sign",
    "eth_signTransaction",
    "eth_submitWork",
    "eth_submitHashrate",
    "personal_",
    "admin_",
    "miner_",
    "debug_",
    "avax_issueTx",
    "avax_signTx",
];

/// Fallback TTL for cacheable methods without a table entry.
const DEFAULT_TTL: Duration = Duration::from_millis(30_000);

/// Per-method TTL table.
pub fn ttl_for_method(method: &str) -> Duration {
    let ms = match method {
        "eth_blockNumber" => 5_000,
        "eth_gasPrice" => 10_000,
        "eth_call" => 10_000,
        "eth_getBalance" => 15_000,
        "eth_getTransactionCount" => 15_000,
        "eth_getLogs" => 30_000,
        "eth_getBlockByNumber" | "eth_getBlockByHash" => 60_000,
        "avax_getPendingTxs" => 5_000,
        "avax_getAtomicTxStatus" => 15_000,
        "avax_getAtomicTx" => 60_000,
        _ => return DEFAULT_TTL,
    };
    Duration::from_millis(ms)
}

/// Whether responses to a method may be cached at all.
pub fn is_cacheable_method(method: &str) -> bool {
    !NON_CACHEABLE_PREFIXES
        .iter()
        .any(|prefix| method.starts_with(prefix))
}

/// Cache key for one request: `method + "|" + canonical params`.
pub fn cache_key(method: &str, params: &Value) -> String {
    format!("{}|{}", method, canonical_json(params))
}

/// Cache key for a whole payload; `None` when any entry failed validation.
pub fn payload_cache_key(payload: &RpcPayload) -> Option<String> {
    if !payload.all_valid() {
        return None;
    }
    let keys: Vec<String> = payload
        .valid_requests()
        .iter()
        .map(|req| cache_key(&req.method, &req.params))
        .collect();
    Some(keys.join("|"))
}

/// Whether every entry of a payload is cacheable.
pub fn payload_cacheable(payload: &RpcPayload) -> bool {
    payload.all_valid()
        && payload
            .valid_requests()
            .iter()
            .all(|req| is_cacheable_method(&req.method))
}

/// TTL for a payload: the per-method TTL, or the minimum across a batch.
pub fn payload_ttl(payload: &RpcPayload) -> Duration {
    payload
        .valid_requests()
        .iter()
        .map(|req| ttl_for_method(&req.method))
        .min()
        .unwrap_or(DEFAULT_TTL)
}

/// Stable canonical form: arrays in order, object keys sorted, scalars via
/// serde_json's shortest round-trippable rendering.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        scalar => serde_json::to_string(scalar).unwrap_or_default(),
    }
}

/// True when the payload (response or batch) carries any `error` field.
fn contains_error(payload: &Value) -> bool {
    match payload {
        Value::Object(map) => map.contains_key("error"),
        Value::Array(items) => items.iter().any(contains_error),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard bound on entry count
    pub max_entries: usize,
    /// Cadence of the expiry sweep (and snapshot rewrite, when enabled)
    pub sweep_interval: Duration,
    /// Snapshot file path; `None` disables persistence
    pub persist_path: Option<PathBuf>,
    /// Only entries with at least this much TTL left are snapshotted
    pub persist_min_remaining: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
            persist_path: None,
            persist_min_remaining: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    expires_at: Instant,
    /// Wall-clock twin of `expires_at`, used only by the snapshot format
    expires_at_wall: SystemTime,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
    per_method: HashMap<String, MethodCounters>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct MethodCounters {
    pub hits: u64,
    pub misses: u64,
}

/// Metrics projection returned by [`ResponseCache::metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    /// Configured capacity (not the current size)
    pub max_entries: usize,
    pub hit_rate: f64,
    pub per_method: HashMap<String, MethodCounters>,
}

pub struct ResponseCache {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    counters: Mutex<CacheCounters>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            counters: Mutex::new(CacheCounters::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Looks up a key, lazily evicting it when expired.
    ///
    /// `method_label` attributes the hit/miss to a method ("batch" for
    /// multi-entry payloads).
    pub fn get(&self, key: &str, method_label: &str) -> Option<Value> {
        let now = Instant::now();
        let hit = {
            let entries = self.entries.read().unwrap();
            entries
                .get(key)
                .filter(|e| e.expires_at > now)
                .map(|e| e.payload.clone())
        };

        let mut counters = self.counters.lock().unwrap();
        match hit {
            Some(payload) => {
                counters.hits += 1;
                counters
                    .per_method
                    .entry(method_label.to_string())
                    .or_default()
                    .hits += 1;
                Some(payload)
            }
            None => {
                counters.misses += 1;
                counters
                    .per_method
                    .entry(method_label.to_string())
                    .or_default()
                    .misses += 1;
                drop(counters);
                // Expired entries are misses; drop them eagerly on read.
                let mut entries = self.entries.write().unwrap();
                if entries
                    .get(key)
                    .map(|e| e.expires_at <= now)
                    .unwrap_or(false)
                {
                    entries.remove(key);
                    self.counters.lock().unwrap().evictions += 1;
                }
                None
            }
        }
    }

    /// Stores a payload under a key. Payloads carrying an `error` field are
    /// refused; returns whether the entry was stored.
    pub fn insert(&self, key: String, payload: Value, ttl: Duration) -> bool {
        if contains_error(&payload) {
            return false;
        }

        let mut entries = self.entries.write().unwrap();
        if !entries.contains_key(&key) {
            while entries.len() >= self.config.max_entries {
                // Evict the entry closest to expiry.
                let victim = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(k) => {
                        entries.remove(&k);
                        self.counters.lock().unwrap().evictions += 1;
                    }
                    None => break,
                }
            }
        }
        entries.insert(
            key,
            CacheEntry {
                payload,
                expires_at: Instant::now() + ttl,
                expires_at_wall: SystemTime::now() + ttl,
            },
        );
        true
    }

    /// Drops the read entries a successful state-changing method can affect.
    pub fn invalidate_on_state_change(&self, method: &str) {
        let targets: &[&str] = match method {
            "eth_sendTransaction" | "eth_sendRawTransaction" => {
                &["eth_getBalance", "eth_getTransactionCount", "eth_call"]
            }
            "personal_sendTransaction" => &["eth_getBalance", "eth_getTransactionCount"],
            "avax_issueTx" => &["avax_getPendingTxs", "avax_getAtomicTxStatus"],
            _ => return,
        };

        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !targets.iter().any(|t| key.contains(t)));
        let dropped = before - entries.len();
        if dropped > 0 {
            self.counters.lock().unwrap().evictions += dropped as u64;
            debug!(method, dropped, "invalidated cache entries on state change");
        }
    }

    /// Removes expired entries; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let dropped = before - entries.len();
        if dropped > 0 {
            self.counters.lock().unwrap().evictions += dropped as u64;
        }
        dropped
    }

    /// Spawns the periodic expiry sweep, which also rewrites the snapshot
    /// when persistence is configured.
    pub fn spawn_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let dropped = cache.sweep();
                if dropped > 0 {
                    debug!(dropped, "swept expired cache entries");
                }
                if let Err(e) = cache.save() {
                    warn!(error = %e, "cache snapshot write failed");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn metrics(&self) -> CacheMetrics {
        // Lock order is entries before counters, everywhere.
        let size = self.entries.read().unwrap().len();
        let counters = self.counters.lock().unwrap();
        let total = counters.hits + counters.misses;
        CacheMetrics {
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            size,
            max_entries: self.config.max_entries,
            hit_rate: if total == 0 {
                0.0
            } else {
                counters.hits as f64 / total as f64
            },
            per_method: counters.per_method.clone(),
        }
    }

    /// Snapshot of long-lived entries as a single JSON object:
    /// `{key: {data, expiresAt}}` with wall-clock millisecond deadlines.
    pub fn snapshot(&self) -> Value {
        let entries = self.entries.read().unwrap();
        let now = Instant::now();
        let mut out = serde_json::Map::new();
        for (key, entry) in entries.iter() {
            if entry.expires_at <= now + self.config.persist_min_remaining {
                continue;
            }
            let expires_ms = entry
                .expires_at_wall
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            out.insert(
                key.clone(),
                json!({ "data": entry.payload, "expiresAt": expires_ms }),
            );
        }
        Value::Object(out)
    }

    /// Writes the snapshot to the configured path (no-op when persistence is
    /// disabled).
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config.persist_path else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        let bytes = serde_json::to_vec(&snapshot)?;
        std::fs::write(path, bytes)
            .map_err(|e| GatewayError::Cache(format!("snapshot write failed: {e}")))?;
        Ok(())
    }

    /// Loads a previously written snapshot. A missing file is not an error;
    /// entries already past their deadline are skipped.
    pub fn load(&self) -> Result<usize> {
        let Some(path) = &self.config.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let bytes = std::fs::read(path)
            .map_err(|e| GatewayError::Cache(format!("snapshot read failed: {e}")))?;
        let snapshot: Value = serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Cache(format!("snapshot not valid JSON: {e}")))?;
        let Value::Object(map) = snapshot else {
            return Err(GatewayError::Cache("snapshot is not a JSON object".into()));
        };

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut loaded = 0;
        for (key, entry) in map {
            let Some(data) = entry.get("data").cloned() else {
                continue;
            };
            let Some(expires_ms) = entry.get("expiresAt").and_then(Value::as_u64) else {
                continue;
            };
            if expires_ms <= now_ms {
                continue;
            }
            let remaining = Duration::from_millis(expires_ms - now_ms);
            if self.insert(key, data, remaining) {
                loaded += 1;
            }
        }
        info!(loaded, "restored cache snapshot");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> ResponseCache {
        ResponseCache::new(CacheConfig::default())
    }

    #[test]
    fn round_trip_within_ttl() {
        let c = cache();
        let key = cache_key("eth_blockNumber", &json!([]));
        let payload = json!({"jsonrpc": "2.0", "result": "0x1234", "id": 1});
        assert!(c.insert(key.clone(), payload.clone(), Duration::from_secs(5)));
        assert_eq!(c.get(&key, "eth_blockNumber"), Some(payload));
    }

    #[test]
    fn expired_entries_are_misses() {
        let c = cache();
        let key = cache_key("eth_blockNumber", &json!([]));
        c.insert(key.clone(), json!({"result": "0x1"}), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(c.get(&key, "eth_blockNumber"), None);
        // Lazy eviction removed the entry.
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn error_payloads_are_never_stored() {
        let c = cache();
        let key = cache_key("eth_call", &json!([{"to": "0x1"}]));
        let payload = json!({"jsonrpc": "2.0", "error": {"code": -32000, "message": "x"}, "id": 1});
        assert!(!c.insert(key.clone(), payload, Duration::from_secs(5)));
        assert_eq!(c.get(&key, "eth_call"), None);
    }

    #[test]
    fn batch_with_an_error_entry_is_refused() {
        let c = cache();
        let payload = json!([
            {"jsonrpc": "2.0", "result": "0x1", "id": 1},
            {"jsonrpc": "2.0", "error": {"code": -32000, "message": "x"}, "id": 2},
        ]);
        assert!(!c.insert("k".into(), payload, Duration::from_secs(5)));
    }

    #[test]
    fn cacheability_prefix_list() {
        assert!(is_cacheable_method("eth_blockNumber"));
        assert!(is_cacheable_method("eth_getBalance"));
        assert!(!is_cacheable_method("eth_sendTransaction"));
        assert!(!is_cacheable_method("eth_sendRawTransaction"));
        assert!(!is_cacheable_method("eth_signTransaction"));
        assert!(!is_cacheable_method("personal_sendTransaction"));
        assert!(!is_cacheable_method("admin_addPeer"));
        assert!(!is_cacheable_method("debug_traceTransaction"));
        assert!(!is_cacheable_method("avax_issueTx"));
    }

    #[test]
    fn ttl_table() {
        assert_eq!(ttl_for_method("eth_blockNumber"), Duration::from_millis(5_000));
        assert_eq!(ttl_for_method("eth_call"), Duration::from_millis(10_000));
        assert_eq!(ttl_for_method("eth_getBlockByHash"), Duration::from_millis(60_000));
        assert_eq!(ttl_for_method("avax_getAtomicTx"), Duration::from_millis(60_000));
        assert_eq!(
            ttl_for_method("avax_getAtomicTxStatus"),
            Duration::from_millis(15_000)
        );
        assert_eq!(ttl_for_method("eth_unknownThing"), DEFAULT_TTL);
    }

    #[test]
    fn canonical_key_is_stable_across_object_key_order() {
        let a = cache_key("eth_call", &json!([{"to": "0x1", "data": "0x2"}, "latest"]));
        let b = cache_key("eth_call", &json!([{"data": "0x2", "to": "0x1"}, "latest"]));
        assert_eq!(a, b);
    }

    #[test]
    fn different_params_get_different_keys() {
        let a = cache_key("eth_getBalance", &json!(["0xaaa", "latest"]));
        let b = cache_key("eth_getBalance", &json!(["0xbbb", "latest"]));
        assert_ne!(a, b);
    }

    #[test]
    fn batch_key_joins_entry_keys() {
        let payload = RpcPayload::parse(json!([
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1},
            {"jsonrpc": "2.0", "method": "eth_gasPrice", "params": [], "id": 2},
        ]));
        let key = payload_cache_key(&payload).unwrap();
        assert_eq!(key, "eth_blockNumber|[]|eth_gasPrice|[]");
    }

    #[test]
    fn invalid_payload_has_no_key() {
        let payload = RpcPayload::parse(json!([
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "params": []},
        ]));
        assert!(payload_cache_key(&payload).is_none());
    }

    #[test]
    fn batch_ttl_is_the_minimum() {
        let payload = RpcPayload::parse(json!([
            {"jsonrpc": "2.0", "method": "eth_getBlockByNumber", "params": ["0x1", false], "id": 1},
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 2},
        ]));
        assert_eq!(payload_ttl(&payload), Duration::from_millis(5_000));
    }

    #[test]
    fn batch_cacheable_only_if_every_entry_is() {
        let mixed = RpcPayload::parse(json!([
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1},
            {"jsonrpc": "2.0", "method": "eth_sendRawTransaction", "params": ["0x"], "id": 2},
        ]));
        assert!(!payload_cacheable(&mixed));
    }

    #[test]
    fn capacity_evicts_the_entry_closest_to_expiry() {
        let c = ResponseCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        c.insert("short".into(), json!({"result": 1}), Duration::from_secs(1));
        c.insert("long".into(), json!({"result": 2}), Duration::from_secs(60));
        c.insert("new".into(), json!({"result": 3}), Duration::from_secs(30));

        assert_eq!(c.len(), 2);
        assert!(c.get("short", "x").is_none());
        assert!(c.get("long", "x").is_some());
        assert!(c.get("new", "x").is_some());
    }

    #[test]
    fn invalidation_drops_matching_entries() {
        let c = cache();
        let balance_key = cache_key("eth_getBalance", &json!(["0xaaa", "latest"]));
        let nonce_key = cache_key("eth_getTransactionCount", &json!(["0xaaa", "latest"]));
        let block_key = cache_key("eth_blockNumber", &json!([]));
        c.insert(balance_key.clone(), json!({"result": "0x1"}), Duration::from_secs(60));
        c.insert(nonce_key.clone(), json!({"result": "0x2"}), Duration::from_secs(60));
        c.insert(block_key.clone(), json!({"result": "0x3"}), Duration::from_secs(60));

        c.invalidate_on_state_change("eth_sendTransaction");

        assert!(c.get(&balance_key, "eth_getBalance").is_none());
        assert!(c.get(&nonce_key, "eth_getTransactionCount").is_none());
        assert!(c.get(&block_key, "eth_blockNumber").is_some());
    }

    #[test]
    fn read_methods_do_not_invalidate() {
        let c = cache();
        let key = cache_key("eth_getBalance", &json!(["0xaaa"]));
        c.insert(key.clone(), json!({"result": "0x1"}), Duration::from_secs(60));
        c.invalidate_on_state_change("eth_getBalance");
        assert!(c.get(&key, "eth_getBalance").is_some());
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let c = cache();
        c.insert("a".into(), json!({"result": 1}), Duration::from_millis(5));
        c.insert("b".into(), json!({"result": 2}), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(c.sweep(), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn metrics_report_configured_capacity_and_hit_rate() {
        let c = ResponseCache::new(CacheConfig {
            max_entries: 123,
            ..Default::default()
        });
        c.insert("k".into(), json!({"result": 1}), Duration::from_secs(60));
        c.get("k", "eth_blockNumber");
        c.get("k", "eth_blockNumber");
        c.get("missing", "eth_gasPrice");

        let m = c.metrics();
        assert_eq!(m.hits, 2);
        assert_eq!(m.misses, 1);
        assert_eq!(m.size, 1);
        assert_eq!(m.max_entries, 123);
        assert!((m.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.per_method["eth_blockNumber"].hits, 2);
        assert_eq!(m.per_method["eth_gasPrice"].misses, 1);
    }

    #[test]
    fn snapshot_keeps_only_long_lived_entries() {
        let c = ResponseCache::new(CacheConfig {
            persist_min_remaining: Duration::from_secs(300),
            ..Default::default()
        });
        c.insert("short".into(), json!({"result": 1}), Duration::from_secs(10));
        c.insert("long".into(), json!({"result": 2}), Duration::from_secs(600));

        let snapshot = c.snapshot();
        let obj = snapshot.as_object().unwrap();
        assert!(!obj.contains_key("short"));
        assert!(obj.contains_key("long"));
        assert!(obj["long"]["expiresAt"].as_u64().unwrap() > 0);
        assert_eq!(obj["long"]["data"], json!({"result": 2}));
    }

    #[test]
    fn snapshot_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let config = CacheConfig {
            persist_path: Some(path.clone()),
            ..Default::default()
        };
        let c = ResponseCache::new(config.clone());
        c.insert("k".into(), json!({"result": "0x1"}), Duration::from_secs(600));
        c.save().unwrap();

        let restored = ResponseCache::new(config);
        assert_eq!(restored.load().unwrap(), 1);
        assert_eq!(restored.get("k", "x"), Some(json!({"result": "0x1"})));
    }

    #[test]
    fn missing_snapshot_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = ResponseCache::new(CacheConfig {
            persist_path: Some(dir.path().join("absent.json")),
            ..Default::default()
        });
        assert_eq!(c.load().unwrap(), 0);
    }
}
