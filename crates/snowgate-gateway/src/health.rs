//! Active health checking and scoring.
//!
//! Two independent timers drive probing: the main probe scans every node at
//! `interval`, the recovery probe rescans only unhealthy nodes at
//! `recovery_interval`. Each outcome updates the node's rolling metrics and
//! the registry's liveness flag, then recomputes the 0-100 health score used
//! by the health-based selector.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use snowgate_common::{GatewayError, Result, RpcResponse};

use crate::node::{Network, Node, NodeId};
use crate::registry::NodeRegistry;

/// Response-time samples kept per node.
const RESPONSE_TIME_WINDOW: usize = 10;

/// Score assigned to nodes currently marked unhealthy (keeps a recovery
/// ordering without making them competitive).
const UNHEALTHY_SCORE_CAP: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Cadence of the full probe scan
    pub interval: Duration,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Cadence of the unhealthy-only recovery scan
    pub recovery_interval: Duration,
    /// Path suffix appended to the node URL for probes
    pub health_path: String,
    /// Consecutive failures before marking a node unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes before marking a node healthy again
    pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            recovery_interval: Duration::from_secs(60),
            health_path: "/".into(),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

/// Rolling health metrics for one node.
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Last `RESPONSE_TIME_WINDOW` response times, milliseconds
    pub samples: Vec<f64>,
    pub avg_response_time: f64,
    pub last_response_time: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_status_changed_at: Option<SystemTime>,
    pub score: f64,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            samples: Vec::with_capacity(RESPONSE_TIME_WINDOW),
            avg_response_time: 0.0,
            last_response_time: 0.0,
            success_count: 0,
            failure_count: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_status_changed_at: None,
            score: 50.0,
        }
    }
}

impl HealthMetrics {
    fn push_sample(&mut self, response_time_ms: f64) {
        if self.samples.len() == RESPONSE_TIME_WINDOW {
            self.samples.remove(0);
        }
        self.samples.push(response_time_ms);
        self.last_response_time = response_time_ms;
        self.avg_response_time = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
    }

    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// Per-node projection in the health report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub id: NodeId,
    pub url: String,
    pub network: Network,
    pub healthy: bool,
    pub last_response_time_ms: f64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_changed_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub unhealthy_nodes: usize,
    pub nodes: Vec<NodeHealth>,
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Active prober and score keeper.
pub struct HealthChecker {
    registry: Arc<NodeRegistry>,
    config: HealthCheckConfig,
    client: reqwest::Client,
    metrics: RwLock<HashMap<NodeId, HealthMetrics>>,
    /// Nodes with a probe currently in flight; prevents the probe and
    /// recovery timers from double-probing the same node.
    in_flight: Mutex<HashSet<NodeId>>,
}

impl HealthChecker {
    pub fn new(registry: Arc<NodeRegistry>, config: HealthCheckConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            registry,
            config,
            client,
            metrics: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Spawns the full-scan probe loop. Ticks never overlap: the next scan
    /// is delayed until the previous one finishes.
    pub fn spawn_probe(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                checker.check_all().await;
            }
        })
    }

    /// Spawns the unhealthy-only recovery loop.
    pub fn spawn_recovery(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.config.recovery_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                checker.check_unhealthy().await;
            }
        })
    }

    /// Probes every registered node once, in parallel.
    pub async fn check_all(&self) {
        self.check_nodes(self.registry.list_all()).await;
    }

    /// Probes only the nodes currently marked unhealthy.
    pub async fn check_unhealthy(&self) {
        let unhealthy: Vec<Node> = self
            .registry
            .list_all()
            .into_iter()
            .filter(|n| !n.healthy)
            .collect();
        if !unhealthy.is_empty() {
            debug!(count = unhealthy.len(), "recovery scan of unhealthy nodes");
            self.check_nodes(unhealthy).await;
        }
    }

    async fn check_nodes(&self, nodes: Vec<Node>) {
        let nodes: Vec<Node> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            nodes
                .into_iter()
                .filter(|n| in_flight.insert(n.id.clone()))
                .collect()
        };

        let probes = nodes.iter().map(|node| {
            let node = node.clone();
            async move {
                let outcome = self.probe_node(&node).await;
                (node, outcome)
            }
        });
        let results = futures::future::join_all(probes).await;

        for (node, outcome) in results {
            match outcome {
                Ok(elapsed) => self.record_success(&node.id, elapsed),
                Err(e) => {
                    debug!(node = %node.id, error = %e, "health probe failed");
                    self.record_failure(&node.id);
                }
            }
            self.in_flight.lock().unwrap().remove(&node.id);
        }
    }

    /// Probes one node with a cheap non-mutating RPC.
    ///
    /// `web3_clientVersion` first; if the node answers with a JSON-RPC error
    /// (some providers filter the method), retries once with `eth_chainId`.
    /// Any response that is a valid JSON-RPC envelope counts as alive.
    async fn probe_node(&self, node: &Node) -> Result<Duration> {
        let url = probe_url(&node.url, &self.config.health_path);
        let start = Instant::now();
        match self.probe_once(&url, "web3_clientVersion").await {
            Ok(ProbeOutcome::Result) => Ok(start.elapsed()),
            Ok(ProbeOutcome::RpcError) => {
                // Method may be filtered; any valid envelope from the
                // fallback proves the node is serving JSON-RPC.
                let start = Instant::now();
                self.probe_once(&url, "eth_chainId").await?;
                Ok(start.elapsed())
            }
            Err(e) => Err(e),
        }
    }

    async fn probe_once(&self, url: &str, method: &str) -> Result<ProbeOutcome> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": [],
            "id": 1,
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.timeout.as_millis() as u64)
                } else {
                    GatewayError::ConnectionRefused(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "probe returned HTTP {}",
                response.status()
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("probe body not JSON-RPC: {e}")))?;

        if parsed.result.is_some() {
            Ok(ProbeOutcome::Result)
        } else {
            Ok(ProbeOutcome::RpcError)
        }
    }

    /// Records a successful observation for a node.
    pub fn record_success(&self, id: &str, elapsed: Duration) {
        let mut metrics = self.metrics.write().unwrap();
        let m = metrics.entry(id.to_string()).or_default();
        m.push_sample(elapsed.as_secs_f64() * 1000.0);
        m.success_count += 1;
        m.consecutive_successes += 1;
        m.consecutive_failures = 0;

        let currently_healthy = self
            .registry
            .get(id)
            .map(|n| n.healthy)
            .unwrap_or(true);
        if !currently_healthy && m.consecutive_successes >= self.config.success_threshold {
            m.last_status_changed_at = Some(SystemTime::now());
            self.registry.set_health(id, true);
            info!(node = id, "node recovered, marked healthy");
        } else {
            self.registry.set_health(id, currently_healthy);
        }

        self.recompute_scores(&mut metrics);
    }

    /// Records a failed observation for a node.
    pub fn record_failure(&self, id: &str) {
        let mut metrics = self.metrics.write().unwrap();
        let m = metrics.entry(id.to_string()).or_default();
        m.failure_count += 1;
        m.consecutive_failures += 1;
        m.consecutive_successes = 0;

        let currently_healthy = self
            .registry
            .get(id)
            .map(|n| n.healthy)
            .unwrap_or(true);
        if currently_healthy && m.consecutive_failures >= self.config.failure_threshold {
            m.last_status_changed_at = Some(SystemTime::now());
            self.registry.set_health(id, false);
            warn!(
                node = id,
                failures = m.consecutive_failures,
                "node marked unhealthy"
            );
        } else {
            self.registry.set_health(id, currently_healthy);
        }

        self.recompute_scores(&mut metrics);
    }

    /// Manually overrides liveness, priming the consecutive counters to the
    /// threshold of that direction so the next automatic flip behaves as if
    /// the streak were real.
    pub fn force_update_health(&self, id: &str, healthy: bool) {
        if self.registry.get(id).is_none() {
            return;
        }
        let mut metrics = self.metrics.write().unwrap();
        let m = metrics.entry(id.to_string()).or_default();
        if healthy {
            m.consecutive_successes = self.config.success_threshold;
            m.consecutive_failures = 0;
        } else {
            m.consecutive_failures = self.config.failure_threshold;
            m.consecutive_successes = 0;
        }
        let was_healthy = self.registry.get(id).map(|n| n.healthy).unwrap_or(true);
        if was_healthy != healthy {
            m.last_status_changed_at = Some(SystemTime::now());
        }
        self.registry.set_health(id, healthy);
        info!(node = id, healthy, "liveness forced");
        self.recompute_scores(&mut metrics);
    }

    /// Recomputes every node's score.
    ///
    /// Score = success component (0-50) + response-time component (0-50),
    /// where the latter compares the node's average response time to the
    /// fleet average: at or below half the fleet average scores 50, at or
    /// above twice the fleet average scores 10, linear in between. Nodes
    /// currently unhealthy are capped at 10.
    fn recompute_scores(&self, metrics: &mut HashMap<NodeId, HealthMetrics>) {
        let with_samples: Vec<f64> = metrics
            .values()
            .filter(|m| !m.samples.is_empty())
            .map(|m| m.avg_response_time)
            .collect();
        let fleet_avg = if with_samples.is_empty() {
            0.0
        } else {
            with_samples.iter().sum::<f64>() / with_samples.len() as f64
        };

        let healthy: HashMap<NodeId, bool> = self
            .registry
            .list_all()
            .into_iter()
            .map(|n| (n.id, n.healthy))
            .collect();

        for (id, m) in metrics.iter_mut() {
            let success_score = 50.0 * m.success_rate();
            let rt_score = if fleet_avg == 0.0 {
                50.0
            } else {
                let ratio = m.avg_response_time / fleet_avg;
                if ratio <= 0.5 {
                    50.0
                } else if ratio >= 2.0 {
                    10.0
                } else {
                    50.0 - (ratio - 0.5) / 1.5 * 40.0
                }
            };
            let mut score = (success_score + rt_score).clamp(0.0, 100.0);
            if !healthy.get(id).copied().unwrap_or(true) {
                score = score.min(UNHEALTHY_SCORE_CAP);
            }
            m.score = score;
        }
    }

    /// Current score of a node. Nodes never observed score neutral (50).
    pub fn score(&self, id: &str) -> f64 {
        self.metrics
            .read()
            .unwrap()
            .get(id)
            .map(|m| m.score)
            .unwrap_or(50.0)
    }

    pub fn metrics_for(&self, id: &str) -> Option<HealthMetrics> {
        self.metrics.read().unwrap().get(id).cloned()
    }

    /// Full health report: totals plus the per-node projection.
    pub fn get_health_report(&self) -> HealthReport {
        let nodes = self.registry.list_all();
        let metrics = self.metrics.read().unwrap();

        let healthy_nodes = nodes.iter().filter(|n| n.healthy).count();
        let projections = nodes
            .iter()
            .map(|node| {
                let m = metrics.get(&node.id).cloned().unwrap_or_default();
                NodeHealth {
                    id: node.id.clone(),
                    url: node.url.clone(),
                    network: node.network,
                    healthy: node.healthy,
                    last_response_time_ms: m.last_response_time,
                    avg_response_time_ms: m.avg_response_time,
                    success_rate: m.success_rate(),
                    score: m.score,
                    last_checked_at_ms: node.last_checked_at.map(unix_ms),
                    last_status_changed_at_ms: m.last_status_changed_at.map(unix_ms),
                }
            })
            .collect();

        HealthReport {
            total_nodes: nodes.len(),
            healthy_nodes,
            unhealthy_nodes: nodes.len() - healthy_nodes,
            nodes: projections,
        }
    }

    /// All nodes sorted by score, best first.
    pub fn get_nodes_by_score(&self) -> Vec<NodeHealth> {
        let mut nodes = self.get_health_report().nodes;
        nodes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        nodes
    }
}

enum ProbeOutcome {
    /// Envelope with a defined `result`
    Result,
    /// Valid envelope carrying an `error`
    RpcError,
}

fn probe_url(base: &str, path: &str) -> String {
    if path.is_empty() || path == "/" {
        return base.trim_end_matches('/').to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn setup(nodes: Vec<Node>) -> (Arc<NodeRegistry>, HealthChecker) {
        let registry = Arc::new(NodeRegistry::new(nodes));
        let checker =
            HealthChecker::new(Arc::clone(&registry), HealthCheckConfig::default()).unwrap();
        (registry, checker)
    }

    fn two_nodes() -> Vec<Node> {
        vec![
            Node::new("a", "http://a:9650", Network::AvalancheMainnet),
            Node::new("b", "http://b:9650", Network::AvalancheMainnet),
        ]
    }

    #[test]
    fn success_updates_ring_and_counters() {
        let (_registry, checker) = setup(two_nodes());
        checker.record_success("a", Duration::from_millis(100));
        checker.record_success("a", Duration::from_millis(200));

        let m = checker.metrics_for("a").unwrap();
        assert_eq!(m.samples.len(), 2);
        assert_eq!(m.last_response_time, 200.0);
        assert!((m.avg_response_time - 150.0).abs() < 1e-9);
        assert_eq!(m.success_count, 2);
        assert_eq!(m.consecutive_successes, 2);
        assert_eq!(m.consecutive_failures, 0);
    }

    #[test]
    fn ring_is_bounded() {
        let (_registry, checker) = setup(two_nodes());
        for i in 0..15 {
            checker.record_success("a", Duration::from_millis(i * 10));
        }
        let m = checker.metrics_for("a").unwrap();
        assert_eq!(m.samples.len(), RESPONSE_TIME_WINDOW);
        // Oldest samples were dropped.
        assert_eq!(m.samples[0], 50.0);
    }

    #[test]
    fn consecutive_counters_are_mutually_exclusive() {
        let (_registry, checker) = setup(two_nodes());
        checker.record_success("a", Duration::from_millis(10));
        checker.record_failure("a");
        let m = checker.metrics_for("a").unwrap();
        assert_eq!(m.consecutive_successes, 0);
        assert_eq!(m.consecutive_failures, 1);

        checker.record_success("a", Duration::from_millis(10));
        let m = checker.metrics_for("a").unwrap();
        assert_eq!(m.consecutive_successes, 1);
        assert_eq!(m.consecutive_failures, 0);
    }

    #[test]
    fn marks_unhealthy_at_failure_threshold() {
        let (registry, checker) = setup(two_nodes());
        checker.record_failure("a");
        checker.record_failure("a");
        assert!(registry.get("a").unwrap().healthy);
        checker.record_failure("a");
        assert!(!registry.get("a").unwrap().healthy);
        assert!(checker
            .metrics_for("a")
            .unwrap()
            .last_status_changed_at
            .is_some());
    }

    #[test]
    fn recovers_at_success_threshold() {
        let (registry, checker) = setup(two_nodes());
        for _ in 0..3 {
            checker.record_failure("a");
        }
        assert!(!registry.get("a").unwrap().healthy);

        checker.record_success("a", Duration::from_millis(10));
        assert!(!registry.get("a").unwrap().healthy);
        checker.record_success("a", Duration::from_millis(10));
        assert!(registry.get("a").unwrap().healthy);
    }

    #[test]
    fn score_is_neutral_with_no_observations() {
        let (_registry, checker) = setup(two_nodes());
        assert_eq!(checker.score("a"), 50.0);
    }

    #[test]
    fn lone_sampled_node_sits_at_the_fleet_average() {
        let (_registry, checker) = setup(two_nodes());
        // Single node with samples: its avg equals the fleet avg, ratio 1.0,
        // so rt score interpolates to ~36.7 and success adds 50.
        checker.record_success("a", Duration::from_millis(100));
        let score = checker.score("a");
        assert!(score > 86.0 && score < 88.0, "score was {score}");
    }

    #[test]
    fn fast_node_outranks_slow_node() {
        let (_registry, checker) = setup(two_nodes());
        for _ in 0..5 {
            checker.record_success("a", Duration::from_millis(50));
            checker.record_success("b", Duration::from_millis(400));
        }
        assert!(checker.score("a") > checker.score("b"));
        // a's avg (50ms) is well below half the fleet avg (225ms): full marks.
        assert_eq!(checker.score("a"), 100.0);
    }

    #[test]
    fn failures_drag_the_score_down() {
        let (_registry, checker) = setup(two_nodes());
        checker.record_success("a", Duration::from_millis(100));
        let before = checker.score("a");
        checker.record_failure("a");
        let after = checker.score("a");
        assert!(after < before);
    }

    #[test]
    fn unhealthy_nodes_are_capped_at_ten() {
        let (registry, checker) = setup(two_nodes());
        checker.record_success("a", Duration::from_millis(10));
        for _ in 0..3 {
            checker.record_failure("a");
        }
        assert!(!registry.get("a").unwrap().healthy);
        assert!(checker.score("a") <= UNHEALTHY_SCORE_CAP);
    }

    #[test]
    fn force_update_is_idempotent() {
        let (registry, checker) = setup(two_nodes());
        checker.force_update_health("a", false);
        let first = checker.metrics_for("a").unwrap();
        checker.force_update_health("a", false);
        let second = checker.metrics_for("a").unwrap();

        assert!(!registry.get("a").unwrap().healthy);
        assert_eq!(first.consecutive_failures, second.consecutive_failures);
        assert_eq!(
            first.last_status_changed_at,
            second.last_status_changed_at
        );
    }

    #[test]
    fn force_update_primes_counters() {
        let (registry, checker) = setup(two_nodes());
        checker.force_update_health("a", false);
        let m = checker.metrics_for("a").unwrap();
        assert_eq!(m.consecutive_failures, 3);
        assert_eq!(m.consecutive_successes, 0);
        assert!(!registry.get("a").unwrap().healthy);

        checker.force_update_health("a", true);
        let m = checker.metrics_for("a").unwrap();
        assert_eq!(m.consecutive_successes, 2);
        assert_eq!(m.consecutive_failures, 0);
        assert!(registry.get("a").unwrap().healthy);
    }

    #[test]
    fn report_covers_all_nodes() {
        let (_registry, checker) = setup(two_nodes());
        checker.record_success("a", Duration::from_millis(25));
        for _ in 0..3 {
            checker.record_failure("b");
        }

        let report = checker.get_health_report();
        assert_eq!(report.total_nodes, 2);
        assert_eq!(report.healthy_nodes, 1);
        assert_eq!(report.unhealthy_nodes, 1);

        let a = report.nodes.iter().find(|n| n.id == "a").unwrap();
        assert_eq!(a.last_response_time_ms, 25.0);
        assert_eq!(a.success_rate, 1.0);
    }

    #[test]
    fn nodes_by_score_sorts_descending() {
        let (_registry, checker) = setup(two_nodes());
        checker.record_success("a", Duration::from_millis(10));
        for _ in 0..3 {
            checker.record_failure("b");
        }
        let ranked = checker.get_nodes_by_score();
        assert_eq!(ranked[0].id, "a");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn probe_url_joins_paths() {
        assert_eq!(probe_url("http://n:9650", "/"), "http://n:9650");
        assert_eq!(
            probe_url("http://n:9650/", "/ext/bc/C/rpc"),
            "http://n:9650/ext/bc/C/rpc"
        );
        assert_eq!(probe_url("http://n:9650", "rpc"), "http://n:9650/rpc");
    }
}
