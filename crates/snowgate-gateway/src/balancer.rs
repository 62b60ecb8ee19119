//! Strategy-driven node selection.
//!
//! The candidate set for a request is the healthy nodes of the requested
//! network, filtered by capability (when one is required) and by circuit
//! admission. When every circuit refuses traffic and no capability was
//! required, selection degrades to an emergency fallback: the healthy node
//! with the fewest lifetime failures.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::health::HealthChecker;
use crate::node::{Network, Node, NodeId};
use crate::registry::NodeRegistry;

/// Node-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    RoundRobin,
    Random,
    Weighted,
    #[default]
    HealthBased,
    Sticky,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "weighted" => Ok(Strategy::Weighted),
            "health-based" => Ok(Strategy::HealthBased),
            "sticky" => Ok(Strategy::Sticky),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Client→node affinity pin.
#[derive(Debug, Clone)]
pub struct StickySession {
    pub node_id: NodeId,
    pub last_used_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// Sticky-session lifetime, refreshed on each use
    pub session_ttl: Duration,
    /// Cadence of the expired-session sweep
    pub session_sweep_interval: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(600),
            session_sweep_interval: Duration::from_secs(60),
        }
    }
}

pub struct LoadBalancer {
    registry: Arc<NodeRegistry>,
    health: Arc<HealthChecker>,
    breaker: Arc<CircuitBreaker>,
    config: LoadBalancerConfig,
    round_robin_index: AtomicUsize,
    sessions: RwLock<HashMap<String, StickySession>>,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<NodeRegistry>,
        health: Arc<HealthChecker>,
        breaker: Arc<CircuitBreaker>,
        config: LoadBalancerConfig,
    ) -> Self {
        Self {
            registry,
            health,
            breaker,
            config,
            round_robin_index: AtomicUsize::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Picks one node for a request, or `None` when nothing is admissible.
    pub fn select(
        &self,
        network: Network,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<Node> {
        let candidates = self.candidates(network, capability);

        if candidates.is_empty() {
            // Capability requirements are hard filters; the fallback only
            // applies when the circuits alone emptied the set.
            if capability.is_none() {
                return self.emergency_fallback(network);
            }
            return None;
        }

        let node = match strategy {
            Strategy::RoundRobin => self.pick_round_robin(&candidates),
            Strategy::Random => self.pick_random(&candidates),
            Strategy::Weighted => self.pick_weighted(&candidates),
            Strategy::HealthBased => self.pick_health_based(&candidates),
            Strategy::Sticky => self.pick_sticky(&candidates, session_id),
        };
        debug!(
            network = %network,
            strategy = ?strategy,
            node = node.id.as_str(),
            "selected node"
        );
        Some(node)
    }

    /// Healthy nodes of the network, capability- and circuit-filtered,
    /// sorted by id for deterministic round-robin order.
    fn candidates(&self, network: Network, capability: Option<&str>) -> Vec<Node> {
        self.registry
            .list_healthy_by_network(network)
            .into_iter()
            .filter(|n| capability.map(|cap| n.has_capability(cap)).unwrap_or(true))
            .filter(|n| self.breaker.is_allowed(&n.id))
            .collect()
    }

    /// Last-resort pick among healthy nodes when every circuit refuses
    /// admission: fewest lifetime failures wins, id breaks ties.
    fn emergency_fallback(&self, network: Network) -> Option<Node> {
        let healthy = self.registry.list_healthy_by_network(network);
        let node = healthy
            .into_iter()
            .min_by_key(|n| (self.breaker.total_failures(&n.id), n.id.clone()))?;
        warn!(
            node = node.id.as_str(),
            "all circuits open, emergency fallback selection"
        );
        Some(node)
    }

    fn pick_round_robin(&self, candidates: &[Node]) -> Node {
        let idx = self.round_robin_index.fetch_add(1, Ordering::SeqCst) % candidates.len();
        candidates[idx].clone()
    }

    fn pick_random(&self, candidates: &[Node]) -> Node {
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        candidates[idx].clone()
    }

    /// Samples proportionally to weight via interval inversion over the
    /// cumulative weights.
    fn pick_weighted(&self, candidates: &[Node]) -> Node {
        let total: u64 = candidates.iter().map(|n| n.weight as u64).sum();
        let mut point = rand::thread_rng().gen_range(0..total);
        for node in candidates {
            let w = node.weight as u64;
            if point < w {
                return node.clone();
            }
            point -= w;
        }
        // Unreachable with total = sum of weights; keep the last as a guard.
        candidates[candidates.len() - 1].clone()
    }

    /// Argmax of health score; ties go to the lower priority value, then to
    /// the lexically first id.
    fn pick_health_based(&self, candidates: &[Node]) -> Node {
        let mut best = &candidates[0];
        let mut best_score = self.health.score(&best.id);
        for node in &candidates[1..] {
            let score = self.health.score(&node.id);
            let better = score > best_score
                || (score == best_score
                    && (node.priority < best.priority
                        || (node.priority == best.priority && node.id < best.id)));
            if better {
                best = node;
                best_score = score;
            }
        }
        best.clone()
    }

    /// Returns the pinned node while the pin is valid, otherwise pins a
    /// fresh health-based pick under the session id.
    fn pick_sticky(&self, candidates: &[Node], session_id: Option<&str>) -> Node {
        let Some(sid) = session_id else {
            return self.pick_health_based(candidates);
        };

        let now = Instant::now();
        let mut sessions = self.sessions.write().unwrap();

        // Expired pins are misses even before the sweep runs.
        if sessions.get(sid).is_some_and(|s| s.expires_at <= now) {
            sessions.remove(sid);
        }

        if let Some(pinned) = sessions.get(sid).map(|s| s.node_id.clone()) {
            if let Some(node) = candidates.iter().find(|n| n.id == pinned) {
                if let Some(session) = sessions.get_mut(sid) {
                    session.last_used_at = now;
                    session.expires_at = now + self.config.session_ttl;
                }
                return node.clone();
            }
            // Pinned node no longer admissible; re-pin below.
            sessions.remove(sid);
        }

        let node = self.pick_health_based(candidates);
        sessions.insert(
            sid.to_string(),
            StickySession {
                node_id: node.id.clone(),
                last_used_at: now,
                expires_at: now + self.config.session_ttl,
            },
        );
        node
    }

    /// Removes expired sessions; returns how many were dropped.
    pub fn prune_sessions(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    /// Spawns the periodic expired-session sweep.
    pub fn spawn_session_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(balancer.config.session_sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let dropped = balancer.prune_sessions();
                if dropped > 0 {
                    debug!(dropped, "pruned expired sticky sessions");
                }
            }
        })
    }

    /// The node a session is currently pinned to, if the pin is live.
    pub fn session_node(&self, session_id: &str) -> Option<NodeId> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(session_id)
            .filter(|s| s.expires_at > Instant::now())
            .map(|s| s.node_id.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn record_successful_request(&self, id: &str) {
        self.breaker.record_success(id);
    }

    pub fn record_failed_request(&self, id: &str) {
        self.breaker.record_failure(id);
    }
}
