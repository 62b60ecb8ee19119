//! Per-node circuit breaker.
//!
//! Each node carries a CLOSED/OPEN/HALF_OPEN state machine:
//!
//! - **Closed → Open**: consecutive failures reach the threshold
//! - **Open → Half-open**: reset timeout elapses (eagerly on `is_allowed`,
//!   or via the monitor tick so the selector sees candidates without
//!   waiting for inbound traffic)
//! - **Half-open → Closed**: consecutive successes reach the threshold
//! - **Half-open → Open**: any failure during the test window

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use crate::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before tripping the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing again
    pub success_threshold: u32,
    /// How long an open circuit rejects traffic before probing
    pub reset_timeout: Duration,
    /// Cadence of the proactive open → half-open scan
    pub monitor_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

/// Breaker state for one node.
///
/// `consecutive_*` counters reset across state transitions; the lifetime
/// totals survive even manual resets.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success_at: Option<SystemTime>,
    pub last_failure_at: Option<SystemTime>,
    pub opened_at: Option<Instant>,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl Default for CircuitStats {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_at: None,
            last_failure_at: None,
            opened_at: None,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

/// Per-node circuit breakers, created lazily on first observation.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<NodeId, CircuitStats>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Records a successful request against a node.
    pub fn record_success(&self, id: &str) {
        let mut circuits = self.circuits.write().unwrap();
        let stats = circuits.entry(id.to_string()).or_default();
        stats.total_successes += 1;
        stats.last_success_at = Some(SystemTime::now());
        stats.consecutive_successes += 1;
        stats.consecutive_failures = 0;

        if stats.state == CircuitState::HalfOpen
            && stats.consecutive_successes >= self.config.success_threshold
        {
            stats.state = CircuitState::Closed;
            stats.opened_at = None;
            stats.consecutive_successes = 0;
            stats.consecutive_failures = 0;
            info!(node = id, "circuit closed after successful probes");
        }
    }

    /// Records a failed request against a node.
    pub fn record_failure(&self, id: &str) {
        let mut circuits = self.circuits.write().unwrap();
        let stats = circuits.entry(id.to_string()).or_default();
        stats.total_failures += 1;
        stats.last_failure_at = Some(SystemTime::now());
        stats.consecutive_failures += 1;
        stats.consecutive_successes = 0;

        match stats.state {
            CircuitState::Closed => {
                if stats.consecutive_failures >= self.config.failure_threshold {
                    stats.state = CircuitState::Open;
                    stats.opened_at = Some(Instant::now());
                    warn!(
                        node = id,
                        failures = stats.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                stats.state = CircuitState::Open;
                stats.opened_at = Some(Instant::now());
                warn!(node = id, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Whether traffic may be sent to a node right now.
    ///
    /// An open circuit whose reset timeout has elapsed transitions to
    /// half-open here and admits the caller as the first probe. A half-open
    /// circuit admits probes only while the success count is below the
    /// threshold, capping probe traffic during the test window.
    pub fn is_allowed(&self, id: &str) -> bool {
        let mut circuits = self.circuits.write().unwrap();
        let stats = circuits.entry(id.to_string()).or_default();
        match stats.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = stats
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    stats.state = CircuitState::HalfOpen;
                    stats.opened_at = None;
                    stats.consecutive_successes = 0;
                    info!(node = id, "circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                stats.consecutive_successes < self.config.success_threshold
            }
        }
    }

    /// Proactively moves eligible open circuits to half-open so the selector
    /// sees them as candidates without an inbound request arriving first.
    pub fn tick(&self) {
        let mut circuits = self.circuits.write().unwrap();
        for (id, stats) in circuits.iter_mut() {
            if stats.state == CircuitState::Open {
                let elapsed = stats
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    stats.state = CircuitState::HalfOpen;
                    stats.opened_at = None;
                    stats.consecutive_successes = 0;
                    info!(node = %id, "circuit half-open after reset timeout");
                }
            }
        }
    }

    /// Forces a circuit closed, clearing transient counters while keeping
    /// lifetime totals.
    pub fn reset_circuit(&self, id: &str) {
        let mut circuits = self.circuits.write().unwrap();
        let stats = circuits.entry(id.to_string()).or_default();
        stats.state = CircuitState::Closed;
        stats.opened_at = None;
        stats.consecutive_failures = 0;
        stats.consecutive_successes = 0;
        info!(node = id, "circuit manually reset");
    }

    pub fn state(&self, id: &str) -> CircuitState {
        self.circuits
            .read()
            .unwrap()
            .get(id)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self, id: &str) -> Option<CircuitStats> {
        self.circuits.read().unwrap().get(id).cloned()
    }

    /// Lifetime failure total, used by the emergency-fallback selector.
    pub fn total_failures(&self, id: &str) -> u64 {
        self.circuits
            .read()
            .unwrap()
            .get(id)
            .map(|s| s.total_failures)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn rewind_opened_at(&self, id: &str, by: Duration) {
        let mut circuits = self.circuits.write().unwrap();
        if let Some(stats) = circuits.get_mut(id) {
            stats.opened_at = stats.opened_at.map(|t| t - by);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    #[test]
    fn unknown_node_is_allowed_and_closed() {
        let cb = breaker();
        assert!(cb.is_allowed("n1"));
        assert_eq!(cb.state("n1"), CircuitState::Closed);
    }

    #[test]
    fn opens_at_exactly_the_failure_threshold() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure("n1");
        }
        assert_eq!(cb.state("n1"), CircuitState::Closed);
        cb.record_failure("n1");
        assert_eq!(cb.state("n1"), CircuitState::Open);
        assert!(cb.stats("n1").unwrap().opened_at.is_some());
        assert!(!cb.is_allowed("n1"));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure("n1");
        }
        cb.record_success("n1");
        for _ in 0..4 {
            cb.record_failure("n1");
        }
        assert_eq!(cb.state("n1"), CircuitState::Closed);
    }

    #[test]
    fn counters_are_never_simultaneously_nonzero() {
        let cb = breaker();
        cb.record_failure("n1");
        cb.record_success("n1");
        let stats = cb.stats("n1").unwrap();
        assert!(stats.consecutive_failures == 0 || stats.consecutive_successes == 0);
        cb.record_failure("n1");
        let stats = cb.stats("n1").unwrap();
        assert!(stats.consecutive_failures == 0 || stats.consecutive_successes == 0);
    }

    #[test]
    fn open_transitions_to_half_open_after_timeout() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("n1");
        }
        assert!(!cb.is_allowed("n1"));

        cb.rewind_opened_at("n1", Duration::from_secs(31));
        // Eager transition: the check itself admits the first probe.
        assert!(cb.is_allowed("n1"));
        assert_eq!(cb.state("n1"), CircuitState::HalfOpen);
        assert!(cb.stats("n1").unwrap().opened_at.is_none());
    }

    #[test]
    fn half_open_closes_at_exactly_the_success_threshold() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("n1");
        }
        cb.rewind_opened_at("n1", Duration::from_secs(31));
        cb.tick();
        assert_eq!(cb.state("n1"), CircuitState::HalfOpen);

        cb.record_success("n1");
        assert_eq!(cb.state("n1"), CircuitState::HalfOpen);
        cb.record_success("n1");
        assert_eq!(cb.state("n1"), CircuitState::Closed);

        let stats = cb.stats("n1").unwrap();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.consecutive_successes, 0);
        assert!(stats.opened_at.is_none());
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("n1");
        }
        cb.rewind_opened_at("n1", Duration::from_secs(31));
        cb.tick();
        cb.record_failure("n1");
        assert_eq!(cb.state("n1"), CircuitState::Open);
        assert!(cb.stats("n1").unwrap().opened_at.is_some());
    }

    #[test]
    fn monitor_tick_moves_eligible_circuits() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("n1");
        }
        cb.tick();
        assert_eq!(cb.state("n1"), CircuitState::Open);

        cb.rewind_opened_at("n1", Duration::from_secs(31));
        cb.tick();
        assert_eq!(cb.state("n1"), CircuitState::HalfOpen);
    }

    #[test]
    fn manual_reset_preserves_lifetime_totals() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("n1");
        }
        cb.record_success("n1");
        cb.reset_circuit("n1");

        let stats = cb.stats("n1").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.consecutive_successes, 0);
        assert!(stats.opened_at.is_none());
        assert_eq!(stats.total_failures, 5);
        assert_eq!(stats.total_successes, 1);
    }

    #[test]
    fn full_round_trip() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            monitor_interval: Duration::from_secs(5),
        });

        for _ in 0..3 {
            cb.record_failure("n1");
        }
        assert_eq!(cb.state("n1"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.is_allowed("n1"));
        assert_eq!(cb.state("n1"), CircuitState::HalfOpen);

        cb.record_success("n1");
        cb.record_success("n1");
        assert_eq!(cb.state("n1"), CircuitState::Closed);

        // The breaker must trip again after recovery.
        for _ in 0..3 {
            cb.record_failure("n1");
        }
        assert_eq!(cb.state("n1"), CircuitState::Open);
    }
}
