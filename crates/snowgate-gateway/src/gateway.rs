//! Top-level gateway object.
//!
//! Owns every subsystem explicitly (no module-level singletons) and the
//! lifetimes of the background loops: health probe, recovery probe, breaker
//! monitor, cache sweep, and session sweep. Tests construct a fresh gateway
//! per case.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use snowgate_common::{Result, RpcPayload};

use crate::balancer::{LoadBalancer, Strategy};
use crate::breaker::CircuitBreaker;
use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::health::{HealthChecker, HealthReport};
use crate::node::Network;
use crate::proxy::{ProxyOutcome, RpcProxy};
use crate::registry::NodeRegistry;

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<NodeRegistry>,
    health: Arc<HealthChecker>,
    breaker: Arc<CircuitBreaker>,
    balancer: Arc<LoadBalancer>,
    cache: Arc<ResponseCache>,
    proxy: RpcProxy,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Wires the subsystems together without starting any background work.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new(config.nodes.clone()));
        let health = Arc::new(HealthChecker::new(
            Arc::clone(&registry),
            config.health.clone(),
        )?);
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&breaker),
            config.balancer.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let proxy = RpcProxy::new(
            Arc::clone(&registry),
            Arc::clone(&balancer),
            Arc::clone(&cache),
            config.proxy.clone(),
        )?;

        Ok(Self {
            config,
            registry,
            health,
            breaker,
            balancer,
            cache,
            proxy,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Loads the cache snapshot (when configured) and spawns all background
    /// loops.
    pub fn start(&self) {
        match self.cache.load() {
            Ok(0) => {}
            Ok(loaded) => info!(loaded, "cache warmed from snapshot"),
            Err(e) => warn!(error = %e, "cache snapshot load failed"),
        }

        let breaker = Arc::clone(&self.breaker);
        let monitor_interval = self.breaker.config().monitor_interval;
        let monitor = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                breaker.tick();
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.health.spawn_probe());
        tasks.push(self.health.spawn_recovery());
        tasks.push(monitor);
        tasks.push(self.cache.spawn_sweep());
        tasks.push(self.balancer.spawn_session_sweep());
        info!(nodes = self.registry.len(), "gateway background tasks started");
    }

    /// Stops every background loop and writes a final cache snapshot.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Err(e) = self.cache.save() {
            warn!(error = %e, "final cache snapshot failed");
        }
        info!("gateway stopped");
    }

    /// Handles one validated payload.
    pub async fn handle(
        &self,
        payload: RpcPayload,
        network: Option<Network>,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> ProxyOutcome {
        let network = network.unwrap_or_else(|| self.config.default_network());
        self.proxy
            .handle(payload, network, strategy, capability, session_id)
            .await
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.get_health_report()
    }

    /// JSON metrics projection: cache counters, per-node forwarded-request
    /// counts, and liveness totals.
    pub fn metrics_snapshot(&self) -> Value {
        let report = self.health.get_health_report();
        json!({
            "cache": self.cache.metrics(),
            "nodes": self.proxy.node_request_stats(),
            "health": {
                "total": report.total_nodes,
                "healthy": report.healthy_nodes,
                "unhealthy": report.unhealthy_nodes,
            },
        })
    }

    pub fn default_network(&self) -> Network {
        self.config.default_network()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn config_with_nodes() -> GatewayConfig {
        GatewayConfig {
            nodes: vec![
                Node::new("mainnet-1", "http://a:9650", Network::AvalancheMainnet),
                Node::new("fuji-1", "http://b:9650", Network::AvalancheFuji),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn gateway_wires_components() {
        let gateway = Gateway::new(config_with_nodes()).unwrap();
        assert_eq!(gateway.registry().len(), 2);
        assert_eq!(gateway.default_network(), Network::AvalancheMainnet);
        let report = gateway.health_report();
        assert_eq!(report.total_nodes, 2);
    }

    #[tokio::test]
    async fn start_and_shutdown_manage_tasks() {
        let gateway = Gateway::new(config_with_nodes()).unwrap();
        gateway.start();
        assert_eq!(gateway.tasks.lock().unwrap().len(), 5);
        gateway.shutdown();
        assert!(gateway.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn metrics_snapshot_shape() {
        let gateway = Gateway::new(config_with_nodes()).unwrap();
        let snapshot = gateway.metrics_snapshot();
        assert_eq!(snapshot["health"]["total"], 2);
        assert_eq!(snapshot["cache"]["max_entries"], 10_000);
        assert!(snapshot["nodes"].is_object());
    }
}
