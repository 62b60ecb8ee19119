//! Node registry: the single source of truth for node identity and liveness.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use snowgate_common::{GatewayError, Result};

use crate::node::{Network, Node, NodeId};

/// Registry of backend nodes.
///
/// Reads take a shared lock; writes are serialized behind the same lock.
/// The startup configuration is retained so `reset` can reinstate it after
/// dynamic add/remove churn.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
    initial: Vec<Node>,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<Node>) -> Self {
        let map = nodes.iter().cloned().map(|n| (n.id.clone(), n)).collect();
        Self {
            nodes: RwLock::new(map),
            initial: nodes,
        }
    }

    /// All nodes, sorted by id for stable iteration order.
    pub fn list_all(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().unwrap().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn list_by_network(&self, network: Network) -> Vec<Node> {
        self.list_all()
            .into_iter()
            .filter(|n| n.network == network)
            .collect()
    }

    pub fn list_healthy(&self) -> Vec<Node> {
        self.list_all().into_iter().filter(|n| n.healthy).collect()
    }

    pub fn list_healthy_by_network(&self, network: Network) -> Vec<Node> {
        self.list_by_network(network)
            .into_iter()
            .filter(|n| n.healthy)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.nodes.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.read().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }

    /// Updates liveness and the observation timestamp. Unknown ids are a
    /// no-op.
    pub fn set_health(&self, id: &str, healthy: bool) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(id) {
            node.healthy = healthy;
            node.last_checked_at = Some(SystemTime::now());
        }
    }

    /// Sets the selection weight (clamped to >= 1). Unknown ids are a no-op.
    pub fn set_weight(&self, id: &str, weight: u32) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(id) {
            node.weight = weight.max(1);
        }
    }

    /// Adds a node; fails if the id is already registered.
    pub fn add(&self, node: Node) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&node.id) {
            return Err(GatewayError::Config(format!(
                "node id already registered: {}",
                node.id
            )));
        }
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Removes a node; returns whether one was present.
    pub fn remove(&self, id: &str) -> bool {
        self.nodes.write().unwrap().remove(id).is_some()
    }

    /// Reinstates the startup configuration, discarding dynamic changes.
    pub fn reset(&self) {
        let mut nodes = self.nodes.write().unwrap();
        nodes.clear();
        for node in &self.initial {
            nodes.insert(node.id.clone(), node.clone());
        }
    }

    pub fn has_capability(&self, id: &str, cap: &str) -> bool {
        self.nodes
            .read()
            .unwrap()
            .get(id)
            .map(|n| n.has_capability(cap))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(vec![
            Node::new("mainnet-1", "http://a:9650", Network::AvalancheMainnet),
            Node::new("mainnet-2", "http://b:9650", Network::AvalancheMainnet)
                .with_capabilities(["archive"]),
            Node::new("fuji-1", "http://c:9650", Network::AvalancheFuji),
        ])
    }

    #[test]
    fn lists_by_network() {
        let reg = registry();
        assert_eq!(reg.list_all().len(), 3);
        assert_eq!(reg.list_by_network(Network::AvalancheMainnet).len(), 2);
        assert_eq!(reg.list_by_network(Network::AvalancheFuji).len(), 1);
    }

    #[test]
    fn health_filtering() {
        let reg = registry();
        reg.set_health("mainnet-1", false);
        let healthy = reg.list_healthy_by_network(Network::AvalancheMainnet);
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "mainnet-2");
        assert!(reg.get("mainnet-1").unwrap().last_checked_at.is_some());
    }

    #[test]
    fn set_health_unknown_id_is_noop() {
        let reg = registry();
        reg.set_health("nope", false);
        assert_eq!(reg.list_healthy().len(), 3);
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let reg = registry();
        let dup = Node::new("mainnet-1", "http://x", Network::AvalancheMainnet);
        assert!(reg.add(dup).is_err());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn remove_and_reset() {
        let reg = registry();
        assert!(reg.remove("fuji-1"));
        assert!(!reg.remove("fuji-1"));
        reg.set_weight("mainnet-1", 9);
        assert_eq!(reg.len(), 2);

        reg.reset();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.get("mainnet-1").unwrap().weight, 1);
    }

    #[test]
    fn weight_is_clamped() {
        let reg = registry();
        reg.set_weight("mainnet-1", 0);
        assert_eq!(reg.get("mainnet-1").unwrap().weight, 1);
    }

    #[test]
    fn capability_lookup() {
        let reg = registry();
        assert!(reg.has_capability("mainnet-2", "archive"));
        assert!(!reg.has_capability("mainnet-1", "archive"));
        assert!(!reg.has_capability("missing", "archive"));
    }

    #[test]
    fn list_order_is_stable() {
        let reg = registry();
        let ids: Vec<_> = reg.list_all().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["fuji-1", "mainnet-1", "mainnet-2"]);
    }
}
