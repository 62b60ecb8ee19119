use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Stable identifier of a backend node.
pub type NodeId = String;

/// Chain a node serves.
///
/// A closed set; adding another EVM-compatible chain means adding a variant
/// here and wiring its seed URLs in the configuration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "avalanche-mainnet")]
    AvalancheMainnet,
    #[serde(rename = "avalanche-fuji")]
    AvalancheFuji,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::AvalancheMainnet => "avalanche-mainnet",
            Network::AvalancheFuji => "avalanche-fuji",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avalanche-mainnet" => Ok(Network::AvalancheMainnet),
            "avalanche-fuji" => Ok(Network::AvalancheFuji),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// A backend execution node and its mutable liveness state.
///
/// Static identity comes from configuration; `healthy` and `last_checked_at`
/// are owned by the health checker and flipped through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier (e.g. "mainnet-1")
    pub id: NodeId,
    /// JSON-RPC endpoint URL
    pub url: String,
    /// Chain this node serves
    pub network: Network,
    /// Relative selection weight for the weighted strategy (>= 1)
    pub weight: u32,
    /// Tie-break rank for the health-based strategy; lower wins
    pub priority: u32,
    /// Methods/features this node supports (e.g. "eth_call", "archive")
    pub capabilities: HashSet<String>,
    /// Advisory upstream rate limit, requests per window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    /// Current liveness as judged by the health checker
    pub healthy: bool,
    /// When the health checker last observed this node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<SystemTime>,
}

impl Node {
    /// Creates a node with default weight/priority, no capabilities, and
    /// healthy liveness (nodes start selectable until a probe says otherwise).
    pub fn new(id: impl Into<NodeId>, url: impl Into<String>, network: Network) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            network,
            weight: 1,
            priority: 0,
            capabilities: HashSet::new(),
            rate_limit: None,
            healthy: true,
            last_checked_at: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rate_limit(mut self, requests_per_window: u32) -> Self {
        self.rate_limit = Some(requests_per_window);
        self
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }
}
