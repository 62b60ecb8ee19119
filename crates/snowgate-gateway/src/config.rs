//! Environment-driven gateway configuration.
//!
//! All knobs have defaults; the environment only overrides. Durations are
//! given in milliseconds, matching the upstream deployment convention.

use std::env;
use std::time::Duration;

use snowgate_common::{GatewayError, Result};

use crate::balancer::LoadBalancerConfig;
use crate::breaker::CircuitBreakerConfig;
use crate::cache::CacheConfig;
use crate::health::HealthCheckConfig;
use crate::node::{Network, Node};
use crate::proxy::ProxyConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub default_network: Option<Network>,
    pub health: HealthCheckConfig,
    pub breaker: CircuitBreakerConfig,
    pub balancer: LoadBalancerConfig,
    pub proxy: ProxyConfig,
    pub cache: CacheConfig,
    pub nodes: Vec<Node>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_network: None,
            health: HealthCheckConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            balancer: LoadBalancerConfig::default(),
            // The gateway always serves requests through the HTTP front
            // door, so it takes the front-handler attempt timeout rather
            // than the 5 s library default.
            proxy: ProxyConfig::front_handler(),
            cache: CacheConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// The network used when a request does not name one.
    pub fn default_network(&self) -> Network {
        self.default_network.unwrap_or(Network::AvalancheMainnet)
    }

    /// Builds a configuration from the process environment.
    ///
    /// | Variable | Effect |
    /// |---|---|
    /// | `HEALTH_CHECK_INTERVAL` | probe interval, ms |
    /// | `HEALTH_CHECK_TIMEOUT` | per-probe timeout, ms |
    /// | `HEALTH_RECOVERY_INTERVAL` | recovery probe interval, ms |
    /// | `HEALTH_CHECK_ENDPOINT` | probe path suffix |
    /// | `HEALTH_FAILURE_THRESHOLD` | failures before unhealthy |
    /// | `HEALTH_SUCCESS_THRESHOLD` | successes before recovery |
    /// | `DEFAULT_NETWORK` | network when the request names none |
    /// | `AVAX_MAINNET_RPC_URLS` | comma-separated mainnet node URLs |
    /// | `AVAX_FUJI_RPC_URLS` | comma-separated Fuji node URLs |
    /// | `PROXY_TIMEOUT_MS` / `PROXY_RETRIES` / `PROXY_RETRY_DELAY_MS` | forward behavior |
    /// | `CACHE_MAX_ENTRIES` / `CACHE_PERSIST_PATH` | cache bounds and snapshot |
    pub fn from_env() -> Result<Self> {
        let mut config = GatewayConfig::default();

        if let Some(ms) = env_ms("HEALTH_CHECK_INTERVAL")? {
            config.health.interval = ms;
        }
        if let Some(ms) = env_ms("HEALTH_CHECK_TIMEOUT")? {
            config.health.timeout = ms;
        }
        if let Some(ms) = env_ms("HEALTH_RECOVERY_INTERVAL")? {
            config.health.recovery_interval = ms;
        }
        if let Ok(path) = env::var("HEALTH_CHECK_ENDPOINT") {
            config.health.health_path = path;
        }
        if let Some(n) = env_u32("HEALTH_FAILURE_THRESHOLD")? {
            config.health.failure_threshold = n;
        }
        if let Some(n) = env_u32("HEALTH_SUCCESS_THRESHOLD")? {
            config.health.success_threshold = n;
        }

        if let Ok(raw) = env::var("DEFAULT_NETWORK") {
            let network = raw
                .parse::<Network>()
                .map_err(GatewayError::Config)?;
            config.default_network = Some(network);
        }

        if let Some(ms) = env_ms("PROXY_TIMEOUT_MS")? {
            config.proxy.timeout = ms;
        }
        if let Some(n) = env_u32("PROXY_RETRIES")? {
            config.proxy.retries = n;
        }
        if let Some(ms) = env_ms("PROXY_RETRY_DELAY_MS")? {
            config.proxy.retry_delay = ms;
        }

        if let Some(n) = env_u32("CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = n as usize;
        }
        if let Ok(path) = env::var("CACHE_PERSIST_PATH") {
            if !path.is_empty() {
                config.cache.persist_path = Some(path.into());
            }
        }

        if let Ok(urls) = env::var("AVAX_MAINNET_RPC_URLS") {
            config
                .nodes
                .extend(parse_node_urls(&urls, Network::AvalancheMainnet, "mainnet"));
        }
        if let Ok(urls) = env::var("AVAX_FUJI_RPC_URLS") {
            config
                .nodes
                .extend(parse_node_urls(&urls, Network::AvalancheFuji, "fuji"));
        }

        Ok(config)
    }
}

/// Parses a comma-separated URL list into seeded nodes.
///
/// Ids are `<prefix>-1`, `<prefix>-2`, …; list position doubles as the
/// priority so earlier URLs win health-score ties.
pub fn parse_node_urls(urls: &str, network: Network, prefix: &str) -> Vec<Node> {
    urls.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .enumerate()
        .map(|(i, url)| {
            Node::new(format!("{}-{}", prefix, i + 1), url, network).with_priority(i as u32)
        })
        .collect()
}

fn env_ms(var: &str) -> Result<Option<Duration>> {
    match env::var(var) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|_| GatewayError::Config(format!("{var} must be milliseconds: {raw}")))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

fn env_u32(var: &str) -> Result<Option<u32>> {
    match env::var(var) {
        Ok(raw) => {
            let n: u32 = raw
                .parse()
                .map_err(|_| GatewayError::Config(format!("{var} must be an integer: {raw}")))?;
            Ok(Some(n))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_urls_parse_with_ids_and_priorities() {
        let nodes = parse_node_urls(
            "https://api.avax.network/ext/bc/C/rpc, https://backup.example/rpc",
            Network::AvalancheMainnet,
            "mainnet",
        );
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "mainnet-1");
        assert_eq!(nodes[0].priority, 0);
        assert_eq!(nodes[1].id, "mainnet-2");
        assert_eq!(nodes[1].priority, 1);
        assert_eq!(nodes[1].url, "https://backup.example/rpc");
        assert!(nodes.iter().all(|n| n.network == Network::AvalancheMainnet));
    }

    #[test]
    fn empty_segments_are_skipped() {
        let nodes = parse_node_urls("https://a/rpc,,", Network::AvalancheFuji, "fuji");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "fuji-1");
    }

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.default_network(), Network::AvalancheMainnet);
        assert_eq!(config.health.interval, Duration::from_secs(10));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.proxy.retries, 2);
        // Front-handler attempt timeout, not the 5 s library default.
        assert_eq!(config.proxy.timeout, Duration::from_secs(15));
        assert_eq!(config.cache.max_entries, 10_000);
        assert!(config.nodes.is_empty());
    }
}
