//! snowgate gateway core.
//!
//! A JSON-RPC 2.0 gateway in front of a pool of EVM execution nodes
//! (Avalanche C-Chain mainnet and Fuji). Clients issue requests against one
//! logical endpoint; the gateway validates, picks a backend via the
//! configured strategy, forwards with retries, and caches deterministic
//! read responses.
//!
//! # Components
//!
//! - [`registry::NodeRegistry`] - authoritative node identity and liveness
//! - [`health::HealthChecker`] - active probing and 0-100 scoring
//! - [`breaker::CircuitBreaker`] - per-node CLOSED/OPEN/HALF_OPEN admission
//! - [`balancer::LoadBalancer`] - strategy-driven selection with sticky
//!   sessions
//! - [`proxy::RpcProxy`] - forwarding, retries, and outcome accounting
//! - [`cache::ResponseCache`] - method-aware TTL cache with invalidation
//! - [`gateway::Gateway`] - dependency-injected wiring and task lifecycle
//! - [`http_server::HttpServer`] - axum front door and admin surface
//!
//! # Example
//!
//! ```no_run
//! use snowgate_gateway::config::GatewayConfig;
//! use snowgate_gateway::gateway::Gateway;
//! use snowgate_gateway::http_server::HttpServer;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_env()?;
//! let gateway = Arc::new(Gateway::new(config)?);
//! gateway.start();
//!
//! let server = HttpServer::new(Arc::clone(&gateway));
//! server.run("0.0.0.0:8545".parse()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod health;
pub mod http_server;
pub mod node;
pub mod proxy;
pub mod registry;

pub use balancer::{LoadBalancer, LoadBalancerConfig, Strategy};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cache::{CacheConfig, CacheMetrics, ResponseCache};
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use health::{HealthCheckConfig, HealthChecker, HealthReport};
pub use http_server::HttpServer;
pub use node::{Network, Node, NodeId};
pub use proxy::{ProxyConfig, RpcProxy};
pub use registry::NodeRegistry;
