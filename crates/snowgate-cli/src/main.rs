//! # snowgate CLI entry point
//!
//! Starts the JSON-RPC gateway in front of a pool of EVM execution nodes.
//!
//! ## Usage
//!
//! ```bash
//! # Serve with nodes from the environment
//! AVAX_MAINNET_RPC_URLS=https://api.avax.network/ext/bc/C/rpc \
//!     snowgate serve -b 0.0.0.0:8545
//!
//! # Add nodes on the command line (network:url pairs)
//! snowgate serve -b 0.0.0.0:8545 \
//!     -n avalanche-mainnet=https://api.avax.network/ext/bc/C/rpc \
//!     -n avalanche-fuji=https://api.avax-test.network/ext/bc/C/rpc
//! ```
//!
//! Node URLs must include the `http://` or `https://` prefix. Environment
//! variables (`HEALTH_CHECK_INTERVAL`, `DEFAULT_NETWORK`, ...) provide the
//! rest of the configuration; flags only cover what changes per invocation.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use argh::FromArgs;

use snowgate_gateway::config::GatewayConfig;
use snowgate_gateway::gateway::Gateway;
use snowgate_gateway::http_server::HttpServer;
use snowgate_gateway::node::{Network, Node};

/// snowgate - load-balancing JSON-RPC gateway for EVM node pools
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
}

/// Arguments for running the gateway server.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start the gateway
struct ServeArgs {
    /// address to bind the HTTP server to
    ///
    /// Clients send JSON-RPC POST requests here. Defaults to "0.0.0.0:8545".
    #[argh(option, short = 'b', default = "\"0.0.0.0:8545\".into()")]
    bind: String,

    /// backend node as a network=url pair
    ///
    /// Can be given multiple times, e.g.
    /// `-n avalanche-mainnet=https://api.avax.network/ext/bc/C/rpc`.
    /// Appended to any nodes seeded from the environment.
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<String>,
}

/// Validates that a URL includes an http scheme.
fn validate_http_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid node URL '{url}': must start with http:// or https://"
        ))
    }
}

/// Parses a `network=url` flag into a seeded node list entry.
fn parse_node_flag(flag: &str) -> Result<(Network, String)> {
    let (network, url) = flag
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --node '{flag}': expected network=url"))?;
    let network = network
        .parse::<Network>()
        .map_err(|e| anyhow!("invalid --node '{flag}': {e}"))?;
    validate_http_url(url)?;
    Ok((network, url.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default log level INFO, overridable via RUST_LOG.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow!("invalid bind address '{}': {e}", args.bind))?;

    let mut config = GatewayConfig::from_env()?;

    for (i, flag) in args.nodes.iter().enumerate() {
        let (network, url) = parse_node_flag(flag)?;
        let prefix = match network {
            Network::AvalancheMainnet => "cli-mainnet",
            Network::AvalancheFuji => "cli-fuji",
        };
        let node =
            Node::new(format!("{}-{}", prefix, i + 1), url, network).with_priority(i as u32);
        config.nodes.push(node);
    }

    if config.nodes.is_empty() {
        tracing::warn!("no backend nodes configured; every request will fail with -32003");
    }
    tracing::info!(
        nodes = config.nodes.len(),
        default_network = %config.default_network(),
        "starting gateway"
    );

    let gateway = Arc::new(Gateway::new(config)?);
    gateway.start();

    let server = HttpServer::new(Arc::clone(&gateway));
    let shutdown_gateway = Arc::clone(&gateway);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown_gateway.shutdown();
            std::process::exit(0);
        }
    });

    server.run(addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_flag_parses() {
        let (network, url) =
            parse_node_flag("avalanche-mainnet=https://api.avax.network/ext/bc/C/rpc").unwrap();
        assert_eq!(network, Network::AvalancheMainnet);
        assert_eq!(url, "https://api.avax.network/ext/bc/C/rpc");
    }

    #[test]
    fn node_flag_rejects_bad_shapes() {
        assert!(parse_node_flag("no-equals-sign").is_err());
        assert!(parse_node_flag("mars=https://x").is_err());
        assert!(parse_node_flag("avalanche-fuji=ftp://x").is_err());
    }

    #[test]
    fn url_validation() {
        assert!(validate_http_url("http://127.0.0.1:9650").is_ok());
        assert!(validate_http_url("https://api.avax.network").is_ok());
        assert!(validate_http_url("127.0.0.1:9650").is_err());
    }
}
