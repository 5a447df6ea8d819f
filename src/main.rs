//! Forwarding HTTP/HTTPS proxy.
//!
//! ```text
//!     Client ──▶ listener ──▶ ClientConnection ──▶ ServerConnection ──▶ Origin
//!                                   │                     │
//!                                   │                     └──▶ Chained proxy ──▶ Origin
//!                                   └── CONNECT ──▶ raw tunnel / MITM
//! ```

use std::path::PathBuf;

use clap::Parser;

use forward_proxy::config::{load_config, ProxyConfig};
use forward_proxy::net::listener::Listener;
use forward_proxy::observability::{init_logging, init_metrics};
use forward_proxy::{ProxyServer, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "forward-proxy", version, about = "Forwarding HTTP/HTTPS proxy")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "forward-proxy starting");

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        transparent = config.proxy.transparent,
        chained_proxies = config.chained_proxies.len(),
        authentication = config.authentication.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(error) = init_metrics(addr) {
                    tracing::error!(error = %error, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    ProxyServer::new(config)
        .run(listener, shutdown.subscribe())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
