//! Forwarding proxy engine.
//!
//! # Data Flow
//! ```text
//! client socket
//!     → transport.rs (driver task, codec, idle timers)
//!     → engine.rs (dispatch by ConnectionState)
//!     → client.rs (auth, filters, destination, request rewriting)
//!     → server.rs (dial, hop fallback, NTLM, FIFO request/response pairing)
//!     → origin or chained proxy
//!
//! responses travel back server.rs → client.rs (respond, closing policy,
//! backpressure) → client socket
//! ```
//!
//! # Design Decisions
//! - One ClientConnection per accepted socket; it owns at most one
//!   ServerConnection per destination `host:port`
//! - Collaborators (authenticator, chain manager, filters, MITM, resolver,
//!   activity trackers) are trait objects shared through [`ProxyContext`]
//! - Upstream failures become synthesized responses on the client leg

pub mod activity;
pub mod auth;
pub mod chain;
pub mod client;
pub mod engine;
pub mod filters;
pub mod mitm;
pub mod ntlm;
pub mod resolver;
pub mod server;
pub mod state;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::ProxyConfig;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};

pub use activity::ActivityTracker;
pub use auth::{ProxyAuthenticator, StaticAuthenticator};
pub use chain::{ChainedProxy, ChainedProxyManager, Hop, StaticChainedProxyManager};
pub use client::ClientConnection;
pub use filters::{HttpFilters, HttpFiltersSource, NoopFiltersSource};
pub use mitm::MitmManager;
pub use ntlm::{NtlmHandshake, NtlmProvider};
pub use resolver::{DnsResolver, HostResolver};
pub use server::ServerConnection;
pub use state::ConnectionState;
pub use transport::Throttle;

/// How long shutdown waits for open connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration and collaborators shared by every connection.
pub struct ProxyContext {
    pub config: ProxyConfig,
    pub authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub chain_manager: Option<Arc<dyn ChainedProxyManager>>,
    pub filters_source: Arc<dyn HttpFiltersSource>,
    pub mitm_manager: Option<Arc<dyn MitmManager>>,
    pub resolver: Arc<dyn HostResolver>,
    pub activity: Vec<Arc<dyn ActivityTracker>>,
    pub tracker: ConnectionTracker,
    /// Bandwidth limits shared by every client and server transport.
    pub throttle: Throttle,
}

impl ProxyContext {
    /// Context with the collaborators implied by `config`.
    pub fn new(config: ProxyConfig) -> Self {
        let authenticator = config
            .authentication
            .as_ref()
            .map(|auth| Arc::new(StaticAuthenticator::from_config(auth)) as Arc<dyn ProxyAuthenticator>);
        let chain_manager = StaticChainedProxyManager::from_config(&config)
            .map(|manager| Arc::new(manager) as Arc<dyn ChainedProxyManager>);

        let throttle = Throttle::from_config(&config.flow);

        Self {
            config,
            authenticator,
            chain_manager,
            filters_source: Arc::new(NoopFiltersSource),
            mitm_manager: None,
            resolver: Arc::new(DnsResolver),
            activity: Vec::new(),
            tracker: ConnectionTracker::new(),
            throttle,
        }
    }

    pub(crate) fn trackers(&self) -> impl Iterator<Item = &dyn ActivityTracker> {
        self.activity.iter().map(|tracker| tracker.as_ref())
    }
}

/// Accept loop plus the shared context.
pub struct ProxyServer {
    ctx: ProxyContext,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            ctx: ProxyContext::new(config),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.ctx.authenticator = Some(authenticator);
        self
    }

    pub fn with_chained_proxy_manager(mut self, manager: Arc<dyn ChainedProxyManager>) -> Self {
        self.ctx.chain_manager = Some(manager);
        self
    }

    pub fn with_filters_source(mut self, source: Arc<dyn HttpFiltersSource>) -> Self {
        self.ctx.filters_source = source;
        self
    }

    pub fn with_mitm_manager(mut self, manager: Arc<dyn MitmManager>) -> Self {
        self.ctx.mitm_manager = Some(manager);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.ctx.resolver = resolver;
        self
    }

    pub fn with_activity_tracker(mut self, tracker: Arc<dyn ActivityTracker>) -> Self {
        self.ctx.activity.push(tracker);
        self
    }

    /// Accept clients until `shutdown` fires, then drain open connections.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let ctx = Arc::new(self.ctx);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        ClientConnection::spawn(Arc::clone(&ctx), stream, peer, permit);
                    }
                    Err(ListenerError::Accept(error)) => {
                        tracing::warn!(error = %error, "Failed to accept connection");
                    }
                    Err(error) => return Err(error),
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        let active = ctx.tracker.active_count();
        if active > 0 {
            tracing::info!(active_connections = active, "Draining connections");
            if !ctx.tracker.wait_for_idle(DRAIN_TIMEOUT).await {
                tracing::warn!(
                    active_connections = ctx.tracker.active_count(),
                    "Drain timeout elapsed with connections still open"
                );
            }
        }
        Ok(())
    }
}
