//! Upstream proxy chaining.
//!
//! # Responsibilities
//! - Describe an upstream hop and the callbacks it receives
//! - Let a [`ChainedProxyManager`] pick the ordered hops for a request
//!
//! # Design Decisions
//! - The manager fills an ordered queue; a server connection pops the next
//!   hop only after the current one reported failure, so retry policy lives
//!   entirely in the manager's ordering
//! - [`Hop::Direct`] is the fallback sentinel meaning "dial the origin"

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::HttpRequest;
use crate::proxy::ntlm::NtlmProvider;
use crate::proxy::transport::BoxedIo;

/// An upstream proxy the server leg may dial instead of the origin.
pub trait ChainedProxy: Send + Sync {
    /// `host:port` to dial.
    fn address(&self) -> &str;

    /// Whether the link to this hop must be wrapped by [`ChainedProxy::encrypt`].
    fn requires_encryption(&self) -> bool {
        false
    }

    fn encrypt(&self, io: BoxedIo) -> BoxFuture<'static, io::Result<BoxedIo>> {
        Box::pin(async move { Ok(io) })
    }

    /// Basic credentials presented in `Proxy-Authorization`.
    fn credentials(&self) -> Option<(&str, &str)> {
        None
    }

    /// Set when this hop authenticates with NTLM.
    fn ntlm_provider(&self) -> Option<&dyn NtlmProvider> {
        None
    }

    /// Last chance to adjust a request before it is sent to this hop.
    fn filter_request(&self, _request: &mut HttpRequest) {}

    fn connection_succeeded(&self) {}

    fn connection_failed(&self, _error: &ProxyError) {}

    fn disconnected(&self) {}
}

/// One candidate route to the destination.
#[derive(Clone)]
pub enum Hop {
    /// Connect straight to the origin.
    Direct,
    Proxy(Arc<dyn ChainedProxy>),
}

impl Hop {
    pub fn is_direct(&self) -> bool {
        matches!(self, Hop::Direct)
    }

    pub fn as_proxy(&self) -> Option<&Arc<dyn ChainedProxy>> {
        match self {
            Hop::Proxy(proxy) => Some(proxy),
            Hop::Direct => None,
        }
    }
}

impl std::fmt::Debug for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hop::Direct => f.write_str("Direct"),
            Hop::Proxy(proxy) => write!(f, "Proxy({})", proxy.address()),
        }
    }
}

/// Chooses the hops for a request.
pub trait ChainedProxyManager: Send + Sync {
    /// Append candidate hops in the order they should be tried.
    fn lookup_chained_proxies(&self, request: &HttpRequest, hops: &mut VecDeque<Hop>);

    /// Override the destination `host:port` for a request.
    fn host_and_port(&self, _request: &HttpRequest) -> Option<String> {
        None
    }
}

/// A hop built from configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredChainedProxy {
    address: String,
    credentials: Option<(String, String)>,
}

impl ConfiguredChainedProxy {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

impl ChainedProxy for ConfiguredChainedProxy {
    fn address(&self) -> &str {
        &self.address
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()))
    }

    fn connection_succeeded(&self) {
        tracing::debug!(upstream = %self.address, "Chained proxy connected");
    }

    fn connection_failed(&self, error: &ProxyError) {
        tracing::warn!(upstream = %self.address, error = %error, "Chained proxy unreachable");
    }
}

/// Same hop list for every request.
#[derive(Debug, Clone)]
pub struct StaticChainedProxyManager {
    hops: Vec<Arc<ConfiguredChainedProxy>>,
    fallback_to_direct: bool,
}

impl StaticChainedProxyManager {
    pub fn new(hops: Vec<ConfiguredChainedProxy>, fallback_to_direct: bool) -> Self {
        Self {
            hops: hops.into_iter().map(Arc::new).collect(),
            fallback_to_direct,
        }
    }

    /// `None` when no chained proxy is configured.
    pub fn from_config(config: &ProxyConfig) -> Option<Self> {
        if config.chained_proxies.is_empty() {
            return None;
        }
        let hops = config
            .chained_proxies
            .iter()
            .map(|hop| {
                let proxy = ConfiguredChainedProxy::new(&hop.address);
                match (&hop.username, &hop.password) {
                    (Some(user), Some(pass)) => proxy.with_credentials(user, pass),
                    _ => proxy,
                }
            })
            .collect();
        Some(Self::new(hops, config.chaining.fallback_to_direct))
    }
}

impl ChainedProxyManager for StaticChainedProxyManager {
    fn lookup_chained_proxies(&self, _request: &HttpRequest, hops: &mut VecDeque<Hop>) {
        for hop in &self.hops {
            hops.push_back(Hop::Proxy(hop.clone()));
        }
        if self.fallback_to_direct {
            hops.push_back(Hop::Direct);
        }
    }
}
