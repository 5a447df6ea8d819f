//! Forwarding HTTP/HTTPS proxy.
//!
//! Each accepted client socket gets a [`proxy::ClientConnection`] that reads
//! requests, authenticates and filters them, then hands them to one
//! [`proxy::ServerConnection`] per destination. CONNECT requests become raw
//! tunnels, or TLS interception when a MITM manager is installed.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use lifecycle::Shutdown;
pub use proxy::{ProxyContext, ProxyServer};
