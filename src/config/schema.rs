//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the forwarding proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Forwarding behaviour (transparency, Via alias).
    pub proxy: ProxyBehaviorConfig,

    /// Optional Basic proxy authentication.
    pub authentication: Option<AuthenticationConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// HTTP decoder limits.
    pub codec: CodecConfig,

    /// Write-buffer watermarks and global bandwidth limits.
    pub flow: FlowConfig,

    /// Upstream proxies to chain through, tried in order.
    pub chained_proxies: Vec<ChainedProxyConfig>,

    /// Chaining policy.
    pub chaining: ChainingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// How requests and responses are rewritten while forwarding.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyBehaviorConfig {
    /// Forward messages untouched (no hop-by-hop stripping, no Via).
    pub transparent: bool,

    /// Name this proxy uses in the `Via` header.
    pub alias: String,

    /// Accept origin-form requests addressed to the proxy itself, routing
    /// them by their `Host` header. Off by default to avoid request loops.
    pub allow_requests_to_origin_server: bool,

    /// Expect a PROXY protocol v1 header ahead of the first request and
    /// treat its source address as the client's.
    pub accept_proxy_protocol: bool,
}

impl Default for ProxyBehaviorConfig {
    fn default() -> Self {
        Self {
            transparent: false,
            alias: "forward-proxy".to_string(),
            allow_requests_to_origin_server: false,
            accept_proxy_protocol: false,
        }
    }
}

/// Static credentials for Basic proxy authentication.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthenticationConfig {
    pub username: String,
    pub password: String,

    /// Realm advertised in `Proxy-Authenticate`.
    #[serde(default = "default_realm")]
    pub realm: String,
}

fn default_realm() -> String {
    "Restricted Files".to_string()
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// How long a writer waits for an in-progress dial, in seconds.
    pub connect_wait_secs: u64,

    /// Idle connection timeout in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 40,
            connect_wait_secs: 30,
            idle_secs: 70,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.connect_wait_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Bounds applied by the HTTP decoders on both legs.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_chunk_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_initial_line_length: 8192,
            max_header_size: 16384,
            max_chunk_size: 16384,
        }
    }
}

/// Outbound buffer watermarks.
///
/// A transport is saturated once more than `write_buffer_high_water` bytes
/// are queued and becomes writable again below `write_buffer_low_water`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowConfig {
    pub write_buffer_high_water: usize,
    pub write_buffer_low_water: usize,

    /// Bytes per second read across all connections; 0 disables the limit.
    pub read_throttle_bytes_per_sec: u64,

    /// Bytes per second written across all connections; 0 disables the limit.
    pub write_throttle_bytes_per_sec: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            write_buffer_high_water: 64 * 1024,
            write_buffer_low_water: 32 * 1024,
            read_throttle_bytes_per_sec: 0,
            write_throttle_bytes_per_sec: 0,
        }
    }
}

/// An upstream proxy hop.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainedProxyConfig {
    /// Upstream proxy address (e.g., "10.0.0.1:3128").
    pub address: String,

    /// Basic credentials presented to the upstream proxy.
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Chaining policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainingConfig {
    /// Try a direct connection after every chained hop failed.
    pub fallback_to_direct: bool,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.timeouts.connect_secs, 40);
        assert_eq!(config.timeouts.idle_secs, 70);
        assert_eq!(config.codec.max_initial_line_length, 8192);
        assert!(config.authentication.is_none());
        assert!(config.chained_proxies.is_empty());
    }

    #[test]
    fn parses_auth_and_chained_hops() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [authentication]
            username = "user"
            password = "secret"

            [[chained_proxies]]
            address = "10.0.0.1:3128"
            username = "hop"
            password = "pw"

            [chaining]
            fallback_to_direct = true
            "#,
        )
        .unwrap();

        let auth = config.authentication.unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.realm, "Restricted Files");
        assert_eq!(config.chained_proxies.len(), 1);
        assert_eq!(config.chained_proxies[0].username.as_deref(), Some("hop"));
        assert!(config.chaining.fallback_to_direct);
    }
}
