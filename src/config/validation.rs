//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, watermarks ordered, limits > 0)
//! - Check addresses parse before the listener or exporter tries them
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    let timeouts = [
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.connect_wait_secs", config.timeouts.connect_wait_secs),
        ("timeouts.idle_secs", config.timeouts.idle_secs),
    ];
    for (field, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    let codec = [
        ("codec.max_initial_line_length", config.codec.max_initial_line_length),
        ("codec.max_header_size", config.codec.max_header_size),
        ("codec.max_chunk_size", config.codec.max_chunk_size),
    ];
    for (field, value) in codec {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.flow.write_buffer_low_water >= config.flow.write_buffer_high_water {
        errors.push(ValidationError::new(
            "flow.write_buffer_low_water",
            "must be lower than flow.write_buffer_high_water",
        ));
    }

    if let Some(auth) = &config.authentication {
        if auth.username.is_empty() {
            errors.push(ValidationError::new("authentication.username", "must not be empty"));
        }
    }

    for (i, hop) in config.chained_proxies.iter().enumerate() {
        let valid = hop
            .address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            errors.push(ValidationError::new(
                format!("chained_proxies[{}].address", i),
                format!("'{}' is not host:port", hop.address),
            ));
        }
        if hop.username.is_some() != hop.password.is_some() {
            errors.push(ValidationError::new(
                format!("chained_proxies[{}]", i),
                "username and password must be set together",
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{AuthenticationConfig, ChainedProxyConfig};

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.timeouts.idle_secs = 0;
        config.flow.write_buffer_low_water = config.flow.write_buffer_high_water;
        config.authentication = Some(AuthenticationConfig {
            username: String::new(),
            password: "x".into(),
            realm: "r".into(),
        });
        config.chained_proxies.push(ChainedProxyConfig {
            address: "missing-port".into(),
            username: Some("u".into()),
            password: None,
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "timeouts.idle_secs",
                "flow.write_buffer_low_water",
                "authentication.username",
                "chained_proxies[0].address",
                "chained_proxies[0]",
            ]
        );
    }
}
