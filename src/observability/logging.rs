//! Structured logging setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless:
/// the second install is ignored.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives(&config.log_level).into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

/// Configured level for this crate, warnings only for dependencies.
fn default_directives(level: &str) -> String {
    format!("forward_proxy={},warn", level.trim().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_applies_to_this_crate_only() {
        assert_eq!(default_directives("debug"), "forward_proxy=debug,warn");
        assert_eq!(default_directives(" INFO "), "forward_proxy=info,warn");
    }

    #[test]
    fn directives_parse_as_a_filter() {
        assert!(EnvFilter::try_new(default_directives("trace")).is_ok());
    }
}
