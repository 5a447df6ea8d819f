//! Observability subsystem.
//!
//! # Responsibilities
//! - Install the global tracing subscriber
//! - Expose proxy counters over a Prometheus scrape endpoint
//!
//! # Design Decisions
//! - Connection and request context travels as structured fields
//!   (`connection_id`, `server`, `method`) rather than in message text
//! - Metric emission uses the `metrics` facade; without an installed
//!   recorder every macro is a no-op, so tests never need setup

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
