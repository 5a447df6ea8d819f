//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → accept loop stops → open connections drain → exit
//! ```
//!
//! # Design Decisions
//! - Draining is bounded: connections still open after the deadline are
//!   abandoned when the runtime exits

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
