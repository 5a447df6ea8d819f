//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → proxy_protocol.rs (optional PROXY v1 header, real client address)
//!     → connection.rs (identity, lifetime tracking)
//!     → proxy layer (ClientConnection)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Every client and server connection is tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod proxy_protocol;
