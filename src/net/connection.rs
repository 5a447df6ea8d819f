//! Connection identity and lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique, leg-tagged connection IDs for tracing
//! - Count live client and server connections
//! - Let shutdown wait until every connection has closed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Which side of the proxy a connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Accepted from a client.
    Client,
    /// Dialed towards an origin or chained proxy.
    Server,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Client => "client",
            Leg::Server => "server",
        }
    }
}

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    leg: Leg,
    seq: u64,
}

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new(leg: Leg) -> Self {
        Self {
            leg,
            seq: CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.leg.as_str(), self.seq)
    }
}

/// Counts live connections so shutdown can drain them.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new live connection. The returned guard releases it on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active.send_modify(|count| *count += 1);
        if id.leg() == Leg::Client {
            metrics::gauge!("proxy_active_client_connections").increment(1.0);
        }
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until no connection is live, giving up after `timeout`.
    ///
    /// Returns `true` if every connection closed in time.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection counted while alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|count| *count = count.saturating_sub(1));
        if self.id.leg() == Leg::Client {
            metrics::gauge!("proxy_active_client_connections").decrement(1.0);
        }
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}
