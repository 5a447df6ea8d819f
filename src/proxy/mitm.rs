//! TLS interception hooks.
//!
//! When a [`MitmManager`] is installed, CONNECT requests are not tunneled.
//! Instead the proxy terminates TLS with the client and originates a second
//! TLS session to the destination, relaying decrypted HTTP between them.
//! Certificate provisioning is the manager's concern.

use std::io;

use futures_util::future::BoxFuture;

use crate::proxy::transport::BoxedIo;

pub trait MitmManager: Send + Sync {
    /// Wrap the proxy-to-server stream in a client-role TLS session.
    fn server_tls(&self, io: BoxedIo, host: &str) -> BoxFuture<'static, io::Result<BoxedIo>>;

    /// Wrap the client-to-proxy stream in a server-role TLS session
    /// impersonating `host`.
    fn client_tls(&self, io: BoxedIo, host: &str) -> BoxFuture<'static, io::Result<BoxedIo>>;
}
