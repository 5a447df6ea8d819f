//! Activity callbacks for observers outside the proxy.

use std::net::SocketAddr;

use crate::http::{HttpRequest, HttpResponse};

/// Notified as traffic passes through; every method defaults to a no-op.
pub trait ActivityTracker: Send + Sync {
    fn client_connected(&self, _peer: Option<SocketAddr>) {}

    fn client_disconnected(&self, _peer: Option<SocketAddr>) {}

    fn request_received_from_client(&self, _request: &HttpRequest) {}

    fn request_sent_to_server(&self, _server_host_and_port: &str, _request: &HttpRequest) {}

    fn bytes_received_from_client(&self, _count: usize) {}

    fn response_received_from_server(&self, _server_host_and_port: &str, _response: &HttpResponse) {}

    fn response_sent_to_client(&self, _request: Option<&HttpRequest>, _response: &HttpResponse) {}

    fn bytes_received_from_server(&self, _count: usize) {}
}
