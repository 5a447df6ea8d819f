//! Request/response filter hooks.
//!
//! ```text
//! client ──▶ client_to_proxy_request ──▶ proxy_to_server_request ──▶ server
//! client ◀── proxy_to_client_response ◀── server_to_proxy_response ◀── server
//! ```
//!
//! Request hooks may return a response to short-circuit the exchange; the
//! upstream is then never contacted. Response hooks may replace an object or
//! return `None`, which disconnects both legs.

use std::sync::Arc;

use crate::http::{HttpObject, HttpRequest, HttpResponse};

/// Hooks for a single exchange, created per client request.
pub trait HttpFilters: Send + Sync {
    fn client_to_proxy_request(&self, _object: &mut HttpObject) -> Option<HttpResponse> {
        None
    }

    fn proxy_to_server_request(&self, _object: &mut HttpObject) -> Option<HttpResponse> {
        None
    }

    fn server_to_proxy_response(&self, object: HttpObject) -> Option<HttpObject> {
        Some(object)
    }

    fn proxy_to_client_response(&self, object: HttpObject) -> Option<HttpObject> {
        Some(object)
    }

    fn proxy_to_server_connection_started(&self) {}

    fn proxy_to_server_connection_succeeded(&self) {}

    fn proxy_to_server_connection_failed(&self) {}

    fn server_to_proxy_response_timed_out(&self) {}
}

/// Creates the filters for each new client request.
pub trait HttpFiltersSource: Send + Sync {
    fn filter_request(&self, original: &HttpRequest) -> Arc<dyn HttpFilters>;
}

/// Filters that pass everything through.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFilters;

impl HttpFilters for NoopFilters {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFiltersSource;

impl HttpFiltersSource for NoopFiltersSource {
    fn filter_request(&self, _original: &HttpRequest) -> Arc<dyn HttpFilters> {
        Arc::new(NoopFilters)
    }
}
