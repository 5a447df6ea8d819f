//! Client-to-proxy leg.
//!
//! # Responsibilities
//! - Authenticate the client and run request filters
//! - Resolve the destination and pick (or create) its server connection
//! - Rewrite requests for forwarding and relay responses back
//! - Decide after each response which legs to close
//! - Throttle reads on either leg when the other cannot keep up
//!
//! # Request Flow
//! ```text
//! request head
//!     → proxy authentication (407 until valid Basic credentials)
//!     → client_to_proxy_request filter (may short-circuit)
//!     → destination host:port (502 and disconnect when blank)
//!     → server connection: reuse by host:port, new for CONNECT
//!     → origin-form URI, hop-by-hop stripping, Via
//!     → proxy_to_server_request filter (may short-circuit)
//!     → server.write
//! ```
//!
//! # Closing Policy
//! ```text
//! object not last          → keep both legs
//! request not keep-alive   → close client and server
//! response not keep-alive  → close server only
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use http::header::{CONNECTION, CONTENT_LENGTH, PROXY_AUTHORIZATION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::net::TcpStream;

use crate::error::ProxyError;
use crate::http::headers::{
    self, add_via, ensure_date, split_host_and_port, strip_hop_by_hop_headers, strip_host,
    switch_proxy_connection_header,
};
use crate::http::message::is_transfer_chunked;
use crate::http::{responses, CodecError, HttpChunk, HttpCodec, HttpObject, HttpRequest, HttpResponse};
use crate::net::connection::{ConnectionId, Leg};
use crate::net::listener::ConnectionPermit;
use crate::net::proxy_protocol;
use crate::proxy::auth::decode_basic;
use crate::proxy::engine::{ConnectionEngine, ConnectionHandler};
use crate::proxy::filters::{HttpFilters, NoopFilters};
use crate::proxy::server::{lock, Departure, Exchange, PendingExchange, ServerConnection};
use crate::proxy::state::ConnectionState;
use crate::proxy::transport::{channel, IdleTimeouts, Upgrade};
use crate::proxy::ProxyContext;

/// Which legs to close after relaying a response object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Closing {
    pub(crate) client: bool,
    pub(crate) server: bool,
}

impl Closing {
    pub(crate) fn decide(request_keep_alive: bool, response_keep_alive: bool, is_last: bool) -> Self {
        if !is_last {
            return Self {
                client: false,
                server: false,
            };
        }
        Self {
            client: !request_keep_alive,
            server: !request_keep_alive || !response_keep_alive,
        }
    }
}

/// Registry key for a destination: lowercased host and explicit port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    /// Parse `host[:port]`, defaulting to 443 for CONNECT and 80 otherwise.
    pub(crate) fn parse(host_and_port: &str, is_connect: bool) -> Option<Self> {
        let default_port = if is_connect { 443 } else { 80 };
        split_host_and_port(host_and_port, default_port).map(|(host, port)| Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connection from a client to the proxy.
pub struct ClientConnection {
    engine: ConnectionEngine,
    ctx: Arc<ProxyContext>,
    this: Weak<ClientConnection>,
    peer: SocketAddr,
    /// Server connections by destination `host:port`.
    servers: DashMap<Destination, Arc<ServerConnection>>,
    current_server: Mutex<Option<Arc<ServerConnection>>>,
    current_filters: Mutex<Arc<dyn HttpFilters>>,
    /// Request being handled, until a response for it is written.
    current_request: Mutex<Option<Arc<HttpRequest>>>,
    connecting_servers: AtomicUsize,
    authenticated: AtomicBool,
    mitming: AtomicBool,
    flow_lock: Mutex<()>,
}

impl ClientConnection {
    /// Serve an accepted socket until it closes.
    pub fn spawn(ctx: Arc<ProxyContext>, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %error, "Could not disable Nagle on client socket");
        }
        if !ctx.config.proxy.accept_proxy_protocol {
            Self::serve(ctx, stream, peer, permit);
            return;
        }

        tokio::spawn(async move {
            let mut stream = stream;
            let wait = ctx.config.timeouts.idle();
            match tokio::time::timeout(wait, proxy_protocol::read_v1_header(&mut stream)).await {
                Ok(Ok(source)) => {
                    let client = source.unwrap_or(peer);
                    tracing::debug!(peer = %peer, client = %client, "Accepted PROXY protocol connection");
                    Self::serve(ctx, stream, client, permit);
                }
                Ok(Err(error)) => {
                    metrics::counter!("proxy_protocol_rejected_total").increment(1);
                    tracing::info!(peer = %peer, error = %error, "Dropping connection with invalid PROXY header");
                }
                Err(_) => {
                    metrics::counter!("proxy_protocol_rejected_total").increment(1);
                    tracing::info!(peer = %peer, "Timed out waiting for PROXY header");
                }
            }
        });
    }

    /// `peer` is the client's address, which differs from the socket's when a
    /// PROXY header named it.
    fn serve(ctx: Arc<ProxyContext>, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let client = Self::new(Arc::clone(&ctx), peer);
        let config = &ctx.config;
        let (transport, driver) = channel(
            Box::new(stream),
            Some(peer),
            HttpCodec::request_side(config.codec),
            IdleTimeouts::all(config.timeouts.idle()),
            config.flow,
            ctx.throttle.clone(),
            Arc::clone(&client),
        );
        client.engine.connected(transport);

        metrics::counter!("proxy_client_connections_total").increment(1);
        tracing::debug!(connection_id = %client.engine.id(), peer = %peer, "Client connected");
        for tracker in ctx.trackers() {
            tracker.client_connected(Some(peer));
        }

        let guard = ctx.tracker.track(client.engine.id());
        tokio::spawn(async move {
            driver.run().await;
            drop(permit);
            drop(guard);
        });
    }

    pub(crate) fn new(ctx: Arc<ProxyContext>, peer: SocketAddr) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine: ConnectionEngine::new(ConnectionId::new(Leg::Client), ConnectionState::Disconnected),
            ctx,
            this: this.clone(),
            peer,
            servers: DashMap::new(),
            current_server: Mutex::new(None),
            current_filters: Mutex::new(Arc::new(NoopFilters)),
            current_request: Mutex::new(None),
            connecting_servers: AtomicUsize::new(0),
            authenticated: AtomicBool::new(false),
            mitming: AtomicBool::new(false),
            flow_lock: Mutex::new(()),
        })
    }

    fn current_filters(&self) -> Arc<dyn HttpFilters> {
        Arc::clone(&lock(&self.current_filters))
    }

    fn current_server(&self) -> Option<Arc<ServerConnection>> {
        lock(&self.current_server).clone()
    }

    fn is_current_server(&self, server: &ServerConnection) -> bool {
        lock(&self.current_server)
            .as_ref()
            .is_some_and(|current| std::ptr::eq(current.as_ref(), server))
    }

    async fn read_request(&self, mut request: HttpRequest) -> ConnectionState {
        metrics::counter!("proxy_requests_total").increment(1);
        tracing::debug!(
            connection_id = %self.engine.id(),
            method = %request.method,
            uri = %request.uri,
            "Request received"
        );
        for tracker in self.ctx.trackers() {
            tracker.request_received_from_client(&request);
        }

        if !self.authenticate(&mut request) {
            return ConnectionState::AwaitingProxyAuthentication;
        }

        let original = Arc::new(request.clone());
        *lock(&self.current_request) = Some(Arc::clone(&original));
        let filters = self.ctx.filters_source.filter_request(&original);
        *lock(&self.current_filters) = Arc::clone(&filters);

        let mut object = HttpObject::Request(request);
        if let Some(response) = filters.client_to_proxy_request(&mut object) {
            return self.short_circuit_state(response);
        }
        let HttpObject::Request(mut request) = object else {
            tracing::debug!(connection_id = %self.engine.id(), "Filter replaced the request head, dropping");
            return ConnectionState::AwaitingInitial;
        };

        let mitming = self.mitming.load(Ordering::Acquire);
        if !mitming
            && !request.is_connect()
            && !is_absolute(&request.uri)
            && !self.ctx.config.proxy.allow_requests_to_origin_server
        {
            tracing::warn!(
                connection_id = %self.engine.id(),
                uri = %request.uri,
                "Request addressed to the proxy itself"
            );
            let response = responses::for_method(responses::bad_request(&request.uri), &request.method);
            return self.short_circuit_state(response);
        }

        let destination = self
            .identify_host_and_port(&request)
            .and_then(|host_and_port| Destination::parse(&host_and_port, request.is_connect()));
        let Some(destination) = destination else {
            tracing::warn!(connection_id = %self.engine.id(), uri = %request.uri, "No host and port found");
            let error = ProxyError::DestinationResolution(request.uri.clone());
            if let Some(response) = self.error_response(&error, Some(&request)) {
                self.respond_with_short_circuit(response);
            }
            self.engine.disconnect();
            return ConnectionState::DisconnectRequested;
        };

        let reusable = if mitming {
            self.current_server()
        } else if request.is_connect() {
            None
        } else {
            self.servers
                .get(&destination)
                .map(|entry| Arc::clone(entry.value()))
        };
        let server_host_and_port = destination.to_string();
        let server = match reusable {
            Some(server) => server,
            None => {
                let created = ServerConnection::create(
                    Arc::clone(&self.ctx),
                    self.this.clone(),
                    server_host_and_port.clone(),
                    Arc::clone(&filters),
                    &request,
                )
                .await;
                match created {
                    Ok(server) => {
                        self.servers.insert(destination, Arc::clone(&server));
                        server
                    }
                    Err(error) => {
                        tracing::info!(
                            connection_id = %self.engine.id(),
                            destination = %server_host_and_port,
                            error = %error,
                            "Unable to route request"
                        );
                        let response = self
                            .error_response(&error, Some(&original))
                            .unwrap_or_else(|| responses::bad_gateway(&original.uri));
                        let next = self.short_circuit_state(response);
                        self.engine.resume_reading();
                        return next;
                    }
                }
            }
        };
        *lock(&self.current_server) = Some(Arc::clone(&server));

        self.rewrite_request(&mut request, &server);

        let mut object = HttpObject::Request(request);
        if let Some(response) = filters.proxy_to_server_request(&mut object) {
            return self.short_circuit_state(response);
        }
        let HttpObject::Request(request) = object else {
            tracing::debug!(connection_id = %self.engine.id(), "Filter replaced the request head, dropping");
            return ConnectionState::AwaitingInitial;
        };

        let next = if request.is_connect() {
            ConnectionState::Connecting
        } else if request.is_chunked() {
            ConnectionState::AwaitingChunk
        } else {
            ConnectionState::AwaitingInitial
        };
        let pending = PendingExchange {
            request: original,
            filters,
        };
        server.write(request.into(), Some(pending)).await;
        self.pause_if_saturated(&server);
        next
    }

    /// Check Basic proxy credentials, answering 407 when they are missing or wrong.
    fn authenticate(&self, request: &mut HttpRequest) -> bool {
        let Some(authenticator) = &self.ctx.authenticator else {
            return true;
        };
        if self.authenticated.load(Ordering::Acquire) {
            return true;
        }

        let credentials = request
            .headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(decode_basic);
        if let Some((username, password)) = credentials {
            if authenticator.authenticate(&username, &password) {
                request.headers.remove(PROXY_AUTHORIZATION);
                self.authenticated.store(true, Ordering::Release);
                tracing::debug!(connection_id = %self.engine.id(), username = %username, "Proxy credentials accepted");
                return true;
            }
        }

        let error = ProxyError::AuthenticationRequired;
        tracing::debug!(connection_id = %self.engine.id(), error = %error, "Challenging client");
        if let Some(response) = self.error_response(&error, Some(request)) {
            metrics::counter!("proxy_synthesized_responses_total", "status" => "407").increment(1);
            self.engine.write(response);
        }
        false
    }

    fn identify_host_and_port(&self, request: &HttpRequest) -> Option<String> {
        self.ctx
            .chain_manager
            .as_ref()
            .and_then(|manager| manager.host_and_port(request))
            .or_else(|| headers::identify_host_and_port(request))
            .filter(|host_and_port| !host_and_port.trim().is_empty())
    }

    fn rewrite_request(&self, request: &mut HttpRequest, server: &ServerConnection) {
        // Origins expect origin-form; chained proxies need the absolute URI.
        if !request.is_connect() && !server.has_chained_proxy() {
            request.uri = strip_host(&request.uri);
        }
        if self.ctx.config.proxy.transparent {
            return;
        }
        switch_proxy_connection_header(&mut request.headers);
        strip_hop_by_hop_headers(&mut request.headers);
        add_via(&mut request.headers, request.version, &self.ctx.config.proxy.alias);
    }

    /// The response the client receives for `error`.
    fn error_response(&self, error: &ProxyError, request: Option<&HttpRequest>) -> Option<HttpResponse> {
        let response = match error.status()? {
            StatusCode::BAD_REQUEST => responses::malformed_request(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let realm = self
                    .ctx
                    .authenticator
                    .as_ref()
                    .map(|authenticator| authenticator.realm())
                    .unwrap_or("Restricted Files");
                responses::authentication_required(realm)
            }
            StatusCode::GATEWAY_TIMEOUT => responses::gateway_timeout(),
            _ => responses::bad_gateway(request.map(|r| r.uri.as_str()).unwrap_or("")),
        };
        Some(match request {
            Some(request) => responses::for_method(response, &request.method),
            None => response,
        })
    }

    /// Answer the client directly. Returns whether the connection stays open.
    fn respond_with_short_circuit(&self, response: HttpResponse) -> bool {
        *lock(&self.current_request) = None;
        let keep_alive = response.is_keep_alive();
        let status = response.status;
        metrics::counter!("proxy_synthesized_responses_total", "status" => status.as_u16().to_string())
            .increment(1);

        let Some(object) = self.current_filters().proxy_to_client_response(response.into()) else {
            self.engine.disconnect();
            return false;
        };
        let object = match object {
            HttpObject::Response(mut response)
                if status != StatusCode::BAD_GATEWAY && status != StatusCode::GATEWAY_TIMEOUT =>
            {
                let version = response.version;
                self.reflect_proxying(&mut response, version);
                if !keep_alive {
                    response.headers.insert(CONNECTION, HeaderValue::from_static("close"));
                }
                HttpObject::Response(response)
            }
            other => other,
        };
        self.engine.write(object);

        if !keep_alive {
            self.engine.disconnect();
            return false;
        }
        true
    }

    fn short_circuit_state(&self, response: HttpResponse) -> ConnectionState {
        if self.respond_with_short_circuit(response) {
            ConnectionState::AwaitingInitial
        } else {
            ConnectionState::DisconnectRequested
        }
    }

    /// `received` is the version the response arrived with, recorded in `Via`.
    fn reflect_proxying(&self, response: &mut HttpResponse, received: Version) {
        if self.ctx.config.proxy.transparent {
            return;
        }
        strip_hop_by_hop_headers(&mut response.headers);
        add_via(&mut response.headers, received, &self.ctx.config.proxy.alias);
        ensure_date(&mut response.headers);
    }

    /// Relay a response object from `server`, then apply the closing policy.
    pub(crate) fn respond(&self, server: &ServerConnection, exchange: &Exchange, object: HttpObject) {
        *lock(&self.current_request) = None;
        let filters = &exchange.filters;

        let Some(object) = filters.server_to_proxy_response(object) else {
            self.force_disconnect(server);
            return;
        };
        let object = match object {
            HttpObject::Response(mut response) => {
                let received = response.version;
                let delimited_by_close = ends_at_close(exchange);
                if delimited_by_close {
                    // HTTP/1.0 clients cannot parse chunked framing.
                    response.headers.remove(TRANSFER_ENCODING);
                } else if !answers_head(exchange)
                    && response.is_chunked()
                    && !is_self_terminating(&response.headers)
                {
                    // Without a length, the client could only find the end of
                    // the body by the connection closing.
                    mark_chunked(&mut response.headers);
                }
                if is_transfer_chunked(&response.headers) {
                    response.version = Version::HTTP_11;
                }
                self.reflect_proxying(&mut response, received);
                if delimited_by_close {
                    response.headers.insert(CONNECTION, HeaderValue::from_static("close"));
                }
                for tracker in self.ctx.trackers() {
                    tracker.response_sent_to_client(exchange.request.as_deref(), &response);
                }
                HttpObject::Response(response)
            }
            other => other,
        };
        let Some(object) = filters.proxy_to_client_response(object) else {
            self.force_disconnect(server);
            return;
        };

        let last = object.is_last();
        let written = self.engine.write(object);

        {
            let _guard = lock(&server.flow_lock);
            if self.engine.is_saturated() {
                tracing::debug!(connection_id = %self.engine.id(), "Client saturated, pausing upstream reads");
                server.engine().stop_reading();
            }
        }

        if exchange.response.status.is_informational() {
            return;
        }
        let request_keep_alive = !ends_at_close(exchange)
            && exchange
                .request
                .as_ref()
                .map_or(true, |request| request.is_keep_alive());
        let closing = Closing::decide(request_keep_alive, exchange.response.is_keep_alive(), last);
        if closing.server {
            tracing::debug!(connection_id = %server.engine().id(), "Closing upstream after response");
            server.engine().close_after(written);
        }
        if closing.client {
            tracing::debug!(connection_id = %self.engine.id(), "Closing client after response");
            self.engine.disconnect();
        }
    }

    /// Tunneled bytes from `server`.
    pub(crate) fn relay_from_server(&self, server: &ServerConnection, bytes: Bytes) {
        self.engine.write_raw(bytes);
        let _guard = lock(&server.flow_lock);
        if self.engine.is_saturated() {
            server.engine().stop_reading();
        }
    }

    fn force_disconnect(&self, server: &ServerConnection) {
        server.engine().disconnect();
        self.engine.disconnect();
    }

    fn pause_if_saturated(&self, server: &ServerConnection) {
        if server.engine().is_saturated() {
            tracing::debug!(connection_id = %self.engine.id(), "Upstream saturated, pausing client reads");
            self.engine.stop_reading();
        }
    }

    fn connection_established(&self) -> HttpResponse {
        let mut response = responses::connection_established();
        response
            .headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        response
            .headers
            .insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        add_via(&mut response.headers, response.version, &self.ctx.config.proxy.alias);
        response
    }

    /// A server dial began; client reads pause until it settles.
    pub(crate) fn server_connection_flow_started(&self) {
        self.engine.stop_reading();
        self.connecting_servers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn server_connection_succeeded(&self, server: &ServerConnection) {
        tracing::debug!(
            connection_id = %self.engine.id(),
            upstream = %server.server_host_and_port(),
            "Upstream ready"
        );
        self.resume_reading_if_necessary();
    }

    /// A dial attempt failed. Without a further hop, the client gets a 502.
    pub(crate) fn server_connection_failed(
        &self,
        server: &ServerConnection,
        original: &HttpRequest,
        error: &ProxyError,
        retrying: bool,
    ) {
        self.resume_reading_if_necessary();
        if retrying {
            tracing::debug!(connection_id = %self.engine.id(), error = %error, "Retrying with next hop");
            return;
        }

        tracing::info!(
            connection_id = %self.engine.id(),
            upstream = %server.server_host_and_port(),
            error = %error,
            "Upstream unavailable"
        );
        server.engine().disconnect();
        if let Some(destination) = Destination::parse(server.server_host_and_port(), false) {
            self.servers.remove_if(&destination, |_, candidate| {
                std::ptr::eq(candidate.as_ref(), server)
            });
        }

        let response = self
            .error_response(error, Some(original))
            .unwrap_or_else(|| responses::for_method(responses::bad_gateway(&original.uri), &original.method));
        if self.respond_with_short_circuit(response) && !self.engine.state().is_disconnecting() {
            self.engine.set_state(ConnectionState::AwaitingInitial);
        }
    }

    fn resume_reading_if_necessary(&self) {
        let previous = self
            .connecting_servers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or_else(|current| current);
        if previous <= 1 {
            self.engine.resume_reading();
        }
    }

    /// Answer a CONNECT and switch to relaying raw bytes.
    pub(crate) fn start_tunneling(&self) {
        self.engine.write(self.connection_established());
        self.engine.set_state(ConnectionState::Tunneling);
        tracing::debug!(connection_id = %self.engine.id(), "Tunnel established");
    }

    /// Answer a CONNECT, then terminate TLS with the client so the decrypted
    /// requests can be forwarded to `server`.
    pub(crate) fn start_mitm(&self, server: &ServerConnection) {
        let (Some(mitm), Some(transport)) = (self.ctx.mitm_manager.clone(), self.engine.transport()) else {
            return;
        };
        self.engine.stop_reading();
        self.engine.write(self.connection_established());

        let host = split_host_and_port(server.server_host_and_port(), 443)
            .map(|(host, _)| host)
            .unwrap_or_else(|| server.server_host_and_port().to_string());
        let upgrade: Upgrade = Box::new(move |io| mitm.client_tls(io, &host));
        let this = self.this.clone();
        transport.upgrade(upgrade).on_complete(move |result| {
            let Some(client) = this.upgrade() else {
                return;
            };
            match result {
                Ok(()) => {
                    client.mitming.store(true, Ordering::Release);
                    client.engine.set_state(ConnectionState::AwaitingInitial);
                    client.engine.resume_reading();
                    tracing::debug!(connection_id = %client.engine.id(), "Intercepting TLS");
                }
                Err(error) => {
                    tracing::warn!(connection_id = %client.engine.id(), error = %error, "Client TLS handshake failed");
                    client.engine.disconnect();
                }
            }
        });
    }

    pub(crate) fn server_disconnected(&self, server: &ServerConnection, departure: Departure) {
        match departure {
            Departure::ResponseTruncated => {
                tracing::debug!(connection_id = %self.engine.id(), "Upstream closed mid-response");
                self.engine.disconnect();
                return;
            }
            Departure::ResponseMissing(request) if !self.engine.state().is_disconnecting() => {
                let error = ProxyError::UpstreamProtocol(CodecError::UnexpectedEof);
                if let Some(response) = self.error_response(&error, request.as_deref()) {
                    self.respond_with_short_circuit(response);
                }
            }
            _ => {}
        }

        let relaying = self.engine.state() == ConnectionState::Tunneling || self.mitming.load(Ordering::Acquire);
        if relaying && self.is_current_server(server) {
            tracing::debug!(connection_id = %self.engine.id(), "Upstream of tunnel closed");
            self.engine.disconnect();
        }
    }

    /// `server` went idle; answer 504 if the client is still waiting on it.
    pub(crate) fn server_timed_out(&self, server: &ServerConnection, idle_for: Duration) {
        if !self.is_current_server(server) || !server.is_awaiting_response() || server.is_mid_response() {
            return;
        }
        let error = ProxyError::IdleTimeout(idle_for);
        tracing::warn!(
            connection_id = %self.engine.id(),
            upstream = %server.server_host_and_port(),
            error = %error,
            "Upstream timed out"
        );
        self.current_filters().server_to_proxy_response_timed_out();
        let request = server.oldest_pending_request();
        if let Some(response) = self.error_response(&error, request.as_deref()) {
            self.respond_with_short_circuit(response);
        }
    }

    pub(crate) fn server_became_writeable(&self) {
        let _guard = lock(&self.flow_lock);
        let saturated = self
            .servers
            .iter()
            .any(|entry| entry.value().engine().is_saturated());
        if !saturated && self.connecting_servers.load(Ordering::Acquire) == 0 {
            self.engine.resume_reading();
        }
    }
}

impl ConnectionHandler for ClientConnection {
    fn engine(&self) -> &ConnectionEngine {
        &self.engine
    }

    fn read_initial(&self, object: HttpObject) -> BoxFuture<'_, ConnectionState> {
        Box::pin(async move {
            match object {
                HttpObject::Request(request) => self.read_request(request).await,
                _ => {
                    tracing::debug!(connection_id = %self.engine.id(), "Ignoring non-request from client");
                    ConnectionState::AwaitingInitial
                }
            }
        })
    }

    fn read_chunk(&self, chunk: HttpChunk) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let filters = self.current_filters();
            let mut object = HttpObject::Chunk(chunk);
            filters.client_to_proxy_request(&mut object);
            filters.proxy_to_server_request(&mut object);

            let server = self.current_server();
            match server {
                Some(server) => {
                    server.write(object, None).await;
                    self.pause_if_saturated(&server);
                }
                None => tracing::debug!(connection_id = %self.engine.id(), "Chunk with no upstream, dropping"),
            }
        })
    }

    fn read_raw(&self, bytes: Bytes) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let server = self.current_server();
            if let Some(server) = server {
                server.write_raw(bytes);
                self.pause_if_saturated(&server);
            }
        })
    }

    fn disconnected(&self) {
        self.engine.disconnected();
        tracing::debug!(connection_id = %self.engine.id(), peer = %self.peer, "Client disconnected");

        for entry in self.servers.iter() {
            entry.value().engine().disconnect();
        }
        self.servers.clear();
        let current = lock(&self.current_server).take();
        if let Some(server) = current {
            server.engine().disconnect();
        }
        for tracker in self.ctx.trackers() {
            tracker.client_disconnected(Some(self.peer));
        }
    }

    fn became_writeable(&self) {
        let _guard = lock(&self.flow_lock);
        for entry in self.servers.iter() {
            let server = entry.value();
            let _server_guard = lock(&server.flow_lock);
            server.engine().resume_reading();
        }
    }

    fn timed_out(&self, idle_for: Duration) {
        let waiting = self
            .current_server()
            .is_some_and(|server| server.is_awaiting_response());
        if waiting {
            tracing::trace!(connection_id = %self.engine.id(), "Client idle while a response is pending");
            return;
        }
        tracing::debug!(
            connection_id = %self.engine.id(),
            error = %ProxyError::IdleTimeout(idle_for),
            "Closing idle client"
        );
        self.engine.disconnect();
    }

    fn decode_failed(&self, error: CodecError) {
        let error = ProxyError::ClientProtocol(error);
        tracing::debug!(connection_id = %self.engine.id(), peer = %self.peer, error = %error, "Could not parse request");
        let response = self
            .error_response(&error, None)
            .unwrap_or_else(responses::malformed_request);
        self.respond_with_short_circuit(response);
    }

    fn exception_caught(&self, error: &io::Error) {
        tracing::debug!(connection_id = %self.engine.id(), peer = %self.peer, error = %error, "Client transport error");
    }

    fn bytes_read(&self, count: usize) {
        for tracker in self.ctx.trackers() {
            tracker.bytes_received_from_client(count);
        }
    }
}

fn is_absolute(uri: &str) -> bool {
    let scheme = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    scheme.starts_with("http://") || scheme.starts_with("https://")
}

/// Whether the body end is signalled by the message itself.
fn answers_head(exchange: &Exchange) -> bool {
    exchange
        .request
        .as_ref()
        .is_some_and(|request| request.method == Method::HEAD)
}

/// Whether the body reaches an HTTP/1.0 client without a length, so only
/// closing the client leg can mark its end.
fn ends_at_close(exchange: &Exchange) -> bool {
    let Some(request) = exchange.request.as_ref() else {
        return false;
    };
    request.version < Version::HTTP_11
        && !answers_head(exchange)
        && exchange.response.is_chunked()
        && !exchange.response.headers.contains_key(CONTENT_LENGTH)
}

fn is_self_terminating(headers: &HeaderMap) -> bool {
    headers.contains_key(CONTENT_LENGTH) || is_transfer_chunked(headers)
}

fn mark_chunked(headers: &mut HeaderMap) {
    let value = match headers.get(TRANSFER_ENCODING).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, chunked", existing),
        _ => "chunked".to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(TRANSFER_ENCODING, value);
    }
}
