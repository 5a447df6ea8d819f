//! Proxy-to-upstream leg.
//!
//! # Responsibilities
//! - Resolve and dial the next hop, falling back through the hop list
//! - Negotiate with chained proxies (encryption, NTLM, CONNECT) before the
//!   transport is installed
//! - Pair each response with the oldest unanswered request (FIFO)
//! - Hand responses, chunks and tunneled bytes to the owning client leg
//!
//! # Connection Flow
//! ```text
//! write(request) while DISCONNECTED
//!     → CONNECTING: TCP connect (bounded by timeouts.connect)
//!     → HANDSHAKING: encrypt / NTLM / CONNECT via chained proxy / MITM TLS
//!     → AWAITING_INITIAL (or TUNNELING for a plain CONNECT)
//!     → initial request written, queued writers released
//!
//! on failure: next hop from the route, or 502 to the client
//! ```
//!
//! # Design Decisions
//! - Writes arriving while a dial is in progress wait on a watch flag, so they
//!   are written after the request that triggered the dial
//! - Handshakes run on the raw stream; the transport (and with it the codec
//!   used for relaying) only exists once the link is ready

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use http::header::{CONTENT_LENGTH, PROXY_AUTHORIZATION, TRANSFER_ENCODING};
use http::{HeaderValue, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::CodecConfig;
use crate::error::ProxyError;
use crate::http::headers::split_host_and_port;
use crate::http::{Body, CodecError, Frame, HttpChunk, HttpCodec, HttpObject, HttpRequest, HttpResponse};
use crate::net::connection::{ConnectionId, Leg};
use crate::proxy::auth::encode_basic;
use crate::proxy::chain::Hop;
use crate::proxy::client::ClientConnection;
use crate::proxy::engine::{ConnectionEngine, ConnectionHandler};
use crate::proxy::filters::HttpFilters;
use crate::proxy::ntlm::{NtlmError, NtlmHandshake, NtlmProvider};
use crate::proxy::state::ConnectionState;
use crate::proxy::transport::{channel, BoxedIo, IdleTimeouts};
use crate::proxy::ProxyContext;

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_TLS_PORT: u16 = 443;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request written upstream that has not been answered yet.
#[derive(Clone)]
pub(crate) struct PendingExchange {
    /// The request as the client sent it, before rewriting.
    pub(crate) request: Arc<HttpRequest>,
    pub(crate) filters: Arc<dyn HttpFilters>,
}

/// The response being relayed and the request it answers.
pub(crate) struct Exchange {
    pub(crate) request: Option<Arc<HttpRequest>>,
    pub(crate) response: HttpResponse,
    pub(crate) filters: Arc<dyn HttpFilters>,
}

/// What was outstanding when the upstream went away.
#[derive(Debug)]
pub(crate) enum Departure {
    Idle,
    /// A request was written but no response head arrived.
    ResponseMissing(Option<Arc<HttpRequest>>),
    /// The connection closed inside a response body.
    ResponseTruncated,
}

struct Route {
    hop: Hop,
    remaining: VecDeque<Hop>,
    address: SocketAddr,
}

/// Connection from the proxy to an origin server or chained proxy.
pub struct ServerConnection {
    engine: ConnectionEngine,
    ctx: Arc<ProxyContext>,
    client: Weak<ClientConnection>,
    server_host_and_port: String,
    route: Mutex<Route>,
    filters: Mutex<Arc<dyn HttpFilters>>,
    pairing: Mutex<VecDeque<PendingExchange>>,
    exchange: Mutex<Option<Arc<Exchange>>>,
    /// True while a dial is in progress.
    dialing: watch::Sender<bool>,
    awaiting_response: AtomicBool,
    mid_response: AtomicBool,
    /// Serializes read-side flow-control changes between the two legs.
    pub(crate) flow_lock: Mutex<()>,
}

impl ServerConnection {
    /// Pick the route for `server_host_and_port` and resolve its first hop.
    ///
    /// Nothing is dialed until the first request is written.
    pub(crate) async fn create(
        ctx: Arc<ProxyContext>,
        client: Weak<ClientConnection>,
        server_host_and_port: String,
        filters: Arc<dyn HttpFilters>,
        request: &HttpRequest,
    ) -> Result<Arc<Self>, ProxyError> {
        let mut hops = VecDeque::new();
        match &ctx.chain_manager {
            Some(manager) => manager.lookup_chained_proxies(request, &mut hops),
            None => hops.push_back(Hop::Direct),
        }
        let route = next_route(&ctx, &mut hops, &server_host_and_port, request.is_connect()).await?;
        let (dialing, _) = watch::channel(false);

        tracing::debug!(
            upstream = %server_host_and_port,
            hop = ?route.hop,
            address = %route.address,
            "Created upstream connection"
        );

        Ok(Arc::new(Self {
            engine: ConnectionEngine::new(ConnectionId::new(Leg::Server), ConnectionState::Disconnected),
            ctx,
            client,
            server_host_and_port,
            route: Mutex::new(route),
            filters: Mutex::new(filters),
            pairing: Mutex::new(VecDeque::new()),
            exchange: Mutex::new(None),
            dialing,
            awaiting_response: AtomicBool::new(false),
            mid_response: AtomicBool::new(false),
            flow_lock: Mutex::new(()),
        }))
    }

    /// Destination this connection was created for.
    pub fn server_host_and_port(&self) -> &str {
        &self.server_host_and_port
    }

    pub(crate) fn has_chained_proxy(&self) -> bool {
        !lock(&self.route).hop.is_direct()
    }

    /// Whether a request was written whose response has not completed.
    pub(crate) fn is_awaiting_response(&self) -> bool {
        self.awaiting_response.load(Ordering::Acquire)
    }

    /// Whether a response head was relayed and its body is still arriving.
    pub(crate) fn is_mid_response(&self) -> bool {
        self.mid_response.load(Ordering::Acquire)
    }

    pub(crate) fn oldest_pending_request(&self) -> Option<Arc<HttpRequest>> {
        lock(&self.pairing).front().map(|pending| Arc::clone(&pending.request))
    }

    fn client(&self) -> Option<Arc<ClientConnection>> {
        self.client.upgrade()
    }

    fn current_hop(&self) -> Hop {
        lock(&self.route).hop.clone()
    }

    fn current_filters(&self) -> Arc<dyn HttpFilters> {
        Arc::clone(&lock(&self.filters))
    }

    /// Forward an object from the client.
    ///
    /// A request on a disconnected leg starts a dial. Anything written while a
    /// dial is in progress waits for it (the client's driver is parked on this
    /// call meanwhile) and is dropped if the dial failed.
    pub(crate) async fn write(self: &Arc<Self>, object: HttpObject, pending: Option<PendingExchange>) {
        let state = self.engine.state();
        if state.is_disconnecting() {
            match object {
                HttpObject::Request(request) => self.connect_and_write(request, pending),
                _ => tracing::debug!(
                    connection_id = %self.engine.id(),
                    "Discarding body written to a disconnected upstream"
                ),
            }
            return;
        }

        if state.is_part_of_connect_flow() {
            let mut dialing = self.dialing.subscribe();
            let wait = self.ctx.config.timeouts.connect_wait();
            let finished = tokio::time::timeout(wait, dialing.wait_for(|in_progress| !*in_progress))
                .await
                .map(|result| result.is_ok())
                .unwrap_or(false);
            if !finished {
                tracing::warn!(
                    connection_id = %self.engine.id(),
                    upstream = %self.server_host_and_port,
                    "Gave up waiting for upstream connection"
                );
            }

            let state = self.engine.state();
            if state.is_part_of_connect_flow() || state.is_disconnecting() {
                tracing::debug!(
                    connection_id = %self.engine.id(),
                    state = %state,
                    "Upstream not connected, discarding write"
                );
                return;
            }
        }

        self.do_write(object, pending);
    }

    /// Relay tunneled bytes from the client.
    pub(crate) fn write_raw(&self, bytes: Bytes) {
        self.engine.write_raw(bytes);
    }

    fn do_write(&self, object: HttpObject, pending: Option<PendingExchange>) {
        let object = match object {
            HttpObject::Request(mut request) => {
                prepare_for_hop(&self.current_hop(), &mut request);
                for tracker in self.ctx.trackers() {
                    tracker.request_sent_to_server(&self.server_host_and_port, &request);
                }
                if let Some(pending) = pending {
                    *lock(&self.filters) = Arc::clone(&pending.filters);
                    lock(&self.pairing).push_back(pending);
                }
                self.awaiting_response.store(true, Ordering::Release);
                HttpObject::Request(request)
            }
            other => other,
        };
        self.engine.write(object);
    }

    fn connect_and_write(self: &Arc<Self>, request: HttpRequest, pending: Option<PendingExchange>) {
        tracing::info!(
            connection_id = %self.engine.id(),
            upstream = %self.server_host_and_port,
            hop = ?self.current_hop(),
            "Connecting to upstream"
        );

        if let Some(pending) = &pending {
            *lock(&self.filters) = Arc::clone(&pending.filters);
        }
        lock(&self.pairing).clear();
        *lock(&self.exchange) = None;
        self.awaiting_response.store(false, Ordering::Release);
        self.mid_response.store(false, Ordering::Release);

        self.dialing.send_replace(true);
        self.engine.set_state(ConnectionState::Connecting);
        if let Some(client) = self.client() {
            client.server_connection_flow_started();
        }
        self.current_filters().proxy_to_server_connection_started();

        let server = Arc::clone(self);
        tokio::spawn(async move { server.dial(request, pending).await });
    }

    async fn dial(self: Arc<Self>, request: HttpRequest, pending: Option<PendingExchange>) {
        loop {
            let (hop, address) = {
                let route = lock(&self.route);
                (route.hop.clone(), route.address)
            };
            self.engine.set_state(ConnectionState::Connecting);

            let mut attempt = request.clone();
            let error = match self.establish(&hop, address, &mut attempt).await {
                Ok(io) => {
                    self.finish_connect(hop, address, io, attempt, pending);
                    return;
                }
                Err(error) => error,
            };

            metrics::counter!("proxy_dial_failures_total").increment(1);
            tracing::warn!(
                connection_id = %self.engine.id(),
                upstream = %self.server_host_and_port,
                hop = ?hop,
                address = %address,
                error = %error,
                "Failed to connect upstream"
            );
            if let Some(proxy) = hop.as_proxy() {
                proxy.connection_failed(&error);
            }

            let retrying = self.advance_route(request.is_connect()).await;
            if !retrying {
                self.current_filters().proxy_to_server_connection_failed();
                self.engine.set_state(ConnectionState::Disconnected);
                self.dialing.send_replace(false);
            }

            let original = pending
                .as_ref()
                .map(|pending| Arc::clone(&pending.request))
                .unwrap_or_else(|| Arc::new(request.clone()));
            let Some(client) = self.client() else {
                return;
            };
            client.server_connection_failed(&self, &original, &error, retrying);
            if !retrying {
                return;
            }
            client.server_connection_flow_started();
        }
    }

    async fn establish(
        &self,
        hop: &Hop,
        address: SocketAddr,
        request: &mut HttpRequest,
    ) -> Result<BoxedIo, ProxyError> {
        let connect_error = |source| ProxyError::UpstreamConnect {
            address: address.to_string(),
            source,
        };
        let stream = match tokio::time::timeout(
            self.ctx.config.timeouts.connect(),
            TcpStream::connect(address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(connect_error(error)),
            Err(_) => {
                return Err(connect_error(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(error = %error, "Could not disable Nagle on upstream socket");
        }

        let mut io: BoxedIo = Box::new(stream);
        let limits = self.ctx.config.codec;

        if let Some(proxy) = hop.as_proxy() {
            if proxy.requires_encryption() {
                self.engine.set_state(ConnectionState::Handshaking);
                io = proxy.encrypt(io).await?;
            }
            if let Some(provider) = proxy.ntlm_provider() {
                self.engine.set_state(ConnectionState::Handshaking);
                ntlm_preflight(&mut io, limits, provider, request).await?;
            }
            if request.is_connect() {
                self.engine.set_state(ConnectionState::Handshaking);
                prepare_for_hop(hop, request);
                let response = exchange_head(&mut io, limits, request).await?;
                if !response.status.is_success() {
                    return Err(ProxyError::UpstreamRefused(response.status));
                }
            }
        }

        if request.is_connect() {
            if let Some(mitm) = &self.ctx.mitm_manager {
                self.engine.set_state(ConnectionState::Handshaking);
                let host = split_host_and_port(&self.server_host_and_port, DEFAULT_TLS_PORT)
                    .map(|(host, _)| host)
                    .unwrap_or_else(|| self.server_host_and_port.clone());
                io = mitm.server_tls(io, &host).await?;
            }
        }

        Ok(io)
    }

    fn finish_connect(
        self: &Arc<Self>,
        hop: Hop,
        address: SocketAddr,
        io: BoxedIo,
        request: HttpRequest,
        pending: Option<PendingExchange>,
    ) {
        let config = &self.ctx.config;
        let idle = idle_timeouts_for(&request.method, config.timeouts.idle());
        let (transport, driver) = channel(
            io,
            Some(address),
            HttpCodec::response_side(config.codec),
            idle,
            config.flow,
            self.ctx.throttle.clone(),
            Arc::clone(self),
        );
        self.engine.connected(transport);

        metrics::counter!("proxy_server_connections_total").increment(1);
        tracing::info!(
            connection_id = %self.engine.id(),
            upstream = %self.server_host_and_port,
            address = %address,
            "Connected to upstream"
        );
        if let Some(proxy) = hop.as_proxy() {
            proxy.connection_succeeded();
        }

        let client = self.client();
        if request.is_connect() {
            let mitm = self.ctx.mitm_manager.is_some();
            if !mitm {
                self.engine.set_state(ConnectionState::Tunneling);
            }
            self.dialing.send_replace(false);
            if let Some(client) = &client {
                if mitm {
                    client.start_mitm(self);
                } else {
                    client.start_tunneling();
                }
                client.server_connection_succeeded(self);
            }
        } else {
            self.do_write(HttpObject::Request(request), pending);
            self.dialing.send_replace(false);
            if let Some(client) = &client {
                client.server_connection_succeeded(self);
            }
        }
        self.current_filters().proxy_to_server_connection_succeeded();

        let guard = self.ctx.tracker.track(self.engine.id());
        tokio::spawn(async move {
            driver.run().await;
            drop(guard);
        });
    }

    /// Move on to the next resolvable hop, if any remain.
    async fn advance_route(&self, is_connect: bool) -> bool {
        let mut remaining = std::mem::take(&mut lock(&self.route).remaining);
        match next_route(&self.ctx, &mut remaining, &self.server_host_and_port, is_connect).await {
            Ok(route) => {
                tracing::debug!(
                    connection_id = %self.engine.id(),
                    hop = ?route.hop,
                    "Falling back to next hop"
                );
                *lock(&self.route) = route;
                true
            }
            Err(_) => false,
        }
    }

    fn read_response(&self, response: HttpResponse) -> ConnectionState {
        for tracker in self.ctx.trackers() {
            tracker.response_received_from_server(&self.server_host_and_port, &response);
        }
        let client = self.client();

        if response.status.is_informational() && response.status != StatusCode::SWITCHING_PROTOCOLS {
            // Interim response: the final one still answers the same request.
            let exchange = Exchange {
                request: self.oldest_pending_request(),
                response: response.snapshot(),
                filters: self.current_filters(),
            };
            if let Some(client) = &client {
                client.respond(self, &exchange, response.into());
            }
            return ConnectionState::AwaitingInitial;
        }

        let pending = lock(&self.pairing).pop_front();
        let (request, filters) = match pending {
            Some(pending) => (Some(pending.request), pending.filters),
            None => {
                tracing::debug!(
                    connection_id = %self.engine.id(),
                    status = %response.status,
                    "Response arrived with no pending request"
                );
                (None, self.current_filters())
            }
        };

        let chunked = response.is_chunked();
        let upgrading = response.status == StatusCode::SWITCHING_PROTOCOLS;
        self.mid_response.store(chunked, Ordering::Release);
        if !chunked {
            self.awaiting_response
                .store(!lock(&self.pairing).is_empty(), Ordering::Release);
        }

        let exchange = Arc::new(Exchange {
            request,
            response: response.snapshot(),
            filters,
        });
        *lock(&self.exchange) = Some(Arc::clone(&exchange));

        if let Some(client) = &client {
            client.respond(self, &exchange, response.into());
        }

        if upgrading {
            tracing::debug!(connection_id = %self.engine.id(), "Protocol switched, tunneling");
            if let Some(client) = &client {
                client.engine().set_state(ConnectionState::Tunneling);
            }
            return ConnectionState::Tunneling;
        }
        if chunked {
            ConnectionState::AwaitingChunk
        } else {
            ConnectionState::AwaitingInitial
        }
    }

    fn take_departure(&self) -> Departure {
        let truncated = self.mid_response.swap(false, Ordering::AcqRel);
        let awaiting = self.awaiting_response.swap(false, Ordering::AcqRel);
        let request = {
            let mut pairing = lock(&self.pairing);
            let oldest = pairing.front().map(|pending| Arc::clone(&pending.request));
            pairing.clear();
            oldest
        };
        *lock(&self.exchange) = None;

        if truncated {
            Departure::ResponseTruncated
        } else if awaiting {
            Departure::ResponseMissing(request)
        } else {
            Departure::Idle
        }
    }
}

impl ConnectionHandler for ServerConnection {
    fn engine(&self) -> &ConnectionEngine {
        &self.engine
    }

    fn read_initial(&self, object: HttpObject) -> BoxFuture<'_, ConnectionState> {
        Box::pin(async move {
            match object {
                HttpObject::Response(response) => self.read_response(response),
                _ => {
                    tracing::debug!(connection_id = %self.engine.id(), "Ignoring non-response from upstream");
                    ConnectionState::AwaitingInitial
                }
            }
        })
    }

    fn read_chunk(&self, chunk: HttpChunk) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let exchange = lock(&self.exchange).clone();
            if chunk.last {
                self.mid_response.store(false, Ordering::Release);
                self.awaiting_response
                    .store(!lock(&self.pairing).is_empty(), Ordering::Release);
            }
            match (exchange, self.client()) {
                (Some(exchange), Some(client)) => client.respond(self, &exchange, chunk.into()),
                _ => tracing::trace!(connection_id = %self.engine.id(), "Dropping unattributed chunk"),
            }
        })
    }

    fn read_raw(&self, bytes: Bytes) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(client) = self.client() {
                client.relay_from_server(self, bytes);
            }
        })
    }

    fn disconnected(&self) {
        if self.engine.state().is_part_of_connect_flow() {
            // A replacement connection is already being dialed.
            tracing::trace!(connection_id = %self.engine.id(), "Previous upstream link closed");
            return;
        }
        self.engine.disconnected();
        tracing::debug!(
            connection_id = %self.engine.id(),
            upstream = %self.server_host_and_port,
            "Upstream disconnected"
        );
        if let Some(proxy) = self.current_hop().as_proxy() {
            proxy.disconnected();
        }
        let departure = self.take_departure();
        if let Some(client) = self.client() {
            client.server_disconnected(self, departure);
        }
    }

    fn became_writeable(&self) {
        if let Some(client) = self.client() {
            client.server_became_writeable();
        }
    }

    fn timed_out(&self, idle_for: Duration) {
        if let Some(client) = self.client() {
            client.server_timed_out(self, idle_for);
        }
        self.awaiting_response.store(false, Ordering::Release);
        self.engine.disconnect();
    }

    fn decode_failed(&self, error: CodecError) {
        let error = ProxyError::UpstreamProtocol(error);
        tracing::warn!(
            connection_id = %self.engine.id(),
            upstream = %self.server_host_and_port,
            error = %error,
            "Malformed response from upstream"
        );
        self.engine.disconnect();
    }

    fn bytes_read(&self, count: usize) {
        for tracker in self.ctx.trackers() {
            tracker.bytes_received_from_server(count);
        }
    }
}

/// Pop hops until one resolves.
async fn next_route(
    ctx: &ProxyContext,
    hops: &mut VecDeque<Hop>,
    server_host_and_port: &str,
    is_connect: bool,
) -> Result<Route, ProxyError> {
    let mut failure = ProxyError::DestinationResolution(server_host_and_port.to_string());
    while let Some(hop) = hops.pop_front() {
        match resolve_hop(ctx, &hop, server_host_and_port, is_connect).await {
            Ok(address) => {
                return Ok(Route {
                    hop,
                    remaining: std::mem::take(hops),
                    address,
                })
            }
            Err(error) => {
                tracing::debug!(hop = ?hop, error = %error, "Skipping unresolvable hop");
                failure = error;
            }
        }
    }
    Err(failure)
}

async fn resolve_hop(
    ctx: &ProxyContext,
    hop: &Hop,
    server_host_and_port: &str,
    is_connect: bool,
) -> Result<SocketAddr, ProxyError> {
    let (target, default_port) = match hop {
        Hop::Direct if is_connect => (server_host_and_port, DEFAULT_TLS_PORT),
        Hop::Direct => (server_host_and_port, DEFAULT_HTTP_PORT),
        Hop::Proxy(proxy) => (proxy.address(), DEFAULT_HTTP_PORT),
    };
    let (host, port) = split_host_and_port(target, default_port)
        .ok_or_else(|| ProxyError::DestinationResolution(target.to_string()))?;
    ctx.resolver.resolve(&host, port).await.map_err(|error| {
        tracing::debug!(host = %host, port, error = %error, "Resolution failed");
        ProxyError::DestinationResolution(target.to_string())
    })
}

/// Apply a chained hop's request filter and Basic credentials.
fn prepare_for_hop(hop: &Hop, request: &mut HttpRequest) {
    let Some(proxy) = hop.as_proxy() else {
        return;
    };
    proxy.filter_request(request);
    if let Some((username, password)) = proxy.credentials() {
        if let Ok(value) = HeaderValue::from_str(&encode_basic(username, password)) {
            request.headers.insert(PROXY_AUTHORIZATION, value);
        }
    }
}

/// CONNECT tunnels never idle out; uploads bound the write side, everything
/// else the read side.
fn idle_timeouts_for(method: &Method, idle: Duration) -> IdleTimeouts {
    if method == Method::CONNECT {
        IdleTimeouts::none()
    } else if method == Method::POST || method == Method::PUT {
        IdleTimeouts {
            write: Some(idle),
            ..IdleTimeouts::none()
        }
    } else {
        IdleTimeouts {
            read: Some(idle),
            ..IdleTimeouts::none()
        }
    }
}

/// Obtain the NTLM challenge with a bodiless copy of `request`, then stamp
/// the final authentication message onto `request` itself.
async fn ntlm_preflight(
    io: &mut BoxedIo,
    limits: CodecConfig,
    provider: &dyn NtlmProvider,
    request: &mut HttpRequest,
) -> Result<(), ProxyError> {
    let mut handshake = NtlmHandshake::new(provider);

    let mut negotiation = HttpRequest {
        method: request.method.clone(),
        uri: request.uri.clone(),
        version: request.version,
        headers: request.headers.clone(),
        body: Body::empty(),
    };
    negotiation.headers.remove(TRANSFER_ENCODING);
    if !negotiation.is_connect() {
        negotiation.headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
    }
    handshake.write_type1(&mut negotiation.headers)?;

    let challenge = exchange_head(io, limits, &negotiation).await.map_err(|error| match error {
        ProxyError::Io(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            ProxyError::Ntlm(NtlmError::ProxyConnectionClosed)
        }
        other => other,
    })?;
    handshake.read_type2(&challenge)?;
    handshake.write_type3(&mut request.headers)?;
    Ok(())
}

/// Write `request` and read back the final response head, draining any body
/// so the stream is positioned at the next message.
async fn exchange_head(
    io: &mut BoxedIo,
    limits: CodecConfig,
    request: &HttpRequest,
) -> Result<HttpResponse, ProxyError> {
    let mut codec = HttpCodec::response_side(limits);
    let mut out = BytesMut::new();
    codec.encode(Frame::Http(HttpObject::Request(request.clone())), &mut out);
    io.write_all(&out).await?;
    io.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    let mut head: Option<HttpResponse> = None;
    loop {
        while let Some(object) = codec.decode(&mut buf).map_err(ProxyError::UpstreamProtocol)? {
            match object {
                HttpObject::Response(response) if response.status.is_informational() => {}
                HttpObject::Response(response) if !response.is_chunked() => return Ok(response),
                HttpObject::Response(response) => head = Some(response),
                HttpObject::Chunk(chunk) if chunk.last => {
                    if let Some(response) = head.take() {
                        return Ok(response);
                    }
                }
                _ => {}
            }
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before responding",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::proxy::engine::Inbound;
    use crate::proxy::filters::NoopFilters;
    use crate::proxy::resolver::testing::FixedResolver;
    use crate::proxy::transport::testing::RecordingTransport;
    use http::header::CONNECTION;
    use tokio::net::TcpListener;

    fn context(resolve_to: SocketAddr) -> Arc<ProxyContext> {
        let mut ctx = ProxyContext::new(ProxyConfig::default());
        ctx.resolver = Arc::new(FixedResolver(resolve_to));
        Arc::new(ctx)
    }

    fn pending(request: &HttpRequest) -> Option<PendingExchange> {
        Some(PendingExchange {
            request: Arc::new(request.clone()),
            filters: Arc::new(NoopFilters),
        })
    }

    async fn pair(ctx: Arc<ProxyContext>) -> (Arc<ClientConnection>, Arc<RecordingTransport>, Arc<ServerConnection>) {
        let client = ClientConnection::new(Arc::clone(&ctx), "127.0.0.1:50000".parse().unwrap());
        let client_transport = RecordingTransport::new();
        client.engine().connected(client_transport.clone());
        let request = HttpRequest::new(Method::GET, "http://origin.test/");
        let server = ServerConnection::create(
            ctx,
            Arc::downgrade(&client),
            "origin.test".into(),
            Arc::new(NoopFilters),
            &request,
        )
        .await
        .unwrap();
        (client, client_transport, server)
    }

    fn client_statuses(transport: &RecordingTransport) -> Vec<StatusCode> {
        transport
            .writes()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Http(HttpObject::Response(response)) => Some(response.status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn pipelined_responses_pair_with_requests_in_order() {
        let (_client, client_transport, server) = pair(context("127.0.0.1:9".parse().unwrap())).await;
        let upstream = RecordingTransport::new();
        server.engine().connected(upstream.clone());

        let first = HttpRequest::new(Method::GET, "/first");
        let mut second = HttpRequest::new(Method::GET, "/second");
        second.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        server.write(first.clone().into(), pending(&first)).await;
        server.write(second.clone().into(), pending(&second)).await;
        assert_eq!(upstream.writes().len(), 2);
        assert!(server.is_awaiting_response());

        let response = HttpResponse::full(StatusCode::OK, "one");
        server.engine().read(server.as_ref(), Inbound::Http(response.into())).await;
        assert!(!client_transport.is_closed());
        assert!(server.is_awaiting_response());

        let response = HttpResponse::full(StatusCode::OK, "two");
        server.engine().read(server.as_ref(), Inbound::Http(response.into())).await;
        assert!(!server.is_awaiting_response());
        // The second request asked to close, so both legs go.
        assert!(client_transport.is_closed());
        assert!(upstream.is_closed());
        assert_eq!(client_statuses(&client_transport), vec![StatusCode::OK, StatusCode::OK]);
    }

    #[tokio::test]
    async fn writes_during_dial_follow_the_initial_request() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, _client_transport, server) = pair(context(origin.local_addr().unwrap())).await;

        let first = HttpRequest::new(Method::GET, "/first");
        let second = HttpRequest::new(Method::GET, "/second");
        server.write(first.clone().into(), pending(&first)).await;
        assert_eq!(server.engine().state(), ConnectionState::Connecting);
        server.write(second.clone().into(), pending(&second)).await;

        let (mut socket, _) = origin.accept().await.unwrap();
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !String::from_utf8_lossy(&received).contains("/second") {
                let mut buf = [0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "upstream closed early");
                received.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .unwrap();

        let text = String::from_utf8_lossy(&received);
        let first_at = text.find("GET /first").unwrap();
        let second_at = text.find("GET /second").unwrap();
        assert!(first_at < second_at);
    }

    #[tokio::test]
    async fn failed_dial_answers_bad_gateway() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = closed.local_addr().unwrap();
        drop(closed);

        let (_client, client_transport, server) = pair(context(address)).await;
        let request = HttpRequest::new(Method::GET, "http://origin.test/");
        server.write(request.clone().into(), pending(&request)).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while client_statuses(&client_transport).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(client_statuses(&client_transport), vec![StatusCode::BAD_GATEWAY]);
        assert_eq!(server.engine().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn idle_bounds_depend_on_method() {
        let idle = Duration::from_secs(70);
        assert_eq!(idle_timeouts_for(&Method::CONNECT, idle), IdleTimeouts::none());
        assert_eq!(idle_timeouts_for(&Method::POST, idle).write, Some(idle));
        assert_eq!(idle_timeouts_for(&Method::GET, idle).read, Some(idle));
    }
}
