//! State-driven message dispatch shared by both connection legs.
//!
//! # Responsibilities
//! - Route inbound objects by [`ConnectionState`] to a [`ConnectionHandler`]
//! - Own the transport handle and the write path
//! - Provide flow-control and disconnect primitives
//!
//! # Dispatch
//! ```text
//! AWAITING_INITIAL               head   → read_initial → next state
//! AWAITING_CHUNK                 chunk  → read_chunk   → AWAITING_INITIAL on last
//! TUNNELING                      bytes  → read_raw
//! AWAITING_PROXY_AUTHENTICATION  request → read_initial, anything else dropped
//! CONNECTING / HANDSHAKING       warn and drop
//! DISCONNECT_REQUESTED / DISCONNECTED    drop
//! ```
//!
//! # Design Decisions
//! - Client and server legs compose a [`ConnectionEngine`] instead of sharing
//!   a base type; the leg-specific behavior lives behind [`ConnectionHandler`]
//! - The state returned by `read_initial` is applied with a compare-and-set so
//!   a transition made concurrently (e.g. a tunnel opened by a finished dial)
//!   is never overwritten

use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::http::{CodecError, Frame, HttpChunk, HttpObject};
use crate::net::connection::ConnectionId;
use crate::proxy::state::{ConnectionState, StateCell};
use crate::proxy::transport::{Transport, WriteFuture};

/// Something delivered by the transport.
#[derive(Debug)]
pub enum Inbound {
    Http(HttpObject),
    Raw(Bytes),
}

/// Leg-specific behavior plugged into the engine.
///
/// Read callbacks and lifecycle hooks run on the connection's driver task.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn engine(&self) -> &ConnectionEngine;

    /// Handle the head of a new message and return the next state.
    fn read_initial(&self, object: HttpObject) -> BoxFuture<'_, ConnectionState>;

    fn read_chunk(&self, chunk: HttpChunk) -> BoxFuture<'_, ()>;

    fn read_raw(&self, bytes: Bytes) -> BoxFuture<'_, ()>;

    /// The transport closed.
    fn disconnected(&self) {
        self.engine().disconnected();
    }

    /// Queued output drained below the low watermark.
    fn became_writeable(&self) {}

    fn timed_out(&self, idle_for: Duration) {
        tracing::debug!(
            connection_id = %self.engine().id(),
            idle_secs = idle_for.as_secs(),
            "Idle timeout"
        );
        self.engine().disconnect();
    }

    fn decode_failed(&self, error: CodecError) {
        tracing::warn!(connection_id = %self.engine().id(), error = %error, "Undecodable input");
        self.engine().disconnect();
    }

    fn exception_caught(&self, error: &io::Error) {
        tracing::debug!(connection_id = %self.engine().id(), error = %error, "Transport error");
    }

    fn bytes_read(&self, _count: usize) {}
}

/// State, transport and write path of one connection.
pub struct ConnectionEngine {
    id: ConnectionId,
    state: StateCell,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl ConnectionEngine {
    pub fn new(id: ConnectionId, initial: ConnectionState) -> Self {
        Self {
            id,
            state: StateCell::new(initial),
            transport: RwLock::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.set(state);
        if previous != state {
            tracing::trace!(connection_id = %self.id, from = %previous, to = %state, "State change");
        }
    }

    /// Apply `new` only if the state is still `expected`.
    pub fn transition(&self, expected: ConnectionState, new: ConnectionState) -> bool {
        let applied = self.state.transition(expected, new);
        if applied && expected != new {
            tracing::trace!(connection_id = %self.id, from = %expected, to = %new, "State change");
        }
        applied
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().ok().and_then(|t| t.clone())
    }

    pub fn is_current_transport(&self, transport_id: u64) -> bool {
        self.transport()
            .map(|t| t.id() == transport_id)
            .unwrap_or(false)
    }

    /// Record the transport and start awaiting the first message.
    pub fn connected(&self, transport: Arc<dyn Transport>) {
        if let Ok(mut slot) = self.transport.write() {
            *slot = Some(transport);
        }
        self.set_state(ConnectionState::AwaitingInitial);
    }

    pub fn disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    /// Dispatch an inbound object according to the current state.
    pub async fn read<H: ConnectionHandler + ?Sized>(&self, handler: &H, inbound: Inbound) {
        let state = self.state();
        match (state, inbound) {
            (ConnectionState::AwaitingInitial, Inbound::Http(object))
                if !matches!(object, HttpObject::Chunk(_)) =>
            {
                self.read_initial(handler, object).await;
            }
            (ConnectionState::AwaitingChunk, Inbound::Http(HttpObject::Chunk(chunk))) => {
                let last = chunk.last;
                handler.read_chunk(chunk).await;
                if last {
                    self.transition(ConnectionState::AwaitingChunk, ConnectionState::AwaitingInitial);
                }
            }
            (ConnectionState::Tunneling, Inbound::Raw(bytes)) => handler.read_raw(bytes).await,
            (ConnectionState::AwaitingProxyAuthentication, Inbound::Http(object @ HttpObject::Request(_))) => {
                self.read_initial(handler, object).await;
            }
            (ConnectionState::AwaitingProxyAuthentication, _) => {
                tracing::trace!(
                    connection_id = %self.id,
                    "Discarding message received while awaiting proxy authentication"
                );
            }
            (ConnectionState::Connecting | ConnectionState::Handshaking, _) => {
                tracing::warn!(
                    connection_id = %self.id,
                    state = %state,
                    "Read while connecting, dropping"
                );
            }
            (ConnectionState::DisconnectRequested | ConnectionState::Disconnected, _) => {}
            (state, inbound) => {
                tracing::debug!(
                    connection_id = %self.id,
                    state = %state,
                    inbound = inbound_kind(&inbound),
                    "Dropping unexpected inbound object"
                );
            }
        }
    }

    async fn read_initial<H: ConnectionHandler + ?Sized>(&self, handler: &H, object: HttpObject) {
        let before = self.state();
        let next = handler.read_initial(object).await;
        if !self.transition(before, next) {
            tracing::trace!(
                connection_id = %self.id,
                state = %self.state(),
                ignored = %next,
                "State changed while handling message head"
            );
        }
    }

    /// Write an HTTP object, following any terminal object with an empty write.
    pub fn write(&self, object: impl Into<HttpObject>) -> WriteFuture {
        let object = object.into();
        let last = object.is_last();
        let written = self.write_frame(Frame::Http(object));
        if last {
            self.write_raw(Bytes::new())
        } else {
            written
        }
    }

    pub fn write_raw(&self, bytes: Bytes) -> WriteFuture {
        self.write_frame(Frame::Raw(bytes))
    }

    fn write_frame(&self, frame: Frame) -> WriteFuture {
        match self.transport() {
            Some(transport) => transport.write(frame),
            None => WriteFuture::ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection has no transport",
            ))),
        }
    }

    pub fn stop_reading(&self) {
        if let Some(transport) = self.transport() {
            tracing::trace!(connection_id = %self.id, "Stopped reading");
            transport.set_auto_read(false);
        }
    }

    pub fn resume_reading(&self) {
        if let Some(transport) = self.transport() {
            tracing::trace!(connection_id = %self.id, "Resumed reading");
            transport.set_auto_read(true);
        }
    }

    /// Whether queued output is above the high watermark.
    pub fn is_saturated(&self) -> bool {
        self.transport()
            .map(|t| !t.is_writable())
            .unwrap_or(false)
    }

    /// Flush what is queued, then close.
    pub fn disconnect(&self) {
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::DisconnectRequested);
        }
        if let Some(transport) = self.transport() {
            let closing = Arc::clone(&transport);
            transport
                .write(Frame::Raw(Bytes::new()))
                .on_complete(move |_| closing.close());
        }
    }

    /// Close once `pending` has completed.
    pub fn close_after(&self, pending: WriteFuture) {
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::DisconnectRequested);
        }
        if let Some(transport) = self.transport() {
            pending.on_complete(move |_| transport.close());
        }
    }
}

fn inbound_kind(inbound: &Inbound) -> &'static str {
    match inbound {
        Inbound::Http(HttpObject::Request(_)) => "request",
        Inbound::Http(HttpObject::Response(_)) => "response",
        Inbound::Http(HttpObject::Chunk(_)) => "chunk",
        Inbound::Raw(_) => "raw",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, HttpRequest, HttpResponse};
    use crate::net::connection::Leg;
    use crate::proxy::transport::testing::RecordingTransport;
    use http::{Method, StatusCode};
    use std::sync::Mutex;

    /// Handler that records calls and reports the chunked-ness of heads.
    struct Harness {
        engine: ConnectionEngine,
        seen: Mutex<Vec<String>>,
    }

    impl Harness {
        fn new() -> (Arc<Self>, Arc<RecordingTransport>) {
            let harness = Arc::new(Self {
                engine: ConnectionEngine::new(ConnectionId::new(Leg::Client), ConnectionState::Disconnected),
                seen: Mutex::new(Vec::new()),
            });
            let transport = RecordingTransport::new();
            harness.engine.connected(transport.clone());
            (harness, transport)
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ConnectionHandler for Harness {
        fn engine(&self) -> &ConnectionEngine {
            &self.engine
        }

        fn read_initial(&self, object: HttpObject) -> BoxFuture<'_, ConnectionState> {
            Box::pin(async move {
                self.seen.lock().unwrap().push("initial".into());
                if object.is_chunked() {
                    ConnectionState::AwaitingChunk
                } else {
                    ConnectionState::AwaitingInitial
                }
            })
        }

        fn read_chunk(&self, chunk: HttpChunk) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(format!("chunk:{}", chunk.last));
            })
        }

        fn read_raw(&self, bytes: Bytes) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(format!("raw:{}", bytes.len()));
            })
        }
    }

    fn streaming_response() -> HttpObject {
        let mut response = HttpResponse::new(StatusCode::OK);
        response.body = Body::Streaming;
        response.into()
    }

    #[tokio::test]
    async fn chunked_message_walks_through_awaiting_chunk() {
        let (harness, _transport) = Harness::new();
        let engine = &harness.engine;
        let mut states = vec![engine.state()];

        engine.read(harness.as_ref(), Inbound::Http(streaming_response())).await;
        states.push(engine.state());
        engine
            .read(harness.as_ref(), Inbound::Http(HttpChunk::new("a", false).into()))
            .await;
        states.push(engine.state());
        engine.read(harness.as_ref(), Inbound::Http(HttpChunk::last().into())).await;
        states.push(engine.state());

        assert_eq!(
            states,
            vec![
                ConnectionState::AwaitingInitial,
                ConnectionState::AwaitingChunk,
                ConnectionState::AwaitingChunk,
                ConnectionState::AwaitingInitial,
            ]
        );
        assert_eq!(harness.seen(), vec!["initial", "chunk:false", "chunk:true"]);
    }

    #[tokio::test]
    async fn awaiting_authentication_only_accepts_requests() {
        let (harness, _transport) = Harness::new();
        harness.engine.set_state(ConnectionState::AwaitingProxyAuthentication);

        harness
            .engine
            .read(harness.as_ref(), Inbound::Http(HttpChunk::new("body", false).into()))
            .await;
        assert!(harness.seen().is_empty());
        assert_eq!(harness.engine.state(), ConnectionState::AwaitingProxyAuthentication);

        let request = HttpRequest::new(Method::GET, "http://example.com/");
        harness.engine.read(harness.as_ref(), Inbound::Http(request.into())).await;
        assert_eq!(harness.seen(), vec!["initial"]);
        assert_eq!(harness.engine.state(), ConnectionState::AwaitingInitial);
    }

    #[tokio::test]
    async fn reads_are_dropped_while_connecting_or_disconnecting() {
        let (harness, _transport) = Harness::new();
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Handshaking,
            ConnectionState::DisconnectRequested,
            ConnectionState::Disconnected,
        ] {
            harness.engine.set_state(state);
            let request = HttpRequest::new(Method::GET, "/");
            harness.engine.read(harness.as_ref(), Inbound::Http(request.into())).await;
            assert_eq!(harness.engine.state(), state);
        }
        assert!(harness.seen().is_empty());
    }

    #[tokio::test]
    async fn tunneling_delivers_raw_bytes() {
        let (harness, _transport) = Harness::new();
        harness.engine.set_state(ConnectionState::Tunneling);
        harness
            .engine
            .read(harness.as_ref(), Inbound::Raw(Bytes::from_static(b"\x16\x03\x01")))
            .await;
        assert_eq!(harness.seen(), vec!["raw:3"]);
        assert_eq!(harness.engine.state(), ConnectionState::Tunneling);
    }

    #[tokio::test]
    async fn terminal_chunk_is_followed_by_empty_write() {
        let (harness, transport) = Harness::new();
        harness.engine.write(HttpChunk::new("data", false));
        harness.engine.write(HttpChunk::last());

        let writes = transport.writes();
        assert_eq!(writes.len(), 3);
        assert!(matches!(&writes[1], Frame::Http(HttpObject::Chunk(c)) if c.last));
        assert!(matches!(&writes[2], Frame::Raw(b) if b.is_empty()));
    }

    #[tokio::test]
    async fn disconnect_flushes_before_closing() {
        let (harness, transport) = Harness::new();
        harness.engine.disconnect();

        let events = transport.events();
        assert_eq!(harness.engine.state(), ConnectionState::DisconnectRequested);
        assert_eq!(events.len(), 2);
        assert!(transport.is_closed());
        assert!(matches!(
            &events[0],
            crate::proxy::transport::testing::Event::Write(Frame::Raw(b)) if b.is_empty()
        ));
    }

    #[tokio::test]
    async fn flow_control_toggles_auto_read() {
        let (harness, transport) = Harness::new();
        harness.engine.stop_reading();
        assert!(!transport.auto_read());
        harness.engine.resume_reading();
        assert!(transport.auto_read());

        transport.set_writable(false);
        assert!(harness.engine.is_saturated());
    }
}
