//! Byte transport beneath every connection.
//!
//! # Responsibilities
//! - Own the socket on a single task per connection (the driver)
//! - Decode inbound bytes and hand them to the connection's state dispatch
//! - Serialize outbound frames in call order and report write completion
//! - Enforce idle timeouts and track queued bytes for backpressure
//! - Hold every transport to the global read and write byte rates
//!
//! # Data Flow
//! ```text
//! engine.write(frame) ──▶ mpsc ──▶ Driver ──encode──▶ socket
//!                                     │
//! engine.read(handler, ..) ◀──decode──┘◀───────────── socket
//! ```
//!
//! # Design Decisions
//! - Reads and lifecycle callbacks happen only on the driver task; writes may
//!   come from any task and are queued through a channel
//! - Auto-read is a watch flag: clearing it stops both socket reads and the
//!   delivery of messages already buffered
//! - A close request is queued behind pending writes, so nothing buffered is
//!   truncated
//! - Throttling runs on the driver task: an over-budget read delays the next
//!   read and an over-budget write delays its own flush

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::FlowConfig;
use crate::http::{Frame, HttpCodec};
use crate::proxy::engine::{ConnectionHandler, Inbound};
use crate::proxy::state::ConnectionState;

const READ_BUFFER_SIZE: usize = 8 * 1024;

static TRANSPORT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Any async byte stream the proxy can drive (plain TCP, TLS, test duplex).
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// Replaces the stream under a running transport, e.g. with a TLS session.
pub type Upgrade = Box<dyn FnOnce(BoxedIo) -> BoxFuture<'static, io::Result<BoxedIo>> + Send>;

/// Byte budget refilled continuously at a fixed rate.
///
/// Consumers may overdraw the budget; the debt is repaid by sleeping, so a
/// single frame larger than the burst still goes out.
#[derive(Debug)]
struct TokenBucket {
    bytes_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            bytes_per_sec: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take `bytes` from the budget and return how long the caller must wait
    /// before the budget is back in credit.
    fn reserve(&self, bytes: usize) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.bytes_per_sec).min(self.bytes_per_sec);
        state.last_update = now;

        state.tokens -= bytes as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.bytes_per_sec)
        }
    }
}

/// Read and write rate limits shared by every transport of a proxy.
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    read: Option<Arc<TokenBucket>>,
    write: Option<Arc<TokenBucket>>,
}

impl Throttle {
    pub fn from_config(flow: &FlowConfig) -> Self {
        let bucket = |rate: u64| (rate > 0).then(|| Arc::new(TokenBucket::new(rate)));
        Self {
            read: bucket(flow.read_throttle_bytes_per_sec),
            write: bucket(flow.write_throttle_bytes_per_sec),
        }
    }

    async fn bytes_read(&self, bytes: usize) {
        Self::pace(self.read.as_deref(), bytes, "read").await;
    }

    async fn bytes_writing(&self, bytes: usize) {
        Self::pace(self.write.as_deref(), bytes, "write").await;
    }

    async fn pace(bucket: Option<&TokenBucket>, bytes: usize, direction: &'static str) {
        let Some(bucket) = bucket else {
            return;
        };
        let delay = bucket.reserve(bytes);
        if !delay.is_zero() {
            metrics::counter!("proxy_throttled_total", "direction" => direction).increment(1);
            tracing::trace!(direction, delay_ms = delay.as_millis() as u64, "Throttling transport");
            sleep(delay).await;
        }
    }
}

fn transport_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "transport closed")
}

/// Completion of a queued write.
#[derive(Debug)]
pub struct WriteFuture {
    rx: oneshot::Receiver<io::Result<()>>,
}

impl WriteFuture {
    fn pending() -> (oneshot::Sender<io::Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// An already completed write.
    pub fn ready(result: io::Result<()>) -> Self {
        let (tx, future) = Self::pending();
        let _ = tx.send(result);
        future
    }

    /// Run `f` once the write completes; immediately if it already has.
    pub fn on_complete<F>(mut self, f: F)
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        match self.rx.try_recv() {
            Ok(result) => f(result),
            Err(oneshot::error::TryRecvError::Closed) => f(Err(transport_closed())),
            Err(oneshot::error::TryRecvError::Empty) => {
                tokio::spawn(async move { f(self.await) });
            }
        }
    }
}

impl Future for WriteFuture {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(transport_closed())))
    }
}

/// Handle a connection uses to talk to its socket.
pub trait Transport: Send + Sync {
    /// Unique id, used to ignore callbacks from a replaced transport.
    fn id(&self) -> u64;

    /// Queue `frame`; the payload is owned by the transport until written.
    fn write(&self, frame: Frame) -> WriteFuture;

    /// Swap the underlying stream after all previously queued writes.
    fn upgrade(&self, upgrade: Upgrade) -> WriteFuture;

    fn set_auto_read(&self, enabled: bool);

    /// False while more than the high watermark is queued.
    fn is_writable(&self) -> bool;

    /// Close once previously queued writes have been flushed.
    fn close(&self);

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Idle bounds; `None` disables the corresponding timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleTimeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub all: Option<Duration>,
}

impl IdleTimeouts {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all(timeout: Duration) -> Self {
        Self {
            all: Some(timeout),
            ..Self::default()
        }
    }

    fn next_deadline(&self, last_read: Instant, last_write: Instant) -> Option<(Instant, Duration)> {
        [
            self.read.map(|d| (last_read + d, d)),
            self.write.map(|d| (last_write + d, d)),
            self.all.map(|d| (last_read.max(last_write) + d, d)),
        ]
        .into_iter()
        .flatten()
        .min_by_key(|(at, _)| *at)
    }
}

enum Command {
    Write(Frame, oneshot::Sender<io::Result<()>>),
    Upgrade(Upgrade, oneshot::Sender<io::Result<()>>),
    Close,
}

/// [`Transport`] backed by a driver task.
pub struct ChannelTransport {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    auto_read: watch::Sender<bool>,
    queued: Arc<AtomicUsize>,
    high_water: usize,
    peer: Option<SocketAddr>,
}

impl Transport for ChannelTransport {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, frame: Frame) -> WriteFuture {
        let len = frame.len();
        self.queued.fetch_add(len, Ordering::AcqRel);
        let (tx, future) = WriteFuture::pending();
        if self.commands.send(Command::Write(frame, tx)).is_err() {
            self.queued.fetch_sub(len, Ordering::AcqRel);
        }
        future
    }

    fn upgrade(&self, upgrade: Upgrade) -> WriteFuture {
        let (tx, future) = WriteFuture::pending();
        let _ = self.commands.send(Command::Upgrade(upgrade, tx));
        future
    }

    fn set_auto_read(&self, enabled: bool) {
        self.auto_read.send_replace(enabled);
    }

    fn is_writable(&self) -> bool {
        self.queued.load(Ordering::Acquire) < self.high_water
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Socket-owning task for one connection.
pub struct Driver<H: ConnectionHandler> {
    id: u64,
    handler: Arc<H>,
    io: BoxedIo,
    codec: HttpCodec,
    commands: mpsc::UnboundedReceiver<Command>,
    auto_read: watch::Receiver<bool>,
    queued: Arc<AtomicUsize>,
    flow: FlowConfig,
    throttle: Throttle,
    idle: IdleTimeouts,
}

/// Create a transport over `io`; the returned driver must be spawned.
///
/// Callers hand the transport to the connection before spawning the driver so
/// no inbound message can arrive ahead of the `connected` transition.
pub fn channel<H: ConnectionHandler>(
    io: BoxedIo,
    peer: Option<SocketAddr>,
    codec: HttpCodec,
    idle: IdleTimeouts,
    flow: FlowConfig,
    throttle: Throttle,
    handler: Arc<H>,
) -> (Arc<ChannelTransport>, Driver<H>) {
    let id = TRANSPORT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (auto_read_tx, auto_read_rx) = watch::channel(true);
    let queued = Arc::new(AtomicUsize::new(0));

    let transport = Arc::new(ChannelTransport {
        id,
        commands: commands_tx,
        auto_read: auto_read_tx,
        queued: Arc::clone(&queued),
        high_water: flow.write_buffer_high_water,
        peer,
    });
    let driver = Driver {
        id,
        handler,
        io,
        codec,
        commands: commands_rx,
        auto_read: auto_read_rx,
        queued,
        flow,
        throttle,
        idle,
    };
    (transport, driver)
}

enum Delivery {
    Continue,
    /// Reads were paused with undelivered bytes still buffered.
    Stalled,
    /// The inbound stream is unusable.
    Fatal,
}

impl<H: ConnectionHandler> Driver<H> {
    pub async fn run(self) {
        let Driver {
            id,
            handler,
            mut io,
            mut codec,
            mut commands,
            mut auto_read,
            queued,
            flow,
            throttle,
            idle,
        } = self;

        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut write_buf = BytesMut::new();
        let mut last_read = Instant::now();
        let mut last_write = last_read;
        let mut read_open = true;
        let mut stalled = false;
        let mut saturated = false;

        let io = loop {
            let reading = read_open && *auto_read.borrow();
            if reading && stalled {
                stalled = false;
                match deliver(&handler, &mut codec, &mut read_buf, false, &auto_read).await {
                    Delivery::Continue => {}
                    Delivery::Stalled => stalled = true,
                    Delivery::Fatal => read_open = false,
                }
                continue;
            }

            let deadline = idle.next_deadline(last_read, last_write);
            let wake_at = deadline
                .map(|(at, _)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Write(frame, done)) => {
                        let len = frame.len();
                        write_buf.clear();
                        codec.encode(frame, &mut write_buf);
                        throttle.bytes_writing(write_buf.len()).await;
                        let result = write_flush(&mut io, &write_buf).await;
                        last_write = Instant::now();

                        let before = queued.fetch_sub(len, Ordering::AcqRel);
                        if before >= flow.write_buffer_high_water {
                            saturated = true;
                        }
                        let failed = result.is_err();
                        let _ = done.send(result);
                        if failed {
                            break Some(io);
                        }
                        if saturated && before.saturating_sub(len) < flow.write_buffer_low_water {
                            saturated = false;
                            handler.became_writeable();
                        }
                    }
                    Some(Command::Upgrade(upgrade, done)) => {
                        if !read_buf.is_empty() {
                            tracing::debug!(
                                transport_id = id,
                                discarded = read_buf.len(),
                                "Discarding plaintext buffered ahead of stream upgrade"
                            );
                            read_buf.clear();
                        }
                        match upgrade(io).await {
                            Ok(upgraded) => {
                                io = upgraded;
                                let _ = done.send(Ok(()));
                            }
                            Err(error) => {
                                let _ = done.send(Err(error));
                                break None;
                            }
                        }
                    }
                    Some(Command::Close) | None => break Some(io),
                },

                changed = auto_read.changed() => {
                    if changed.is_err() {
                        break Some(io);
                    }
                }

                result = io.read_buf(&mut read_buf), if reading => match result {
                    Ok(0) => {
                        deliver(&handler, &mut codec, &mut read_buf, true, &auto_read).await;
                        break Some(io);
                    }
                    Ok(n) => {
                        last_read = Instant::now();
                        handler.bytes_read(n);
                        throttle.bytes_read(n).await;
                        match deliver(&handler, &mut codec, &mut read_buf, false, &auto_read).await {
                            Delivery::Continue => {}
                            Delivery::Stalled => stalled = true,
                            Delivery::Fatal => read_open = false,
                        }
                    }
                    Err(error) => {
                        handler.exception_caught(&error);
                        break Some(io);
                    }
                },

                _ = sleep_until(wake_at), if deadline.is_some() => {
                    let idle_for = deadline.map(|(_, d)| d).unwrap_or_default();
                    last_read = Instant::now();
                    last_write = last_read;
                    handler.timed_out(idle_for);
                }
            }
        };

        if let Some(mut io) = io {
            let _ = io.shutdown().await;
        }
        if handler.engine().is_current_transport(id) {
            handler.disconnected();
        } else {
            tracing::trace!(transport_id = id, "Replaced transport closed");
        }
    }
}

async fn write_flush(io: &mut BoxedIo, bytes: &[u8]) -> io::Result<()> {
    io.write_all(bytes).await?;
    io.flush().await
}

async fn deliver<H: ConnectionHandler>(
    handler: &Arc<H>,
    codec: &mut HttpCodec,
    buf: &mut BytesMut,
    eof: bool,
    auto_read: &watch::Receiver<bool>,
) -> Delivery {
    let engine = handler.engine();
    loop {
        if !eof && !*auto_read.borrow() {
            return if buf.is_empty() {
                Delivery::Continue
            } else {
                Delivery::Stalled
            };
        }
        if engine.state() == ConnectionState::Tunneling {
            if !buf.is_empty() {
                let bytes = buf.split().freeze();
                engine.read(handler.as_ref(), Inbound::Raw(bytes)).await;
            }
            return Delivery::Continue;
        }
        let decoded = if eof {
            codec.decode_eof(buf)
        } else {
            codec.decode(buf)
        };
        match decoded {
            Ok(Some(object)) => engine.read(handler.as_ref(), Inbound::Http(object)).await,
            Ok(None) => return Delivery::Continue,
            Err(error) => {
                handler.decode_failed(error);
                return Delivery::Fatal;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_idle_deadline_wins() {
        let now = Instant::now();
        let idle = IdleTimeouts {
            read: Some(Duration::from_secs(70)),
            write: Some(Duration::from_secs(10)),
            all: None,
        };
        let (at, bound) = idle.next_deadline(now, now).unwrap();
        assert_eq!(bound, Duration::from_secs(10));
        assert_eq!(at, now + Duration::from_secs(10));
        assert!(IdleTimeouts::none().next_deadline(now, now).is_none());
    }

    #[tokio::test]
    async fn ready_write_runs_callback_inline() {
        let (tx, rx) = std::sync::mpsc::channel();
        WriteFuture::ready(Ok(())).on_complete(move |result| {
            tx.send(result.is_ok()).unwrap();
        });
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn bucket_allows_one_second_burst_then_charges_the_overdraft() {
        let bucket = TokenBucket::new(1000);
        assert_eq!(bucket.reserve(1000), Duration::ZERO);

        let delay = bucket.reserve(500);
        assert!(delay > Duration::from_millis(400), "{delay:?}");
        assert!(delay <= Duration::from_millis(500), "{delay:?}");
    }

    #[test]
    fn zero_rate_leaves_direction_unthrottled() {
        let flow = FlowConfig {
            read_throttle_bytes_per_sec: 0,
            write_throttle_bytes_per_sec: 4096,
            ..FlowConfig::default()
        };
        let throttle = Throttle::from_config(&flow);
        assert!(throttle.read.is_none());
        assert!(throttle.write.is_some());
    }

    #[tokio::test]
    async fn shared_write_budget_paces_every_transport() {
        let flow = FlowConfig {
            write_throttle_bytes_per_sec: 10_000,
            ..FlowConfig::default()
        };
        let throttle = Throttle::from_config(&flow);
        let other = throttle.clone();

        let started = Instant::now();
        throttle.bytes_writing(10_000).await;
        other.bytes_writing(2_000).await;
        assert!(started.elapsed() >= Duration::from_millis(150), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn dropped_write_reports_closed() {
        let (tx, future) = WriteFuture::pending();
        drop(tx);
        let err = future.await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
