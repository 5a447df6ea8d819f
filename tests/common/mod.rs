//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use forward_proxy::net::listener::Listener;
use forward_proxy::{ProxyConfig, ProxyServer, Shutdown};

/// A running proxy. Dropping it stops the accept loop.
pub struct TestProxy {
    pub addr: SocketAddr,
    _shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Start a proxy on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    start_server(config, |server| server).await
}

/// Start a proxy after `customize` installed collaborators on the server.
pub async fn start_server<F>(mut config: ProxyConfig, customize: F) -> TestProxy
where
    F: FnOnce(ProxyServer) -> ProxyServer,
{
    config.listener.bind_address = "127.0.0.1:0".to_string();
    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = customize(ProxyServer::new(config));
    let signal = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, signal).await;
    });

    TestProxy {
        addr,
        _shutdown: shutdown,
    }
}

/// HTTP client that sends every `http://` request through `proxy`.
pub fn client_via(proxy: &TestProxy) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(proxy.url()).unwrap())
        .build()
        .unwrap()
}

/// A scripted HTTP/1.1 server that records what it receives.
pub struct MockOrigin {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockOrigin {
    /// Every request received so far: head followed by body.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Start an origin that answers each request with `respond(head)`.
///
/// The socket is closed after any response carrying `Connection: close`.
pub async fn start_origin<F>(respond: F) -> MockOrigin
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));
    let respond = Arc::new(respond);

    let recorded = Arc::clone(&requests);
    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let recorded = Arc::clone(&recorded);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                while let Some(head) = read_head(&mut reader).await {
                    let body = read_body(&mut reader, &head).await;
                    recorded.lock().unwrap().push(format!("{}{}", head, body));

                    let response = respond(&head);
                    if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                    if response.to_ascii_lowercase().contains("connection: close") {
                        let _ = reader.get_mut().shutdown().await;
                        break;
                    }
                }
            });
        }
    });

    MockOrigin {
        addr,
        requests,
        connections,
    }
}

/// `200 OK` with a fixed-length body.
pub fn ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

/// A TCP server that echoes every byte back.
pub async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn read_head<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Option<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        head.push_str(&line);
        if line == "\r\n" {
            return Some(head);
        }
    }
}

async fn read_body<R: AsyncReadExt + Unpin>(reader: &mut R, head: &str) -> String {
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if reader.read_exact(&mut body).await.is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&body).into_owned()
}
