//! CONNECT tunnels.

use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use forward_proxy::proxy::transport::BoxedIo;
use forward_proxy::proxy::MitmManager;
use forward_proxy::ProxyConfig;

mod common;

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "proxy closed before finishing the response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn connect_relays_raw_bytes_both_ways() {
    let echo = common::start_echo().await;
    let proxy = common::start_proxy(ProxyConfig::default()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection established\r\n"), "{head}");

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn connect_to_unreachable_destination_answers_bad_gateway() {
    let closed = common::closed_port().await;
    let proxy = common::start_proxy(ProxyConfig::default()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {closed} HTTP/1.1\r\nHost: {closed}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502 "), "{head}");
}

/// Interception without encryption: both legs keep their plaintext streams.
struct PlaintextMitm;

impl MitmManager for PlaintextMitm {
    fn server_tls(&self, io: BoxedIo, _host: &str) -> BoxFuture<'static, io::Result<BoxedIo>> {
        Box::pin(async move { Ok(io) })
    }

    fn client_tls(&self, io: BoxedIo, _host: &str) -> BoxFuture<'static, io::Result<BoxedIo>> {
        Box::pin(async move { Ok(io) })
    }
}

#[tokio::test]
async fn intercepted_connect_forwards_origin_form_requests() {
    let origin = common::start_origin(|_| common::ok("intercepted")).await;
    let proxy = common::start_server(ProxyConfig::default(), |server| {
        server.with_mitm_manager(Arc::new(PlaintextMitm))
    })
    .await;
    let target = origin.addr;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection established\r\n"), "{head}");

    stream
        .write_all(format!("GET /inside HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    let mut body = [0u8; 11];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"intercepted");

    let requests = origin.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("GET /inside HTTP/1.1\r\n"), "{}", requests[0]);
}
