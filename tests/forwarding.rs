//! Plain HTTP forwarding through the proxy.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use forward_proxy::config::AuthenticationConfig;
use forward_proxy::proxy::ActivityTracker;
use forward_proxy::ProxyConfig;

mod common;

#[tokio::test]
async fn forwards_requests_in_origin_form() {
    let origin = common::start_origin(|_| common::ok("hello")).await;
    let proxy = common::start_proxy(ProxyConfig::default()).await;

    let res = common::client_via(&proxy)
        .get(format!("http://{}/greeting?lang=en", origin.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "hello");

    let requests = origin.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("GET /greeting?lang=en HTTP/1.1\r\n"));
    assert!(requests[0].to_ascii_lowercase().contains("\r\nvia: 1.1 "));
}

#[tokio::test]
async fn forwards_request_bodies() {
    let origin = common::start_origin(|_| common::ok("stored")).await;
    let proxy = common::start_proxy(ProxyConfig::default()).await;

    let res = common::client_via(&proxy)
        .post(format!("http://{}/items", origin.addr))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "stored");
    let requests = origin.requests();
    assert!(requests[0].starts_with("POST /items HTTP/1.1\r\n"));
    assert!(requests[0].ends_with("\r\n\r\npayload"));
}

#[tokio::test]
async fn relays_chunked_responses() {
    let origin = common::start_origin(|_| {
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .to_string()
    })
    .await;
    let proxy = common::start_proxy(ProxyConfig::default()).await;

    let res = common::client_via(&proxy)
        .get(format!("http://{}/stream", origin.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "hello world");
}

#[tokio::test]
async fn redials_after_origin_closes_the_connection() {
    let origin = common::start_origin(|_| {
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi".to_string()
    })
    .await;
    let proxy = common::start_proxy(ProxyConfig::default()).await;
    let client = common::client_via(&proxy);

    for _ in 0..2 {
        let res = client
            .get(format!("http://{}/", origin.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "hi");
    }

    assert_eq!(origin.requests().len(), 2);
    assert_eq!(origin.connections(), 2);
}

#[tokio::test]
async fn unreachable_origin_answers_bad_gateway() {
    let closed = common::closed_port().await;
    let proxy = common::start_proxy(ProxyConfig::default()).await;

    let res = common::client_via(&proxy)
        .get(format!("http://{}/missing", closed))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 502);
    assert!(res.text().await.unwrap().starts_with("Bad Gateway: "));
}

#[tokio::test]
async fn requires_proxy_credentials_when_configured() {
    let origin = common::start_origin(|_| common::ok("secret")).await;
    let mut config = ProxyConfig::default();
    config.authentication = Some(AuthenticationConfig {
        username: "user".to_string(),
        password: "pass".to_string(),
        realm: "proxy".to_string(),
    });
    let proxy = common::start_proxy(config).await;
    let url = format!("http://{}/", origin.addr);

    let res = common::client_via(&proxy).get(&url).send().await.unwrap();
    assert_eq!(res.status(), 407);
    assert_eq!(res.headers()["proxy-authenticate"], "Basic realm=\"proxy\"");
    assert!(origin.requests().is_empty());

    let authenticated = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(proxy.url()).unwrap().basic_auth("user", "pass"))
        .build()
        .unwrap();
    let res = authenticated.get(&url).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "secret");

    let requests = origin.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].to_ascii_lowercase().contains("proxy-authorization"));
}

#[derive(Default)]
struct ClientAddresses(Mutex<Vec<Option<SocketAddr>>>);

impl ActivityTracker for ClientAddresses {
    fn client_connected(&self, peer: Option<SocketAddr>) {
        self.0.lock().unwrap().push(peer);
    }
}

#[tokio::test]
async fn proxy_protocol_header_names_the_client() {
    let origin = common::start_origin(|_| common::ok("behind balancer")).await;
    let tracker = Arc::new(ClientAddresses::default());
    let mut config = ProxyConfig::default();
    config.proxy.accept_proxy_protocol = true;
    let recorded = Arc::clone(&tracker);
    let proxy = common::start_server(config, |server| server.with_activity_tracker(recorded)).await;

    let target = origin.addr;
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(
            format!(
                "PROXY TCP4 203.0.113.7 127.0.0.1 51234 8080\r\n\
                 GET http://{target}/ HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("behind balancer"));
    assert_eq!(
        *tracker.0.lock().unwrap(),
        vec![Some("203.0.113.7:51234".parse().unwrap())]
    );
    assert!(origin.requests()[0].starts_with("GET / HTTP/1.1\r\n"));
}

#[tokio::test]
async fn proxy_protocol_listener_drops_bare_requests() {
    let origin = common::start_origin(|_| common::ok("unreachable")).await;
    let mut config = ProxyConfig::default();
    config.proxy.accept_proxy_protocol = true;
    let proxy = common::start_proxy(config).await;

    let target = origin.addr;
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(format!("GET http://{target}/ HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;

    assert!(response.is_empty());
    assert!(origin.requests().is_empty());
}
