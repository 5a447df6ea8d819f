//! HAProxy PROXY protocol, version 1.
//!
//! A load balancer in front of the proxy prepends one text line such as
//! `PROXY TCP4 203.0.113.7 10.0.0.1 51234 8080\r\n` naming the original
//! client. The line is consumed before any HTTP is decoded.

use std::io;
use std::net::SocketAddr;

use proxy_header::{ParseConfig, ProxyHeader};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest legal v1 header, CRLF included.
const MAX_V1_HEADER: usize = 107;

/// Consume a v1 header from `reader`, stopping exactly at its CRLF so the
/// request that follows stays unread.
///
/// Returns the proxied source address, or `None` for `PROXY UNKNOWN`.
pub async fn read_v1_header<R>(reader: &mut R) -> io::Result<Option<SocketAddr>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_V1_HEADER);
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        if line.len() >= MAX_V1_HEADER {
            return Err(invalid("PROXY header longer than 107 bytes"));
        }
        if reader.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside PROXY header",
            ));
        }
        line.push(byte[0]);
    }
    if !line.starts_with(b"PROXY ") {
        return Err(invalid("missing PROXY header"));
    }

    match ProxyHeader::parse(&line, ParseConfig::default()) {
        Ok((header, _)) => {
            let source = header.proxied_address().map(|address| address.source);
            tracing::debug!(source = ?source, "PROXY header parsed");
            Ok(source)
        }
        Err(error) => Err(invalid(format!("malformed PROXY header: {error:?}"))),
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp4_header_yields_source_and_leaves_request_unread() {
        let mut input: &[u8] = b"PROXY TCP4 203.0.113.7 10.0.0.1 51234 8080\r\nGET / HTTP/1.1\r\n";
        let source = read_v1_header(&mut input).await.unwrap();
        assert_eq!(source, Some("203.0.113.7:51234".parse().unwrap()));
        assert_eq!(input, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn tcp6_header_yields_source() {
        let mut input: &[u8] = b"PROXY TCP6 2001:db8::1 2001:db8::2 4000 443\r\n";
        let source = read_v1_header(&mut input).await.unwrap();
        assert_eq!(source, Some("[2001:db8::1]:4000".parse().unwrap()));
    }

    #[tokio::test]
    async fn unknown_protocol_keeps_socket_address() {
        let mut input: &[u8] = b"PROXY UNKNOWN\r\n";
        assert_eq!(read_v1_header(&mut input).await.unwrap(), None);
    }

    #[tokio::test]
    async fn plain_request_is_rejected() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\n";
        let err = read_v1_header(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn unterminated_header_is_bounded() {
        let long = vec![b'P'; 200];
        let mut input: &[u8] = &long;
        let err = read_v1_header(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
