//! Header rewriting applied while forwarding.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers and headers named by `Connection` tokens
//! - Translate legacy `Proxy-Connection` into `Connection`
//! - Append `Via` and `Date`
//! - Derive the destination `host:port` from a request

use http::header::{CONNECTION, DATE, HOST, VIA};
use http::{HeaderMap, HeaderName, HeaderValue, Version};

use crate::http::message::HttpRequest;

/// Headers that only apply to a single transport leg.
///
/// `Transfer-Encoding` is absent: bodies are relayed with their
/// original framing, so the header must travel with them.
pub const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

const PROXY_CONNECTION: &str = "proxy-connection";

/// Remove every header named by a `Connection` token, except `Transfer-Encoding`.
pub fn strip_connection_tokens(headers: &mut HeaderMap) {
    let tokens: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty() && t != "transfer-encoding")
        .collect();
    for token in tokens {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
}

/// Remove connection tokens and the hop-by-hop set.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    strip_connection_tokens(headers);
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rename `Proxy-Connection` to `Connection`, replacing any existing value.
pub fn switch_proxy_connection_header(headers: &mut HeaderMap) {
    if let Some(value) = headers.remove(PROXY_CONNECTION) {
        headers.insert(CONNECTION, value);
    }
}

/// Append `Via: <major>.<minor> <alias>` to any existing `Via`.
pub fn add_via(headers: &mut HeaderMap, version: Version, alias: &str) {
    let hop = format!("{} {}", version_number(version), alias);
    let value = match headers.get(VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, hop),
        _ => hop,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}

/// Add `Date` if absent.
pub fn ensure_date(headers: &mut HeaderMap) {
    if !headers.contains_key(DATE) {
        if let Ok(value) = HeaderValue::from_str(&http_date()) {
            headers.insert(DATE, value);
        }
    }
}

/// Current time in IMF-fixdate format.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn version_number(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    }
}

/// `host:port` from an absolute or authority-form URI, `None` for origin-form.
pub fn parse_host_and_port(uri: &str) -> Option<&str> {
    let rest = strip_scheme(uri);
    if rest.starts_with('/') || rest.is_empty() {
        return None;
    }
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    // Userinfo never takes part in routing.
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
        None
    } else {
        Some(authority)
    }
}

fn strip_scheme(uri: &str) -> &str {
    match uri.find("://") {
        Some(pos) => &uri[pos + 3..],
        None => uri,
    }
}

/// Destination for a request: URI authority first, then the `Host` header.
pub fn identify_host_and_port(request: &HttpRequest) -> Option<String> {
    parse_host_and_port(&request.uri)
        .map(str::to_string)
        .or_else(|| {
            request
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
        })
}

/// Rewrite an absolute URI to origin form (`/path?query`).
pub fn strip_host(uri: &str) -> String {
    if !uri.contains("://") {
        return uri.to_string();
    }
    let rest = strip_scheme(uri);
    match rest.find(['/', '?']) {
        Some(pos) if rest[pos..].starts_with('?') => format!("/{}", &rest[pos..]),
        Some(pos) => rest[pos..].to_string(),
        None => "/".to_string(),
    }
}

/// Split `host:port`, applying `default_port` when no port is present.
pub fn split_host_and_port(host_and_port: &str, default_port: u16) -> Option<(String, u16)> {
    let host_and_port = host_and_port.trim();
    if host_and_port.is_empty() {
        return None;
    }
    // Bracketed IPv6 literal.
    if let Some(rest) = host_and_port.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match host_and_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((host_and_port.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn strips_hop_by_hop_and_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Private, Transfer-Encoding"));
        headers.insert("x-private", HeaderValue::from_static("secret"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop_headers(&mut headers);

        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key("x-private"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("proxy-authorization"));
        assert_eq!(headers["transfer-encoding"], "chunked");
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[test]
    fn proxy_connection_becomes_connection() {
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_CONNECTION, HeaderValue::from_static("close"));
        switch_proxy_connection_header(&mut headers);
        assert_eq!(headers[CONNECTION], "close");
        assert!(!headers.contains_key(PROXY_CONNECTION));

        let mut both = HeaderMap::new();
        both.insert(PROXY_CONNECTION, HeaderValue::from_static("close"));
        both.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        switch_proxy_connection_header(&mut both);
        assert_eq!(both[CONNECTION], "close");
        assert!(!both.contains_key(PROXY_CONNECTION));
    }

    #[test]
    fn via_is_appended() {
        let mut headers = HeaderMap::new();
        add_via(&mut headers, Version::HTTP_11, "edge");
        assert_eq!(headers[VIA], "1.1 edge");
        add_via(&mut headers, Version::HTTP_10, "inner");
        assert_eq!(headers[VIA], "1.1 edge, 1.0 inner");
    }

    #[test]
    fn parses_destinations() {
        assert_eq!(parse_host_and_port("http://example.com/a/b"), Some("example.com"));
        assert_eq!(parse_host_and_port("https://example.com:8443?q=1"), Some("example.com:8443"));
        assert_eq!(parse_host_and_port("example.com:443"), Some("example.com:443"));
        assert_eq!(parse_host_and_port("http://user:pw@example.com/"), Some("example.com"));
        assert_eq!(parse_host_and_port("/relative"), None);
    }

    #[test]
    fn falls_back_to_host_header() {
        let mut request = HttpRequest::new(Method::GET, "/index.html");
        assert_eq!(identify_host_and_port(&request), None);
        request.headers.insert(HOST, HeaderValue::from_static("origin.test:8080"));
        assert_eq!(identify_host_and_port(&request).as_deref(), Some("origin.test:8080"));
    }

    #[test]
    fn strips_host_to_origin_form() {
        assert_eq!(strip_host("http://example.com/a?b=c"), "/a?b=c");
        assert_eq!(strip_host("http://example.com"), "/");
        assert_eq!(strip_host("http://example.com?x=1"), "/?x=1");
        assert_eq!(strip_host("/already"), "/already");
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_and_port("example.com", 80), Some(("example.com".into(), 80)));
        assert_eq!(split_host_and_port("example.com:8080", 80), Some(("example.com".into(), 8080)));
        assert_eq!(split_host_and_port("[::1]:443", 80), Some(("::1".into(), 443)));
        assert_eq!(split_host_and_port("[::1]", 80), Some(("::1".into(), 80)));
        assert_eq!(split_host_and_port("example.com:http", 80), None);
        assert_eq!(split_host_and_port("  ", 80), None);
    }

    #[test]
    fn date_is_imf_fixdate() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), "Sun, 06 Nov 1994 08:49:37 GMT".len());
    }
}
