//! HTTP/1.x message model shared by both legs.
//!
//! A decoded message arrives as a head followed, when the head says so, by a
//! run of [`HttpChunk`]s ending with a terminal chunk:
//!
//! ```text
//! Request(head, Body::Streaming) → Chunk → Chunk → Chunk { last: true }
//! Response(head, Body::Full(..))                        (nothing follows)
//! ```

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};

/// Body carried by a message head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// The whole body (possibly empty) travels with the head.
    Full(Bytes),
    /// Body chunks follow as separate [`HttpObject::Chunk`]s.
    Streaming,
}

impl Body {
    pub fn empty() -> Self {
        Body::Full(Bytes::new())
    }
}

/// A request head.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Request target as it appeared on the wire (absolute, origin or authority form).
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    /// Whether body chunks follow this head.
    pub fn is_chunked(&self) -> bool {
        self.body == Body::Streaming
    }

    pub fn is_keep_alive(&self) -> bool {
        is_keep_alive(self.version, &self.headers)
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }
}

/// A response head.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase when it differs from the canonical one.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    /// Build a complete response with `Content-Length` set from `body`.
    pub fn full(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        response.body = Body::Full(body);
        response
    }

    pub fn is_chunked(&self) -> bool {
        self.body == Body::Streaming
    }

    pub fn is_keep_alive(&self) -> bool {
        is_keep_alive(self.version, &self.headers)
    }

    /// Copy of the head without body payload, used to attribute later chunks.
    pub fn snapshot(&self) -> Self {
        Self {
            version: self.version,
            status: self.status,
            reason: self.reason.clone(),
            headers: self.headers.clone(),
            body: match self.body {
                Body::Streaming => Body::Streaming,
                Body::Full(_) => Body::empty(),
            },
        }
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }
}

/// A slice of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpChunk {
    pub data: Bytes,
    /// Terminal chunk of the current message.
    pub last: bool,
}

impl HttpChunk {
    pub fn new(data: impl Into<Bytes>, last: bool) -> Self {
        Self {
            data: data.into(),
            last,
        }
    }

    pub fn last() -> Self {
        Self::new(Bytes::new(), true)
    }
}

/// Any decoded HTTP object.
#[derive(Debug, Clone)]
pub enum HttpObject {
    Request(HttpRequest),
    Response(HttpResponse),
    Chunk(HttpChunk),
}

impl HttpObject {
    /// True when nothing else follows for the current message.
    pub fn is_last(&self) -> bool {
        match self {
            HttpObject::Request(r) => !r.is_chunked(),
            HttpObject::Response(r) => !r.is_chunked(),
            HttpObject::Chunk(c) => c.last,
        }
    }

    /// True when more objects follow for the current message.
    pub fn is_chunked(&self) -> bool {
        !self.is_last()
    }

    /// Number of payload bytes carried.
    pub fn payload_len(&self) -> usize {
        match self {
            HttpObject::Request(HttpRequest { body: Body::Full(b), .. })
            | HttpObject::Response(HttpResponse { body: Body::Full(b), .. }) => b.len(),
            HttpObject::Chunk(c) => c.data.len(),
            _ => 0,
        }
    }
}

impl From<HttpRequest> for HttpObject {
    fn from(request: HttpRequest) -> Self {
        HttpObject::Request(request)
    }
}

impl From<HttpResponse> for HttpObject {
    fn from(response: HttpResponse) -> Self {
        HttpObject::Response(response)
    }
}

impl From<HttpChunk> for HttpObject {
    fn from(chunk: HttpChunk) -> Self {
        HttpObject::Chunk(chunk)
    }
}

/// Whether a `Connection` header lists `token` (case-insensitive).
pub fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// HTTP/1.1 defaults to keep-alive unless told to close; HTTP/1.0 the reverse.
pub fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if connection_has_token(headers, "close") {
        return false;
    }
    if version == Version::HTTP_10 || version == Version::HTTP_09 {
        return connection_has_token(headers, "keep-alive");
    }
    true
}

/// Whether the last transfer coding is `chunked`.
pub fn is_transfer_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}
