//! Incremental HTTP/1.x codec.
//!
//! # Responsibilities
//! - Decode heads with `httparse` under bounded initial-line/header sizes
//! - Split bodies into [`HttpChunk`]s no larger than the chunk limit
//! - Re-frame outbound chunks when the outbound head declared chunked transfer
//!
//! # Design Decisions
//! - One codec per connection; the request side decodes requests and encodes
//!   responses, the response side does the opposite
//! - The response side remembers the method of every request it encoded so
//!   bodyless responses (HEAD, CONNECT 2xx) are framed correctly
//! - Trailers of chunked bodies are consumed and dropped

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use crate::config::CodecConfig;
use crate::http::message::{is_transfer_chunked, Body, HttpChunk, HttpObject, HttpRequest, HttpResponse};

const MAX_HEADERS: usize = 128;

/// Wire decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("initial line is longer than {0} bytes")]
    InitialLineTooLong(usize),
    #[error("header block is larger than {0} bytes")]
    HeadersTooLarge(usize),
    #[error("invalid message head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid chunk framing")]
    InvalidChunk,
    #[error("connection closed in the middle of a message")]
    UnexpectedEof,
}

/// Something the transport writes.
#[derive(Debug, Clone)]
pub enum Frame {
    Http(HttpObject),
    Raw(Bytes),
}

impl Frame {
    /// Payload bytes, used for write-buffer accounting.
    pub fn len(&self) -> usize {
        match self {
            Frame::Http(object) => object.payload_len(),
            Frame::Raw(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Fixed(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilEof,
}

/// Stateful encoder/decoder for one HTTP connection.
#[derive(Debug)]
pub struct HttpCodec {
    decodes_requests: bool,
    limits: CodecConfig,
    state: DecodeState,
    request_methods: VecDeque<Method>,
    outbound_chunked: bool,
}

impl HttpCodec {
    /// Codec for a client-facing connection: decodes requests, encodes responses.
    pub fn request_side(limits: CodecConfig) -> Self {
        Self::new(true, limits)
    }

    /// Codec for a server-facing connection: decodes responses, encodes requests.
    pub fn response_side(limits: CodecConfig) -> Self {
        Self::new(false, limits)
    }

    fn new(decodes_requests: bool, limits: CodecConfig) -> Self {
        Self {
            decodes_requests,
            limits,
            state: DecodeState::Head,
            request_methods: VecDeque::new(),
            outbound_chunked: false,
        }
    }

    /// Decode the next object from `buf`, or `None` if more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HttpObject>, CodecError> {
        loop {
            match self.state {
                DecodeState::Head => return self.decode_head(buf),
                DecodeState::Fixed(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let data = self.take_body(buf, remaining);
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::Head
                    } else {
                        DecodeState::Fixed(left)
                    };
                    return Ok(Some(HttpObject::Chunk(HttpChunk::new(data, left == 0))));
                }
                DecodeState::ChunkSize => {
                    let Some(pos) = find_crlf(buf) else {
                        if buf.len() > self.limits.max_initial_line_length {
                            return Err(CodecError::InvalidChunk);
                        }
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&buf[..pos])?;
                    buf.advance(pos + 2);
                    self.state = if size == 0 {
                        DecodeState::Trailers
                    } else {
                        DecodeState::ChunkData(size)
                    };
                }
                DecodeState::ChunkData(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let data = self.take_body(buf, remaining);
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::ChunkDataEnd
                    } else {
                        DecodeState::ChunkData(left)
                    };
                    return Ok(Some(HttpObject::Chunk(HttpChunk::new(data, false))));
                }
                DecodeState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(CodecError::InvalidChunk);
                    }
                    buf.advance(2);
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailers => {
                    let Some(pos) = find_crlf(buf) else {
                        if buf.len() > self.limits.max_header_size {
                            return Err(CodecError::HeadersTooLarge(self.limits.max_header_size));
                        }
                        return Ok(None);
                    };
                    buf.advance(pos + 2);
                    if pos == 0 {
                        self.state = DecodeState::Head;
                        return Ok(Some(HttpObject::Chunk(HttpChunk::last())));
                    }
                }
                DecodeState::UntilEof => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = buf.len().min(self.limits.max_chunk_size);
                    let data = buf.split_to(n).freeze();
                    return Ok(Some(HttpObject::Chunk(HttpChunk::new(data, false))));
                }
            }
        }
    }

    /// Decode after the peer closed its side; terminates read-until-EOF bodies.
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<HttpObject>, CodecError> {
        if let Some(object) = self.decode(buf)? {
            return Ok(Some(object));
        }
        match self.state {
            DecodeState::UntilEof => {
                self.state = DecodeState::Head;
                Ok(Some(HttpObject::Chunk(HttpChunk::last())))
            }
            DecodeState::Head if buf.iter().all(|b| b.is_ascii_whitespace()) => Ok(None),
            _ => Err(CodecError::UnexpectedEof),
        }
    }

    fn take_body(&self, buf: &mut BytesMut, remaining: u64) -> Bytes {
        let n = (buf.len() as u64)
            .min(remaining)
            .min(self.limits.max_chunk_size as u64) as usize;
        buf.split_to(n).freeze()
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<HttpObject>, CodecError> {
        // Stray CRLFs between messages are tolerated.
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let line_end = find_crlf(buf);
        match line_end {
            Some(pos) if pos > self.limits.max_initial_line_length => {
                return Err(CodecError::InitialLineTooLong(self.limits.max_initial_line_length));
            }
            None if buf.len() > self.limits.max_initial_line_length => {
                return Err(CodecError::InitialLineTooLong(self.limits.max_initial_line_length));
            }
            _ => {}
        }

        let Some(head_len) = find_head_end(buf) else {
            let line_len = line_end.map(|p| p + 2).unwrap_or(0);
            if buf.len() - line_len > self.limits.max_header_size {
                return Err(CodecError::HeadersTooLarge(self.limits.max_header_size));
            }
            return Ok(None);
        };
        let line_len = line_end.map(|p| p + 2).unwrap_or(0);
        if head_len - line_len > self.limits.max_header_size {
            return Err(CodecError::HeadersTooLarge(self.limits.max_header_size));
        }

        let object = if self.decodes_requests {
            HttpObject::Request(self.parse_request(&buf[..head_len])?)
        } else {
            HttpObject::Response(self.parse_response(&buf[..head_len])?)
        };
        buf.advance(head_len);
        Ok(Some(object))
    }

    fn parse_request(&mut self, head: &[u8]) -> Result<HttpRequest, CodecError> {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw);
        if req.parse(head)?.is_partial() {
            return Err(CodecError::InvalidHeader("incomplete request head".into()));
        }

        let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
            .map_err(|e| CodecError::InvalidHeader(e.to_string()))?;
        let uri = req.path.unwrap_or_default().to_string();
        let version = version_from(req.version);
        let headers = header_map(req.headers)?;

        let state = if method == Method::CONNECT {
            DecodeState::Head
        } else if headers.contains_key(TRANSFER_ENCODING) {
            if !is_transfer_chunked(&headers) {
                return Err(CodecError::InvalidHeader(
                    "request transfer-encoding must end with chunked".into(),
                ));
            }
            DecodeState::ChunkSize
        } else {
            match content_length(&headers)? {
                Some(len) if len > 0 => DecodeState::Fixed(len),
                _ => DecodeState::Head,
            }
        };

        self.state = state;
        Ok(HttpRequest {
            method,
            uri,
            version,
            headers,
            body: body_for(state),
        })
    }

    fn parse_response(&mut self, head: &[u8]) -> Result<HttpResponse, CodecError> {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut raw);
        if res.parse(head)?.is_partial() {
            return Err(CodecError::InvalidHeader("incomplete response head".into()));
        }

        let status = StatusCode::from_u16(res.code.unwrap_or_default())
            .map_err(|e| CodecError::InvalidHeader(e.to_string()))?;
        let reason = res
            .reason
            .filter(|r| Some(*r) != status.canonical_reason())
            .map(str::to_string);
        let version = version_from(res.version);
        let headers = header_map(res.headers)?;

        let method = self.request_methods.pop_front();
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            // The final response for this request is still to come.
            if let Some(method) = method.clone() {
                self.request_methods.push_front(method);
            }
        }

        let bodyless = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || method == Some(Method::HEAD)
            || (method == Some(Method::CONNECT) && status.is_success());

        let state = if bodyless {
            DecodeState::Head
        } else if headers.contains_key(TRANSFER_ENCODING) {
            if is_transfer_chunked(&headers) {
                DecodeState::ChunkSize
            } else {
                DecodeState::UntilEof
            }
        } else {
            match content_length(&headers)? {
                Some(0) => DecodeState::Head,
                Some(len) => DecodeState::Fixed(len),
                None => DecodeState::UntilEof,
            }
        };

        self.state = state;
        Ok(HttpResponse {
            version,
            status,
            reason,
            headers,
            body: body_for(state),
        })
    }

    /// Serialize `frame` into `dst`.
    pub fn encode(&mut self, frame: Frame, dst: &mut BytesMut) {
        match frame {
            Frame::Raw(bytes) => dst.put_slice(&bytes),
            Frame::Http(HttpObject::Request(request)) => {
                if !self.decodes_requests {
                    self.request_methods.push_back(request.method.clone());
                }
                dst.put_slice(request.method.as_str().as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(request.uri.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(version_str(request.version).as_bytes());
                dst.put_slice(b"\r\n");
                encode_headers(&request.headers, dst);
                self.encode_body(&request.headers, request.body, dst);
            }
            Frame::Http(HttpObject::Response(response)) => {
                dst.put_slice(version_str(response.version).as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(response.status.as_str().as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(response.reason_phrase().as_bytes());
                dst.put_slice(b"\r\n");
                encode_headers(&response.headers, dst);
                self.encode_body(&response.headers, response.body, dst);
            }
            Frame::Http(HttpObject::Chunk(chunk)) => {
                if !self.outbound_chunked {
                    dst.put_slice(&chunk.data);
                    return;
                }
                if !chunk.data.is_empty() {
                    dst.put_slice(format!("{:x}\r\n", chunk.data.len()).as_bytes());
                    dst.put_slice(&chunk.data);
                    dst.put_slice(b"\r\n");
                }
                if chunk.last {
                    dst.put_slice(b"0\r\n\r\n");
                    self.outbound_chunked = false;
                }
            }
        }
    }

    fn encode_body(&mut self, headers: &HeaderMap, body: Body, dst: &mut BytesMut) {
        match body {
            Body::Full(bytes) => {
                self.outbound_chunked = false;
                dst.put_slice(&bytes);
            }
            Body::Streaming => self.outbound_chunked = is_transfer_chunked(headers),
        }
    }
}

fn body_for(state: DecodeState) -> Body {
    if state == DecodeState::Head {
        Body::empty()
    } else {
        Body::Streaming
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, CodecError> {
    let line = std::str::from_utf8(line).map_err(|_| CodecError::InvalidChunk)?;
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| CodecError::InvalidChunk)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or(CodecError::InvalidContentLength)
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, CodecError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| CodecError::InvalidHeader(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| CodecError::InvalidHeader(e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

fn version_from(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}
