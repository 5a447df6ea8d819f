//! HTTP/1.x wire handling.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → codec.rs (httparse heads, body chunking, size limits)
//!     → message.rs (HttpObject: Request | Response | Chunk)
//!     → proxy engine (state dispatch)
//!     → headers.rs (hop-by-hop stripping, Via, destination parsing)
//!     → codec.rs (serialize, chunk re-framing)
//!     → socket bytes
//!
//! responses.rs builds the 400/407/502/504 replies the proxy originates.
//! ```

pub mod codec;
pub mod headers;
pub mod message;
pub mod responses;

pub use codec::{CodecError, Frame, HttpCodec};
pub use message::{Body, HttpChunk, HttpObject, HttpRequest, HttpResponse};
