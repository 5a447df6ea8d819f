//! Error taxonomy for the proxy data path.
//!
//! # Responsibilities
//! - Classify every failure a connection can observe
//! - Map upstream failures onto the synthesized response the client receives
//!
//! # Design Decisions
//! - Upstream-leg failures never cross the leg boundary as errors; the client
//!   leg converts them into HTTP responses (see [`ProxyError::status`])
//! - Only transport-setup failures force-disconnect the owning connection

use http::StatusCode;

use crate::http::codec::CodecError;

/// Result alias used across the proxy engine.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failures observed by client and server connections.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The client sent a malformed initial message.
    #[error("malformed message from client: {0}")]
    ClientProtocol(#[source] CodecError),

    /// The destination host was blank or could not be resolved.
    #[error("unable to resolve destination '{0}'")]
    DestinationResolution(String),

    /// DNS, TCP or timeout failure while dialing upstream.
    #[error("failed to connect to {address}: {source}")]
    UpstreamConnect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The upstream sent a malformed response.
    #[error("malformed response from upstream: {0}")]
    UpstreamProtocol(#[source] CodecError),

    /// A chained proxy answered a CONNECT with a non-2xx status.
    #[error("upstream proxy refused CONNECT with {0}")]
    UpstreamRefused(StatusCode),

    /// No activity within the configured bound.
    #[error("connection idle for longer than {0:?}")]
    IdleTimeout(std::time::Duration),

    /// Missing or invalid proxy credentials.
    #[error("proxy authentication required")]
    AuthenticationRequired,

    /// The NTLM handshake with a chained proxy failed.
    #[error("NTLM handshake failed: {0}")]
    Ntlm(#[from] crate::proxy::ntlm::NtlmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code of the response synthesized on the client leg, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::ClientProtocol(_) => Some(StatusCode::BAD_REQUEST),
            ProxyError::DestinationResolution(_)
            | ProxyError::UpstreamConnect { .. }
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::UpstreamRefused(_)
            | ProxyError::Ntlm(_) => Some(StatusCode::BAD_GATEWAY),
            ProxyError::IdleTimeout(_) => Some(StatusCode::GATEWAY_TIMEOUT),
            ProxyError::AuthenticationRequired => Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            ProxyError::Io(_) => None,
        }
    }
}
