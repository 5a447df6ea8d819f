//! NTLM authentication towards a chained proxy.
//!
//! The three-message exchange runs once per server connection:
//!
//! ```text
//! proxy ── request + Proxy-Authorization: NTLM <type1> ──▶ upstream
//! proxy ◀── 407 + Proxy-Authenticate: NTLM <type2> ─────── upstream
//! proxy ── request + Proxy-Authorization: NTLM <type3> ──▶ upstream
//! ```
//!
//! Message construction is delegated to an [`NtlmProvider`]; this module only
//! enforces the ordering.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::http::HttpResponse;

const SCHEME: &str = "NTLM";

/// Produces and consumes raw NTLM messages.
pub trait NtlmProvider: Send + Sync {
    /// Negotiation message.
    fn type1(&self) -> Vec<u8>;

    /// Accept the server challenge.
    fn set_type2(&self, challenge: &[u8]) -> Result<(), String>;

    /// Final authentication message, computed from the stored challenge.
    fn type3(&self) -> Vec<u8>;
}

#[derive(Debug, thiserror::Error)]
pub enum NtlmError {
    #[error("type 1 message written after the challenge was received")]
    Type2AlreadyReceived,
    #[error("type 3 message requested before the challenge was received")]
    Type2NotReceived,
    #[error("expected 407 from upstream proxy, got {0}")]
    UnexpectedStatus(StatusCode),
    #[error("upstream proxy did not offer an NTLM challenge")]
    NotNtlmChallenge,
    #[error("upstream proxy closed the connection during the handshake")]
    ProxyConnectionClosed,
    #[error("challenge is not valid base64: {0}")]
    InvalidChallenge(#[from] base64::DecodeError),
    #[error("provider rejected the challenge: {0}")]
    Provider(String),
}

/// Sequencing state for one handshake.
pub struct NtlmHandshake<'a> {
    provider: &'a dyn NtlmProvider,
    type2_received: bool,
}

impl<'a> NtlmHandshake<'a> {
    pub fn new(provider: &'a dyn NtlmProvider) -> Self {
        Self {
            provider,
            type2_received: false,
        }
    }

    pub fn write_type1(&mut self, headers: &mut HeaderMap) -> Result<(), NtlmError> {
        if self.type2_received {
            return Err(NtlmError::Type2AlreadyReceived);
        }
        set_authorization(headers, &self.provider.type1());
        Ok(())
    }

    pub fn read_type2(&mut self, response: &HttpResponse) -> Result<(), NtlmError> {
        if self.type2_received {
            return Err(NtlmError::Type2AlreadyReceived);
        }
        if response.status != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(NtlmError::UnexpectedStatus(response.status));
        }
        let challenge = response
            .headers
            .get_all(PROXY_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(ntlm_token)
            .ok_or(NtlmError::NotNtlmChallenge)?;

        let decoded = STANDARD.decode(challenge)?;
        self.provider
            .set_type2(&decoded)
            .map_err(NtlmError::Provider)?;
        self.type2_received = true;
        Ok(())
    }

    pub fn write_type3(&mut self, headers: &mut HeaderMap) -> Result<(), NtlmError> {
        if !self.type2_received {
            return Err(NtlmError::Type2NotReceived);
        }
        set_authorization(headers, &self.provider.type3());
        Ok(())
    }
}

/// The token after `NTLM `, if the challenge uses that scheme.
fn ntlm_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case(SCHEME) && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

fn set_authorization(headers: &mut HeaderMap, message: &[u8]) {
    let value = format!("{} {}", SCHEME, STANDARD.encode(message));
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(PROXY_AUTHORIZATION, value);
    }
}
