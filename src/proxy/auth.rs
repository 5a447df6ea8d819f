//! Basic proxy authentication.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::config::AuthenticationConfig;

/// Decides whether client credentials are acceptable.
pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;

    /// Realm advertised in the 407 challenge.
    fn realm(&self) -> &str;
}

/// Single username/password pair from configuration.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    username: String,
    password: String,
    realm: String,
}

impl StaticAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
        }
    }

    pub fn from_config(config: &AuthenticationConfig) -> Self {
        Self::new(&config.username, &config.password, &config.realm)
    }
}

impl ProxyAuthenticator for StaticAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

/// Decode a `Basic <base64(user:pass)>` credential.
///
/// The password is everything after the first `:`.
pub fn decode_basic(value: &str) -> Option<(String, String)> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = match STANDARD.decode(token.trim()) {
        Ok(decoded) => decoded,
        Err(error) => {
            tracing::debug!(error = %error, "Could not decode proxy credentials");
            return None;
        }
    };
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// `Basic <base64(user:pass)>`.
pub fn encode_basic(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}
