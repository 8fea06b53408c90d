//! Token attachment for the connect handshake.
//!
//! Issuing tokens is somebody else's job (a login request/reply against the
//! backend). The channel only asks a [`TokenProvider`] for the current token
//! each time it dials, so a refreshed token is picked up on the next retry.

use futures::future::BoxFuture;

use crate::error::TransportError;

pub trait TokenProvider: Send + Sync {
    /// The bearer token to attach, or `None` to connect anonymously.
    fn token(&self) -> BoxFuture<'static, Result<Option<String>, TransportError>>;
}

/// A token known up front (config file, CLI flag).
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> BoxFuture<'static, Result<Option<String>, TransportError>> {
        let token = self.0.clone();
        Box::pin(async move { Ok(Some(token)) })
    }
}

/// Format the `Authorization` header value for a token.
pub(crate) fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}
