//! Login request/reply against the Helix backend.
//!
//! `POST /api/auth/login` with `{email, password}` answers `{token, email, message}`
//! or, on failure, `{error}`. The token is fetched once and kept in memory for
//! the life of the process.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;

use helix_channel::{Endpoint, TokenProvider, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("login rejected: {0}")]
    Rejected(String),

    #[error("login failed with status {0}")]
    Status(reqwest::StatusCode),

    #[error("login server is unavailable")]
    Unavailable,

    #[error(transparent)]
    Request(reqwest::Error),

    #[error("cannot build login url: {0}")]
    Url(#[from] TransportError),
}

impl LoginError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Request(err)
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginReply {
    pub token: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

/// Pull the server's `{error}` message out of a failed reply body, if it has one.
fn rejection_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorReply>(body)
        .ok()
        .map(|reply| reply.error)
}

pub async fn login(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    email: &str,
    password: &str,
) -> Result<LoginReply, LoginError> {
    let url = endpoint.http_url(&["api", "auth", "login"])?;
    let response = client
        .post(url)
        .json(&LoginRequest { email, password })
        .send()
        .await
        .map_err(LoginError::from_reqwest)?;

    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(LoginError::from_reqwest);
    }

    let body = response.text().await.unwrap_or_default();
    match rejection_message(&body) {
        Some(message) => Err(LoginError::Rejected(message)),
        None => Err(LoginError::Status(status)),
    }
}

struct Credentials {
    client: reqwest::Client,
    endpoint: Endpoint,
    email: String,
    password: String,
    token: OnceCell<String>,
}

/// Logs in on first use and hands the cached token to every later dial.
#[derive(Clone)]
pub struct LoginTokenProvider {
    inner: Arc<Credentials>,
}

impl LoginTokenProvider {
    pub fn new(endpoint: Endpoint, email: String, password: String) -> Self {
        Self {
            inner: Arc::new(Credentials {
                client: reqwest::Client::new(),
                endpoint,
                email,
                password,
                token: OnceCell::new(),
            }),
        }
    }
}

impl std::fmt::Debug for LoginTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginTokenProvider")
            .field("email", &self.inner.email)
            .field("logged_in", &self.inner.token.initialized())
            .finish()
    }
}

impl TokenProvider for LoginTokenProvider {
    fn token(&self) -> BoxFuture<'static, Result<Option<String>, TransportError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let token = inner
                .token
                .get_or_try_init(|| async {
                    let reply = login(&inner.client, &inner.endpoint, &inner.email, &inner.password)
                        .await
                        .map_err(|e| TransportError::Auth(e.to_string()))?;
                    info!(
                        email = reply.email.as_deref().unwrap_or(inner.email.as_str()),
                        message = reply.message.as_deref().unwrap_or(""),
                        "logged in"
                    );
                    Ok::<_, TransportError>(reply.token)
                })
                .await?;
            Ok(Some(token.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_reads_error_field() {
        assert_eq!(
            rejection_message(r#"{"error":"Invalid credentials"}"#).as_deref(),
            Some("Invalid credentials")
        );
        assert_eq!(rejection_message("<html>502</html>"), None);
    }

    #[test]
    fn reply_tolerates_missing_extras() {
        let reply: LoginReply = serde_json::from_str(r#"{"token":"t"}"#).unwrap();
        assert_eq!(reply.token, "t");
        assert!(reply.email.is_none());
    }

    #[test]
    fn debug_hides_password() {
        let endpoint = Endpoint::parse("http://localhost:5000").unwrap();
        let provider = LoginTokenProvider::new(endpoint, "a@b.c".into(), "hunter2".into());
        let debug = format!("{:?}", provider);
        assert!(debug.contains("a@b.c"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_auth_error() {
        // Port 9 (discard) is closed on test machines.
        let endpoint = Endpoint::parse("http://127.0.0.1:9").unwrap();
        let provider = LoginTokenProvider::new(endpoint, "a@b.c".into(), "pw".into());
        let err = provider.token().await.unwrap_err();
        assert_eq!(err.error_code(), "auth_unavailable");
    }
}
