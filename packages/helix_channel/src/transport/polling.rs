//! HTTP long-polling fallback.
//!
//! `GET /poll/handshake` returns `{"sid": ...}`. After that the reader keeps one
//! `GET /poll?sid=` outstanding (the server holds it until it has frames, or
//! answers 204 when its hold window expires) and the writer issues one
//! `POST /poll?sid=` per outbound frame.
//!
//! Every poll and post is bounded by the idle timeout, so the server's hold
//! window must be shorter than it. A poll that outlives it is link loss.
//! After a malformed batch the reader waits one initial backoff delay before
//! polling again.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ConnectOptions, Endpoint, TransportLink, TransportStrategy};
use crate::error::TransportError;
use crate::protocol::Frame;

#[derive(Debug, Deserialize)]
struct Handshake {
    sid: String,
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn request_error(err: reqwest::Error, limit: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(limit)
    } else {
        TransportError::from(err)
    }
}

/// The server forgot the session: treat as a clean close.
fn session_gone(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

pub(super) async fn open(
    client: &Client,
    endpoint: &Endpoint,
    token: Option<String>,
    options: &ConnectOptions,
) -> Result<TransportLink, TransportError> {
    let handshake_url = endpoint.polling_handshake_url()?;
    let poll_url = endpoint.polling_url()?;

    let response = authorize(client.get(handshake_url), token.as_deref())
        .send()
        .await?;
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(TransportError::Auth("handshake rejected".to_string()));
    }
    let handshake: Handshake = response
        .error_for_status()?
        .json()
        .await
        .map_err(|e| TransportError::Connect(format!("bad handshake: {}", e)))?;
    let sid = handshake.sid;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(options.link_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(options.link_capacity);
    let cancel = CancellationToken::new();
    let idle_timeout = options.idle_timeout;
    let retry_delay = options.reconnection.initial();

    // Writer: one POST per frame
    let writer_cancel = cancel.clone();
    let writer_errors = inbound_tx.clone();
    let writer_client = client.clone();
    let writer_url = poll_url.clone();
    let writer_sid = sid.clone();
    let writer_token = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let request = writer_client
                        .post(writer_url.clone())
                        .query(&[("sid", writer_sid.as_str())])
                        .timeout(idle_timeout)
                        .json(&frame);
                    let sent = authorize(request, writer_token.as_deref())
                        .send()
                        .await
                        .and_then(|r| r.error_for_status());
                    if let Err(e) = sent {
                        let _ = writer_errors.send(Err(request_error(e, idle_timeout))).await;
                        writer_cancel.cancel();
                        break;
                    }
                }
            }
        }
    });

    // Reader: long-poll loop
    let reader_cancel = cancel.clone();
    let reader_client = client.clone();
    let reader_sid = sid.clone();
    tokio::spawn(async move {
        loop {
            let request = reader_client
                .get(poll_url.clone())
                .query(&[("sid", reader_sid.as_str())])
                .timeout(idle_timeout);
            let request = authorize(request, token.as_deref());

            let response = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                r = request.send() => r,
            };

            let batch = match poll_batch(response, idle_timeout).await {
                Ok(batch) => batch,
                Err(e) => {
                    let fatal = e.is_fatal();
                    if inbound_tx.send(Err(e)).await.is_err() || fatal {
                        break;
                    }
                    tokio::select! {
                        _ = reader_cancel.cancelled() => break,
                        _ = tokio::time::sleep(retry_delay) => continue,
                    }
                }
            };
            let mut receiver_gone = false;
            for frame in batch {
                if inbound_tx.send(Ok(frame)).await.is_err() {
                    receiver_gone = true;
                    break;
                }
            }
            if receiver_gone {
                break;
            }
        }
        debug!(sid = %reader_sid, "polling reader stopped");
        reader_cancel.cancel();
    });

    Ok(TransportLink::new(
        sid,
        TransportStrategy::Polling,
        outbound_tx,
        inbound_rx,
        cancel,
    ))
}

async fn poll_batch(
    response: Result<reqwest::Response, reqwest::Error>,
    idle_timeout: Duration,
) -> Result<Vec<Frame>, TransportError> {
    let response = response.map_err(|e| request_error(e, idle_timeout))?;
    let status = response.status();
    if session_gone(status) {
        return Err(TransportError::Closed);
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }
    let response = response
        .error_for_status()
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let body = response
        .bytes()
        .await
        .map_err(|e| request_error(e, idle_timeout))?;
    serde_json::from_slice::<Vec<Frame>>(&body)
        .map_err(|e| TransportError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gone_statuses() {
        assert!(session_gone(StatusCode::NOT_FOUND));
        assert!(session_gone(StatusCode::GONE));
        assert!(!session_gone(StatusCode::OK));
        assert!(!session_gone(StatusCode::NO_CONTENT));
    }

    #[test]
    fn handshake_shape() {
        let handshake: Handshake = serde_json::from_str(r#"{"sid":"abc","extra":1}"#).unwrap();
        assert_eq!(handshake.sid, "abc");
    }
}
