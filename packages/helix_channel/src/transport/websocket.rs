use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{
    Message,
    client::IntoClientRequest,
    http::{HeaderValue, header::AUTHORIZATION},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use super::{ConnectOptions, Endpoint, SESSION_HEADER, TransportLink, TransportStrategy};
use crate::auth::bearer;
use crate::error::TransportError;
use crate::protocol::Frame;

/// Open a websocket link and spawn its reader and writer pumps.
///
/// The writer pings every `ping_interval`; the reader gives up on the link
/// after `idle_timeout` without any inbound message, pongs included.
pub(super) async fn open(
    endpoint: &Endpoint,
    token: Option<&str>,
    options: &ConnectOptions,
) -> Result<TransportLink, TransportError> {
    let url = endpoint.websocket_url()?;
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&bearer(token))
            .map_err(|e| TransportError::Auth(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, response) = tokio_tungstenite::connect_async(request).await?;
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut ws_write, mut ws_read) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(options.link_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(options.link_capacity);
    let cancel = CancellationToken::new();
    let ping_interval = options.ping_interval.max(Duration::from_millis(1));
    let idle_timeout = options.idle_timeout;

    // Writer: drain outbound channel -> socket
    let writer_cancel = cancel.clone();
    let writer_errors = inbound_tx.clone();
    tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }
                _ = ping.tick() => {
                    if let Err(e) = ws_write.send(Message::Ping(Default::default())).await {
                        let _ = writer_errors.send(Err(e.into())).await;
                        writer_cancel.cancel();
                        break;
                    }
                }
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let json = match frame.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!(event = %frame.event, "failed to serialize frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                        let _ = writer_errors.send(Err(e.into())).await;
                        writer_cancel.cancel();
                        break;
                    }
                }
            }
        }
    });

    // Reader: socket -> inbound channel
    let reader_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                msg = tokio::time::timeout(idle_timeout, ws_read.next()) => {
                    let item = match msg {
                        Err(_) => Err(TransportError::Timeout(idle_timeout)),
                        Ok(Some(Ok(Message::Text(text)))) => Frame::from_json(&text)
                            .map_err(|e| TransportError::Malformed(e.to_string())),
                        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => Err(TransportError::Closed),
                        Ok(Some(Ok(_))) => continue,
                        Ok(Some(Err(e))) => Err(TransportError::from(e)),
                    };
                    let fatal = item.as_ref().is_err_and(TransportError::is_fatal);
                    if inbound_tx.send(item).await.is_err() || fatal {
                        break;
                    }
                }
            }
        }
        debug!("websocket reader stopped");
        reader_cancel.cancel();
    });

    Ok(TransportLink::new(
        session_id,
        TransportStrategy::WebSocket,
        outbound_tx,
        inbound_rx,
        cancel,
    ))
}
