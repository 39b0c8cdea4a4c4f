//! Push channel: WebSocket subscribers receiving differential events.
//!
//! Each connection runs a writer task (drains the subscriber queue, pings
//! periodically) and a reader loop (liveness only; incoming frames are
//! discarded, pongs refresh the read deadline). Any read failure
//! unregisters the subscriber; a write failure closes the socket and lets
//! the reader's next error do the unregistering.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::header::{HOST, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;

use vigil_core::hub::Subscription;

use crate::auth;
use crate::config::PushSection;
use crate::state::ApiState;

/// Upgrade handler for the event push channel.
pub async fn event_push(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&headers) {
        debug!("push upgrade rejected: origin mismatch");
        return StatusCode::FORBIDDEN.into_response();
    }
    if let Err(err) = auth::check_push(&state, &headers).await {
        return err.into_response();
    }
    ws.max_message_size(state.push.max_frame_bytes)
        .protocols(["adcm"])
        .on_upgrade(move |socket| handle_push(socket, state))
}

/// A request without an `Origin` header is accepted; one with it must name
/// the same hostname as `Host`, ports ignored.
fn origin_allowed(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(ORIGIN).and_then(|value| value.to_str().ok()) else {
        return true;
    };
    let Some(host) = headers.get(HOST).and_then(|value| value.to_str().ok()) else {
        return false;
    };
    hostname(origin_authority(origin)) == hostname(host)
}

fn origin_authority(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}

fn hostname(authority: &str) -> &str {
    authority.split(':').next().unwrap_or(authority)
}

async fn handle_push(socket: WebSocket, state: ApiState) {
    let Ok(subscription) = state.hub.subscribe().await else {
        return;
    };
    let id = subscription.id;
    debug!("push subscriber {id} connected");

    let (sender, receiver) = socket.split();
    tokio::spawn(write_loop(sender, subscription, state.push.clone()));
    read_loop(receiver, Duration::from_secs(state.push.read_deadline_seconds)).await;

    // Unregistering closes the subscriber queue, which winds the writer down.
    state.hub.unsubscribe(id).await;
    debug!("push subscriber {id} disconnected");
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut subscription: Subscription,
    push: PushSection,
) {
    let write_deadline = Duration::from_secs(push.write_deadline_seconds);
    let mut ping = tokio::time::interval(Duration::from_secs(push.ping_interval_seconds));
    ping.tick().await; // the first tick fires immediately
    loop {
        let frame = tokio::select! {
            message = subscription.events.recv() => {
                let Some(message) = message else { break };
                match serde_json::to_string(&message) {
                    Ok(text) => Message::Text(text.into()),
                    Err(err) => {
                        debug!("event serialization failed: {err}");
                        continue;
                    }
                }
            }
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };
        match timeout(write_deadline, sender.send(frame)).await {
            Ok(Ok(())) => {}
            // Timed out or failed; close and let the reader unregister.
            _ => break,
        }
    }
    let _ = sender.close().await;
}

async fn read_loop(mut receiver: SplitStream<WebSocket>, read_deadline: Duration) {
    let mut deadline = Instant::now() + read_deadline;
    loop {
        match timeout_at(deadline, receiver.next()).await {
            // No pong within the deadline: the peer is gone.
            Err(_) => break,
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Pong(_)))) => {
                deadline = Instant::now() + read_deadline;
            }
            // Frames are liveness probes only; payloads are discarded.
            Ok(Some(Ok(_))) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(origin: Option<&str>, host: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(origin) = origin {
            map.insert(ORIGIN, HeaderValue::from_str(origin).unwrap());
        }
        if let Some(host) = host {
            map.insert(HOST, HeaderValue::from_str(host).unwrap());
        }
        map
    }

    #[test]
    fn absent_origin_is_accepted() {
        assert!(origin_allowed(&headers(None, Some("example.com:8020"))));
    }

    #[test]
    fn matching_hostname_is_accepted_ports_ignored() {
        assert!(origin_allowed(&headers(
            Some("http://example.com:3000"),
            Some("example.com:8020"),
        )));
        assert!(origin_allowed(&headers(
            Some("https://example.com"),
            Some("example.com"),
        )));
    }

    #[test]
    fn foreign_hostname_is_rejected() {
        assert!(!origin_allowed(&headers(
            Some("http://evil.example.net"),
            Some("example.com:8020"),
        )));
        assert!(!origin_allowed(&headers(Some("http://example.com"), None)));
    }
}
