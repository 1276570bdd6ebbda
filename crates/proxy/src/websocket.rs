//! WebSocket proxying: bridge an upgraded client connection to an
//! upstream WebSocket, relaying frames both ways until either side
//! closes. Frame payload sizes feed the usage guard, which emits the
//! usage event when the bridge ends.

use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket};
use axum::http::HeaderMap;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as UpstreamMessage;

use tollgate_core::usage::DeferredUsage;

/// Relay frames between the client and the upstream until either side
/// closes or errors. `on_connected` runs once the upstream accepts the
/// handshake — admission bookkeeping (quota) hangs off it, so a failed
/// connect is never charged. Cancellation is inherent: dropping the
/// returned future tears down both connections.
pub async fn bridge(
    client: WebSocket,
    upstream_url: String,
    headers: HeaderMap,
    mut usage: DeferredUsage,
    on_connected: impl Future<Output = ()> + Send,
) {
    let mut request = match upstream_url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(url = %upstream_url, error = %e, "invalid upstream websocket url");
            usage.set_error("upstream_unavailable");
            return;
        }
    };
    for (name, value) in &headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let (upstream, _response) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(url = %upstream_url, error = %e, "upstream websocket connect failed");
            usage.set_error("upstream_unavailable");
            return;
        }
    };
    on_connected.await;

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            inbound = client_rx.next() => match inbound {
                Some(Ok(message)) => {
                    usage.add_bytes_in(payload_len_client(&message));
                    let closing = matches!(message, ClientMessage::Close(_));
                    if upstream_tx.send(to_upstream(message)).await.is_err() || closing {
                        break;
                    }
                }
                _ => {
                    // Client went away; tell the upstream and stop.
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            },
            outbound = upstream_rx.next() => match outbound {
                Some(Ok(UpstreamMessage::Frame(_))) => {}
                Some(Ok(message)) => {
                    usage.add_bytes_out(payload_len_upstream(&message));
                    let closing = matches!(message, UpstreamMessage::Close(_));
                    if client_tx.send(to_client(message)).await.is_err() || closing {
                        break;
                    }
                }
                _ => {
                    let _ = client_tx.send(ClientMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

fn payload_len_client(message: &ClientMessage) -> u64 {
    match message {
        ClientMessage::Text(t) => t.as_str().len() as u64,
        ClientMessage::Binary(b) => b.len() as u64,
        _ => 0,
    }
}

fn payload_len_upstream(message: &UpstreamMessage) -> u64 {
    match message {
        UpstreamMessage::Text(t) => t.as_str().len() as u64,
        UpstreamMessage::Binary(b) => b.len() as u64,
        _ => 0,
    }
}

fn to_upstream(message: ClientMessage) -> UpstreamMessage {
    match message {
        ClientMessage::Text(t) => UpstreamMessage::text(t.as_str()),
        ClientMessage::Binary(b) => UpstreamMessage::Binary(b),
        ClientMessage::Ping(p) => UpstreamMessage::Ping(p),
        ClientMessage::Pong(p) => UpstreamMessage::Pong(p),
        ClientMessage::Close(frame) => {
            UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().into(),
            }))
        }
    }
}

fn to_client(message: UpstreamMessage) -> ClientMessage {
    match message {
        UpstreamMessage::Text(t) => ClientMessage::Text(t.as_str().into()),
        UpstreamMessage::Binary(b) => ClientMessage::Binary(b),
        UpstreamMessage::Ping(p) => ClientMessage::Ping(p),
        UpstreamMessage::Pong(p) => ClientMessage::Pong(p),
        UpstreamMessage::Close(frame) => {
            ClientMessage::Close(frame.map(|f| ClientCloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().into(),
            }))
        }
        // Raw frames never surface from a read loop.
        UpstreamMessage::Frame(_) => ClientMessage::Binary(bytes::Bytes::new()),
    }
}
