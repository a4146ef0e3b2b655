//! WebSocket transport for the connection protocol
//!
//! Each socket gets a writer task draining the connection's outbound queue
//! and a reader task forwarding text frames. The connection loop hands those
//! frames to the protocol one at a time and stops as soon as either task
//! ends, even while a frame is still being handled.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ConnectionProtocol;
use crate::registry::{ConnectionHandle, Outbound};
use crate::state::AppState;

/// WebSocket upgrade for browser clients
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let source = client_ip(&headers, peer);
    debug!("WebSocket upgrade requested from {} (peer {})", source, peer);
    ws.on_upgrade(move |socket| handle_socket(socket, state, source))
}

/// Frames read ahead of the protocol
const INBOUND_QUEUE: usize = 32;

/// Client address: the peer, or the first hop of `X-Forwarded-For` when the
/// peer is a proxy on this host
///
/// IPv4-mapped IPv6 addresses are reported in dotted form so they match ARP
/// table entries.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let peer_ip = peer.ip().to_canonical();
    if !peer_ip.is_loopback() {
        if headers.contains_key("x-forwarded-for") {
            debug!("Ignoring X-Forwarded-For from non-local peer {}", peer_ip);
        }
        return peer_ip.to_string();
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());

    match forwarded {
        Some(hop) => match hop.parse::<IpAddr>() {
            Ok(ip) => ip.to_canonical().to_string(),
            Err(_) => hop.trim_start_matches("::ffff:").to_string(),
        },
        None => peer_ip.to_string(),
    }
}

/// Run one WebSocket until either side goes away
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, source: String) {
    let (sender, receiver) = socket.split();
    serve_connection(sender, receiver, state, source).await;
}

/// Drive the protocol for one connection over a message sink and stream
pub async fn serve_connection<S, R, E>(sender: S, mut receiver: R, state: Arc<AppState>, source: String)
where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (handle, mut outbound) = ConnectionHandle::channel();
    let mut protocol = ConnectionProtocol::open(state, handle, &source).await;

    let mut writer = tokio::spawn(async move {
        let mut sender = sender;
        write_loop(&mut sender, &mut outbound).await;
    });

    let (inbound_tx, mut inbound) = mpsc::channel::<String>(INBOUND_QUEUE);
    let reader_source = source.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    debug!("Ignoring binary frame from {}", reader_source);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket receive error from {}: {}", reader_source, e);
                    break;
                }
            }
        }
    });

    loop {
        let text = tokio::select! {
            text = inbound.recv() => match text {
                Some(text) => text,
                None => break,
            },
            // Writer finished: the server closed the socket or it failed
            _ = &mut writer => break,
        };

        tokio::select! {
            _ = protocol.handle_text(&text) => {}
            _ = &mut reader => {
                debug!("{} went away while a frame was in progress", source);
                break;
            }
            _ = &mut writer => break,
        }
    }

    protocol.close().await;
    reader.abort();
    writer.abort();
}

async fn write_loop<S>(sender: &mut S, outbound: &mut mpsc::UnboundedReceiver<Outbound>)
where
    S: SinkExt<Message> + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        match msg {
            Outbound::Frame(frame) => {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize frame: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    return;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                return;
            }
        }
    }
}
