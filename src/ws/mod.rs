// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Per-connection message pump.
//!
//! Runs after the front end has admitted the session and finished the
//! handshake: forwards `data` frames into the session's write queue,
//! relays session fan-out to the socket, and services the control-plane
//! messages (`force_cleanup`, `admin_cleanup`).

pub mod message;

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::reassembly::MAX_PACKET_LEN;
use crate::session::{SessionHandle, SessionManager, WsOutbound};
use crate::ws::message::{AdminAction, ClientMessage, ServerMessage};
use crate::Result;

/// Outcome of one inbound frame.
enum Flow {
    Continue,
    Close,
}

/// Drive one attached WebSocket until either side closes.
///
/// `outbound_rx` is the channel the session fans out on; `outbound_tx` is
/// the handler's own clone of its sending side, used to report write
/// failures that settle asynchronously. Detaches from the session on every
/// exit path.
pub async fn pump(
    ws: WebSocketStream<TcpStream>,
    session: SessionHandle,
    manager: SessionManager,
    peer_id: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<WsOutbound>,
    outbound_tx: mpsc::UnboundedSender<WsOutbound>,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();

    'pump: loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(WsOutbound::Frame(frame)) => {
                    let text = serde_json::to_string(&frame)?;
                    if sink.send(Message::Text(text)).await.is_err() {
                        break 'pump;
                    }
                }
                Some(WsOutbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break 'pump;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let (replies, flow) =
                        handle_frame(&text, &session, &manager, &outbound_tx).await;
                    for frame in replies {
                        let text = serde_json::to_string(&frame)?;
                        if sink.send(Message::Text(text)).await.is_err() {
                            break 'pump;
                        }
                    }
                    if matches!(flow, Flow::Close) {
                        let _ = sink.send(Message::Close(None)).await;
                        break 'pump;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let frame = ServerMessage::error("binary frames are not supported");
                    let _ = sink.send(Message::Text(serde_json::to_string(&frame)?)).await;
                }
                Some(Ok(Message::Close(_))) | None => break 'pump,
                Some(Ok(_)) => {} // ping/pong handled by the library
                Some(Err(err)) => {
                    debug!("ws {} read error: {}", peer_id, err);
                    break 'pump;
                }
            },
        }
    }

    session.detach(peer_id);
    Ok(())
}

/// Parse and dispatch one text frame; returns the frames to reply with
/// and whether the connection should close.
async fn handle_frame(
    text: &str,
    session: &SessionHandle,
    manager: &SessionManager,
    outbound_tx: &mpsc::UnboundedSender<WsOutbound>,
) -> (Vec<ServerMessage>, Flow) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("unparseable ws frame: {}", err);
            return (
                vec![ServerMessage::error(format!("Protocol error: {err}"))],
                Flow::Continue,
            );
        }
    };

    match parsed {
        ClientMessage::Data { data } => {
            if data.is_empty() || data.len() > MAX_PACKET_LEN {
                return (
                    vec![ServerMessage::error(format!(
                        "Protocol error: data frame of {} bytes (1..={} allowed)",
                        data.len(),
                        MAX_PACKET_LEN
                    ))],
                    Flow::Continue,
                );
            }
            // Queue position is taken here, keeping client frames FIFO;
            // the outcome settles later without stalling this pump.
            let settled = session.enqueue_write(data);
            let report = outbound_tx.clone();
            tokio::spawn(async move {
                let failure = match settled.await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some(crate::Error::SessionClosed.to_string()),
                };
                if let Some(message) = failure {
                    let _ = report.send(WsOutbound::Frame(ServerMessage::error(message)));
                }
            });
            (Vec::new(), Flow::Continue)
        }
        ClientMessage::ForceCleanup { .. } => {
            // Kept for wire compatibility only; the fast path it used to
            // trigger leaves zombies behind. Treat as ordinary disconnect.
            (
                vec![ServerMessage::ForceCleanupComplete {
                    message: "disconnecting".to_string(),
                    warning: Some(
                        "force cleanup is unreliable; rely on ordinary disconnect".to_string(),
                    ),
                }],
                Flow::Close,
            )
        }
        ClientMessage::AdminCleanup { auth, action } => {
            let authorized = manager
                .config()
                .admin_token
                .as_deref()
                .is_some_and(|token| token == auth);
            if !authorized {
                return (
                    vec![ServerMessage::error("Unauthorized")],
                    Flow::Continue,
                );
            }
            match action {
                AdminAction::CleanupAll => {
                    // The ack must go out before cleanup closes this very
                    // connection.
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        manager.force_cleanup_all("admin cleanup").await;
                    });
                    (
                        vec![ServerMessage::AdminCleanupComplete {
                            message: "cleaning up all sessions".to_string(),
                        }],
                        Flow::Continue,
                    )
                }
            }
        }
        ClientMessage::RpcRequest { rpc_id, method, .. } => (
            vec![ServerMessage::rpc_error(
                &rpc_id,
                &method,
                "rpc_request is only valid as the first frame of an rpc upgrade",
            )],
            Flow::Continue,
        ),
    }
}
