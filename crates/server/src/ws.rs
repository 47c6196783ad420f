//! WebSocket handler for real-time relaying.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::hub::Hub;
use crate::registry::{ConnectionHandle, Frame};
use crate::state::AppState;

/// WebSocket upgrade handler. Mounted as the router fallback, so any path
/// upgrades.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();

    ws.max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_failed_upgrade(|e| tracing::warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

/// How long the writer gets to flush the closing handshake once the reader
/// has stopped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Drive one connection from admission to removal.
async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (transport, outgoing_rx) = hub.open_transport();
    let handle = hub.on_connect(transport).await;

    let (ws_sink, ws_stream) = socket.split();
    let (reader_done_tx, reader_done_rx) = oneshot::channel::<()>();
    let mut send_task = tokio::spawn(forward_outgoing(
        ws_sink,
        outgoing_rx,
        hub.shutdown_signal(),
        reader_done_rx,
    ));

    // Whichever side stops first ends the connection.
    let reader_stopped = tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(conn = %handle.id(), "Writer stopped");
            false
        }
        _ = process_incoming(ws_stream, &handle, &hub) => {
            tracing::debug!(conn = %handle.id(), "Reader stopped");
            true
        }
    };

    handle.mark_closing();

    if reader_stopped {
        // Let the writer complete the closing handshake before dropping it.
        let _ = reader_done_tx.send(());
        if timeout(CLOSE_TIMEOUT, &mut send_task).await.is_err() {
            tracing::debug!(conn = %handle.id(), "Writer did not finish closing in time");
            send_task.abort();
        }
    }

    hub.on_disconnect(&handle).await;
}

/// Forward queued frames to the socket until it fails, the reader stops or
/// the hub shuts down.
async fn forward_outgoing(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
    mut reader_done: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            frame = outgoing_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_sink.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            _ = &mut reader_done => {
                // Flushes the close reply queued when the peer's Close arrived.
                let _ = ws_sink.close().await;
                return;
            }
        }
    }

    let close = CloseFrame {
        code: close_code::AWAY,
        reason: Utf8Bytes::from_static("server shutting down"),
    };
    let _ = ws_sink.send(Message::Close(Some(close))).await;
}

/// Read frames until the peer closes or the transport errors.
async fn process_incoming(
    mut ws_stream: SplitStream<WebSocket>,
    handle: &ConnectionHandle,
    hub: &Hub,
) {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                hub.on_message(handle, text).await;
            }
            Ok(Message::Binary(bytes)) => match Utf8Bytes::try_from(bytes) {
                Ok(text) => {
                    hub.on_message(handle, text).await;
                }
                Err(_) => {
                    tracing::debug!(conn = %handle.id(), "Discarding non-UTF-8 binary frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn = %handle.id(), "Read error: {}", e);
                break;
            }
        }
    }
}
