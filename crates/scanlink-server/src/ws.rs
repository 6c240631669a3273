//! WebSocket transport for relay connections.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::Instrument;

use scanlink_core::errors::RelayError;

use crate::relay::{ConnectionGuard, Flow, Relay};

/// Drive one upgraded socket from handshake to teardown.
pub async fn serve_socket(socket: WebSocket, relay: Arc<Relay>, code: String, role: String) {
    match relay.connect(&code, &role) {
        Ok((guard, rx)) => {
            let span = tracing::info_span!(
                "connection",
                session_code = %guard.code(),
                role = %guard.role(),
                connection_id = %guard.connection().id,
            );
            let idle_timeout = relay.settings().idle_timeout;
            run_connection(socket, guard, rx, idle_timeout)
                .instrument(span)
                .await;
        }
        Err(e) => reject(socket, &e, &code, &role).await,
    }
}

/// Close a socket that failed validation. Nothing was registered.
async fn reject(mut socket: WebSocket, error: &RelayError, code: &str, role: &str) {
    tracing::warn!(
        session_code = code,
        role,
        kind = error.error_kind(),
        error = %error,
        "rejecting connection"
    );
    let frame = CloseFrame {
        code: error.close_code(),
        reason: error.to_string().into(),
    };
    let _ = socket.send(WsMessage::Close(Some(frame))).await;
    let _ = socket.close().await;
}

async fn run_connection(
    socket: WebSocket,
    mut guard: ConnectionGuard,
    mut rx: mpsc::Receiver<String>,
    idle_timeout: std::time::Duration,
) {
    let conn = Arc::clone(guard.connection());
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the outbound queue until the connection is closed.
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    () = writer_conn.closed() => break,
                }
            }
            // Either side may have ended things; make sure the reader stops too.
            writer_conn.close();
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            let _ = ws_tx.close().await;
        }
        .in_current_span(),
    );

    loop {
        tokio::select! {
            biased;
            () = conn.closed() => {
                tracing::debug!("connection closed by relay");
                break;
            }
            next = tokio::time::timeout(idle_timeout, ws_rx.next()) => match next {
                Err(_) => guard.on_idle(),
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(error = %e, "transport error");
                    break;
                }
                Ok(Some(Ok(msg))) => match msg {
                    WsMessage::Text(text) => {
                        if guard.handle_text(text.as_str()) == Flow::Disconnect {
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(_) | WsMessage::Pong(_) => conn.touch(),
                    WsMessage::Binary(_) => tracing::debug!("ignoring binary frame"),
                },
            },
        }
    }

    // Teardown, then let the writer flush and close the socket.
    drop(guard);
    let _ = writer.await;
}
