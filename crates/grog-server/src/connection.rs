//! Drives one viewer WebSocket: a writer draining the session's outbound
//! queue, a reader applying cursor updates, and the keepalive ping.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::KeepaliveConfig;
use crate::engine::Engine;
use crate::error::SessionError;
use crate::keepalive::run_keepalive;
use crate::session::{CloseReason, Outbound};

/// How long the writer gets to flush the close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// WebSocket close code sent for each close reason.
pub fn close_code(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::ProtocolViolation => 1008,
        CloseReason::Shutdown | CloseReason::KeepaliveTimeout => 1001,
        CloseReason::Backlogged => 1013,
        CloseReason::TransportError => 1011,
        CloseReason::PeerClosed => 1000,
    }
}

/// Serve a viewer until its session closes or the server shuts down.
pub async fn handle_ws_connection(
    socket: WebSocket,
    engine: Arc<Engine>,
    keepalive: KeepaliveConfig,
    shutdown: CancellationToken,
) {
    let (session, mut rx) = engine.open_session();
    let _ = engine.refresh_session_async(&session).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => frame,
                () = writer_session.closed() => break,
            };
            let msg = match frame {
                Some(Outbound::Window(json)) => WsMessage::Text(json.into()),
                Some(Outbound::Ping) => WsMessage::Ping(Default::default()),
                None => break,
            };
            if let Err(e) = ws_tx.send(msg).await {
                debug!(session_id = %writer_session.id(), error = %e, "websocket send failed");
                writer_session.close(CloseReason::TransportError);
                break;
            }
        }

        let reason = writer_session
            .close_reason()
            .unwrap_or(CloseReason::TransportError);
        if reason != CloseReason::TransportError {
            let frame = CloseFrame {
                code: close_code(reason),
                reason: reason.as_str().into(),
            };
            let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
        }
        let _ = ws_tx.close().await;
    });

    let reader_session = Arc::clone(&session);
    let reader_engine = Arc::clone(&engine);
    let reader = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => msg,
                () = reader_session.closed() => break,
            };
            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    match reader_session.set_cursor(text.as_str()) {
                        Ok(_) => {
                            let _ = reader_engine.refresh_session_async(&reader_session).await;
                        }
                        Err(SessionError::ProtocolViolation(detail)) => {
                            warn!(session_id = %reader_session.id(), detail = %detail, "invalid cursor");
                            break;
                        }
                        Err(_) => break,
                    }
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!(session_id = %reader_session.id(), "binary frame from viewer");
                    reader_session.close(CloseReason::ProtocolViolation);
                    break;
                }
                Some(Ok(WsMessage::Pong(_))) => reader_session.record_pong(),
                Some(Ok(WsMessage::Ping(_))) => {} // axum answers pings
                Some(Ok(WsMessage::Close(_))) | None => {
                    reader_session.close(CloseReason::PeerClosed);
                    break;
                }
                Some(Err(e)) => {
                    debug!(session_id = %reader_session.id(), error = %e, "websocket read failed");
                    reader_session.close(CloseReason::TransportError);
                    break;
                }
            }
        }
    });

    let keepalive_task = tokio::spawn(run_keepalive(Arc::clone(&session), keepalive));

    tokio::select! {
        () = session.closed() => {}
        () = shutdown.cancelled() => {
            session.close(CloseReason::Shutdown);
        }
    }

    keepalive_task.abort();
    reader.abort();
    let writer_abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        debug!(session_id = %session.id(), "writer did not drain, aborting");
        writer_abort.abort();
    }

    engine.release_session(&session);
}
