//! `/ws/{session_id}`: one WebSocket per research session.

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use storm_core::ids::SessionId;
use storm_core::messages::OutboundMessage;

use crate::server::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = SessionId::from_raw(session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, session, state))
}

async fn handle_socket(socket: WebSocket, session: SessionId, state: AppState) {
    let mut rx = match state.registry.register(session.clone()) {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(session_id = %session, error = %e, "rejecting WebSocket");
            reject(socket, &e.to_string()).await;
            return;
        }
    };
    tracing::info!(session_id = %session, "WebSocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: queued envelopes plus periodic pings. Ends when the registry drops the session.
    let ping_every = state.config.ping_interval();
    let writer_session = session.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(session_id = %writer_session, "sent ping");
                }
            }
        }
    });

    let reader_session = session.clone();
    let broker = state.broker.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => match broker.deliver_message(&reader_session, text.as_str()) {
                    Ok(true) => tracing::debug!(session_id = %reader_session, "answer delivered"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(session_id = %reader_session, error = %e, "dropping malformed frame"),
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    if state.registry.unregister(&session) {
        tracing::info!(session_id = %session, "WebSocket disconnected");
    }
}

async fn reject(mut socket: WebSocket, reason: &str) {
    if let Ok(text) = OutboundMessage::error(reason).to_json() {
        let _ = socket.send(WsMessage::Text(text.into())).await;
    }
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.to_owned().into(),
        })))
        .await;
}
