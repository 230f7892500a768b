//! WebSocket transport: one socket per user session.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::error::AppResult;
use crate::session::{
    parse_user_id, protocol::MAX_MESSAGE_SIZE, Dispatcher, Envelope, EventType, Session, SessionState,
    UserId,
};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    user_id: String,
}

/// WebSocket upgrade handler; the user id is checked before upgrading
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    let user_id = parse_user_id(&params.user_id)?;
    info!(user_id = %user_id, "WebSocket upgrade request");
    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, user_id, state)))
}

async fn handle_websocket(socket: WebSocket, user_id: UserId, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let config = state.config.session.clone();

    let (tx, mut rx) = mpsc::channel::<Envelope>(config.outbox_capacity);
    let session = match state.registry.connect(&user_id.to_string(), tx) {
        Ok(session) => session,
        Err(e) => {
            error!(user_id = %user_id, "Failed to register session: {}", e);
            return;
        }
    };

    let mut state_rx = session.subscribe();
    let write_timeout = config.write_timeout;
    let heartbeat = config.heartbeat_interval;

    // Outbox -> socket, plus heartbeat pings
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;

        loop {
            let frame = tokio::select! {
                next = rx.recv() => match next {
                    Some(envelope) => match envelope.to_json() {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            warn!("Failed to encode {} event: {}", envelope.kind, e);
                            continue;
                        }
                    },
                    None => break,
                },
                _ = ticker.tick() => Message::Ping(Vec::new()),
                changed = state_rx.changed() => {
                    let closing = !matches!(*state_rx.borrow(), SessionState::Connecting | SessionState::Active);
                    if changed.is_err() || closing {
                        break;
                    }
                    continue;
                }
            };

            match timeout(write_timeout, ws_sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(user_id = %user_id, "Socket write failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(user_id = %user_id, "Socket write timed out");
                    break;
                }
            }
        }

        let _ = timeout(write_timeout, ws_sender.send(Message::Close(None))).await;
        debug!("Send task ended for user {}", user_id);
    });

    let reader_session = session.clone();
    let dispatcher = state.dispatcher.clone();
    let read_timeout = config.read_timeout;

    // Socket -> relay
    let mut recv_task = tokio::spawn(async move {
        loop {
            let msg = match timeout(read_timeout, ws_receiver.next()).await {
                Err(_) => {
                    warn!(user_id = %user_id, "No frames for {:?}, closing", read_timeout);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(user_id = %user_id, "Socket read failed: {}", e);
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            reader_session.touch();
            match msg {
                Message::Text(text) => handle_client_text(&text, &reader_session, &dispatcher),
                Message::Binary(_) => {
                    warn!(user_id = %user_id, "Binary frames are not supported");
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", user_id);
                    break;
                }
                // Pong is handled automatically
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        debug!("Receive task ended for user {}", user_id);
    });

    let writer_finished = tokio::select! {
        _ = &mut send_task => true,
        _ = &mut recv_task => false,
    };

    // Cleanup
    state.registry.release(&session);
    if writer_finished {
        recv_task.abort();
    } else if timeout(write_timeout, &mut send_task).await.is_err() {
        send_task.abort();
    }
    session.finish();
    info!(user_id = %user_id, "Session {} disconnected", session.session_id());
}

/// Handle one text frame from a client
fn handle_client_text(text: &str, session: &Arc<Session>, dispatcher: &Dispatcher) {
    let user_id = session.user_id();
    let envelope = match Envelope::from_client_text(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(user_id = %user_id, "Discarding malformed frame: {}", e);
            return;
        }
    };

    match envelope.kind {
        EventType::Ping => {
            if let Err(e) = session.try_push(Envelope::pong(user_id)) {
                debug!(user_id = %user_id, "Pong not queued: {}", e);
            }
        }
        kind if kind.is_client_relayable() => match envelope.recipient {
            Some(recipient) if recipient != user_id => dispatcher.send(envelope.relayed_by(user_id)),
            Some(_) => debug!(user_id = %user_id, "Ignoring {} addressed to self", kind),
            None => warn!(user_id = %user_id, "Ignoring {} without recipient", kind),
        },
        other => warn!(user_id = %user_id, "Client sent server-only event {}", other),
    }
}
