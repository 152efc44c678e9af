//! Streaming transport
//!
//! Bridges one observing WebSocket connection to a deployment: persisted
//! log entries are replayed in write order, then live frames are forwarded
//! as they are broadcast. The live subscription is taken before the replay
//! snapshot, and frames are deduplicated by sequence number, so an observer
//! joining mid-run sees every frame exactly once and in order.
//!
//! Single-observer model: losing the connection while the deployment is
//! running aborts it (the record ends `failed` with an explanatory output
//! and the underlying process is terminated).

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::SinkExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::message::{EventType, StreamMessage};
use crate::server::state::ServerState;

/// WebSocket upgrade for `/deployments/{id}/stream`
pub async fn stream_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_deployment(socket, state, id))
}

async fn stream_deployment(mut socket: WebSocket, state: Arc<ServerState>, id: String) {
    let deployment = match state.store.get(&id).await {
        Ok(deployment) => deployment,
        Err(e) => {
            let _ = send_message(
                &mut socket,
                &StreamMessage::new(EventType::Error, e.to_string()),
            )
            .await;
            let _ = socket.close().await;
            return;
        }
    };

    // Attach to the live run, starting one if the deployment has never run.
    // Terminal deployments get a pure history replay; retrying a failed
    // deployment is an explicit start request, not a side effect of
    // observing it.
    let mut live = state.orchestrator.subscribe(&id).await;
    if live.is_none() && !deployment.status.is_terminal() {
        if let Err(e) = state.orchestrator.start(&id).await {
            let _ = send_message(
                &mut socket,
                &StreamMessage::new(EventType::Error, e.to_string()),
            )
            .await;
            let _ = socket.close().await;
            return;
        }
        live = state.orchestrator.subscribe(&id).await;
    }

    // Replay everything persisted so far, remembering the highest sequence
    // so the live tail can skip frames the replay already delivered.
    let mut last_seq: Option<u64> = None;
    match state.logs.list(&id).await {
        Ok(entries) => {
            for entry in entries {
                last_seq = Some(entry.seq);
                if send_message(&mut socket, &entry.message).await.is_err() {
                    state.orchestrator.handle_disconnect(&id).await;
                    return;
                }
            }
        }
        Err(e) => warn!(deployment_id = %id, "Log replay failed: {}", e),
    }

    let Some(mut live) = live else {
        // Nothing running: history was the whole story.
        let _ = socket.close().await;
        return;
    };

    loop {
        tokio::select! {
            received = live.recv() => match received {
                Ok(entry) => {
                    if last_seq.is_some_and(|seq| entry.seq <= seq) {
                        continue;
                    }
                    let is_complete = entry.message.event == EventType::Complete;
                    if send_message(&mut socket, &entry.message).await.is_err() {
                        state.orchestrator.handle_disconnect(&id).await;
                        return;
                    }
                    if is_complete {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(deployment_id = %id, "Observer lagged, skipped {} frames", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!(deployment_id = %id, "Observer connection lost");
                    state.orchestrator.handle_disconnect(&id).await;
                    return;
                }
                // Inbound payloads are ignored; the stream is one-way.
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = socket.close().await;
}

async fn send_message(socket: &mut WebSocket, message: &StreamMessage) -> Result<(), ()> {
    let payload = serde_json::to_string(message).map_err(|_| ())?;
    socket
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}
