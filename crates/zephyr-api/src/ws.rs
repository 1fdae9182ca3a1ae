//! WebSocket job streaming.
//!
//! Clients subscribe to a job and receive `job_update` messages carrying
//! status changes and log chunks. The live feed is best-effort; a client
//! that falls behind is re-synced from the durable tail in the store.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{extract::State, response::Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use zephyr_core::events::JobEvent;
use zephyr_core::ids::JobId;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Unsubscribe,
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JobUpdate {
        #[serde(rename = "jobId")]
        job_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        logs: Option<Vec<String>>,
    },
    Pong,
    Error {
        message: String,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut subscription: Option<(JobId, broadcast::Receiver<JobEvent>)> = None;
    // Durable cursor for re-syncs after broadcast lag.
    let mut last_seq: i64 = 0;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { job_id }) => {
                                match job_id.parse::<JobId>() {
                                    Ok(id) => {
                                        let rx = state.bus.subscribe(id);
                                        subscription = Some((id, rx));
                                        last_seq = 0;
                                        if let Some(update) = snapshot(&state, id, &mut last_seq).await {
                                            if send(&mut socket, &update).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(_) => {
                                        let _ = send(&mut socket, &ServerMessage::Error {
                                            message: format!("invalid job ID: {job_id}"),
                                        }).await;
                                    }
                                }
                            }
                            Ok(ClientMessage::Unsubscribe) => {
                                subscription = None;
                            }
                            Ok(ClientMessage::Ping) => {
                                if send(&mut socket, &ServerMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = send(&mut socket, &ServerMessage::Error {
                                    message: format!("invalid message: {e}"),
                                }).await;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = recv_event(&mut subscription), if subscription.is_some() => {
                match event {
                    Ok(event) => {
                        let update = to_update(&event, &mut last_seq);
                        if send(&mut socket, &update).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ws subscriber lagged, re-syncing from store");
                        if let Some((job_id, _)) = &subscription {
                            let job_id = *job_id;
                            if let Some(update) = snapshot(&state, job_id, &mut last_seq).await {
                                if send(&mut socket, &update).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Job is terminal; the channel was retired.
                        subscription = None;
                    }
                }
            }
        }
    }
}

async fn recv_event(
    subscription: &mut Option<(JobId, broadcast::Receiver<JobEvent>)>,
) -> Result<JobEvent, broadcast::error::RecvError> {
    match subscription {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Current status plus the durable log tail since the cursor.
async fn snapshot(state: &AppState, job_id: JobId, last_seq: &mut i64) -> Option<ServerMessage> {
    let job = state.store.get_job(job_id).await.ok()??;
    let chunks = state
        .store
        .logs_for_job(job_id, Some(*last_seq))
        .await
        .unwrap_or_default();
    if let Some(chunk) = chunks.last() {
        *last_seq = chunk.seq;
    }

    Some(ServerMessage::JobUpdate {
        job_id: job_id.to_string(),
        status: job.status.to_string(),
        logs: Some(chunks.into_iter().map(|c| c.content).collect()),
    })
}

fn to_update(event: &JobEvent, last_seq: &mut i64) -> ServerMessage {
    match event {
        JobEvent::Output(chunk) => {
            *last_seq = chunk.seq;
            ServerMessage::JobUpdate {
                job_id: chunk.job_id.to_string(),
                status: "running".to_string(),
                logs: Some(vec![chunk.content.clone()]),
            }
        }
        JobEvent::StatusChanged(change) => ServerMessage::JobUpdate {
            job_id: change.job_id.to_string(),
            status: change.status.to_string(),
            logs: None,
        },
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
