use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use opsdeck_core::error::CoreError;
use opsdeck_core::events::{JobEvent, MSG_TYPE_CONNECTED, MSG_TYPE_PING, MSG_TYPE_PONG};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::gateway::manager::GatewaySender;
use crate::state::AppState;

/// How long a finished connection may take to flush its last frames.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct WatchParams {
    pub owner_id: Option<String>,
}

/// GET /ws/jobs/{job_id} -- upgrade to a live event stream for one job.
///
/// Unknown jobs are rejected with 404 before the upgrade.
pub async fn job_events_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<String>,
    Query(params): Query<WatchParams>,
    State(state): State<AppState>,
) -> AppResult<Response> {
    if state.tracker.get(&job_id).await?.is_none() {
        return Err(AppError::Core(CoreError::NotFound {
            entity: "Job",
            id: job_id,
        }));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, job_id, params.owner_id)))
}

/// Manage a single viewer after upgrade.
///
///   1. Registers the connection with the gateway, so live events queue
///      up from this point on.
///   2. Sends the `connected` acknowledgement and the log backlog.
///   3. Spawns a sender task that forwards the queued and live events.
///   4. Answers client pings; closes the connection when it goes quiet.
///   5. Deregisters on disconnect.
async fn handle_socket(socket: WebSocket, state: AppState, job_id: String, owner_id: Option<String>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let gateway = state.gateway.clone();

    let (tx, mut rx) = gateway.register(&conn_id, &job_id, owner_id.clone()).await;
    let viewers = gateway.connections_for(&job_id).await;
    tracing::info!(
        conn_id = %conn_id,
        job_id = %job_id,
        owner_id = ?owner_id,
        viewers,
        "Job viewer connected"
    );

    let (mut sink, mut stream) = socket.split();

    if let Err(e) = send_preamble(&mut sink, &state, &job_id).await {
        tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket closed during handshake");
        gateway.deregister(&conn_id, &job_id).await;
        return;
    }

    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let idle_timeout = Duration::from_secs(state.config.ws_heartbeat_timeout_secs);
    loop {
        let next = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::info!(conn_id = %conn_id, job_id = %job_id, "Job viewer idle, closing");
                let _ = tx.try_send(Message::Close(None));
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if is_ping(text.as_str()) {
                    reply(&tx, pong_message(), &conn_id);
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    gateway.deregister(&conn_id, &job_id).await;
    drop(tx);
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    tracing::info!(conn_id = %conn_id, job_id = %job_id, "Job viewer disconnected");
}

/// Acknowledgement, then the most recent log lines as `log` events.
async fn send_preamble(
    sink: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    job_id: &str,
) -> Result<(), axum::Error> {
    let connected = json!({
        "type": MSG_TYPE_CONNECTED,
        "job_id": job_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    sink.send(Message::Text(connected.to_string().into())).await?;

    let backlog = match state
        .tracker
        .get_logs(job_id, state.config.ws_backlog_lines)
        .await
    {
        Ok(lines) => lines,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Failed to load log backlog");
            Vec::new()
        }
    };

    for line in backlog {
        match JobEvent::log(job_id, line).to_json() {
            Ok(json) => sink.send(Message::Text(json.into())).await?,
            Err(e) => tracing::warn!(job_id, error = %e, "Failed to serialize backlog line"),
        }
    }
    Ok(())
}

/// Plain `ping` or `{"type":"ping"}`.
fn is_ping(text: &str) -> bool {
    let text = text.trim();
    if text == MSG_TYPE_PING {
        return true;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == MSG_TYPE_PING))
        .unwrap_or(false)
}

fn pong_message() -> Message {
    let pong = json!({
        "type": MSG_TYPE_PONG,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    Message::Text(pong.to_string().into())
}

fn reply(tx: &GatewaySender, message: Message, conn_id: &str) {
    if tx.try_send(message).is_err() {
        tracing::debug!(conn_id, "Reply dropped, connection lagging");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_ping_forms() {
        assert!(is_ping("ping"));
        assert!(is_ping(" ping\n"));
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"pong"}"#));
        assert!(!is_ping("hello"));
        assert!(!is_ping("[1,2]"));
    }
}
