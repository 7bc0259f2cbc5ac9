//! Push gateway: fans bus events out to WebSocket clients.
//!
//! On connect the client receives a `hello` with every non-terminal job.
//! A client may narrow `job_progress` delivery to one job with
//! `{"type": "subscribe_job", "job_id": ...}`; `job_changed` stays
//! global.  Subscriptions do not survive reconnects.  Liveness is
//! ping/pong based; a connection silent for 60 s is closed.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use easel_core::QueueEvent;

use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut sub = state.bus.subscribe();

    let jobs = match state.queue.snapshot_non_terminal().await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "hello snapshot failed");
            Vec::new()
        }
    };
    let hello = serde_json::json!({ "type": "hello", "jobs": jobs });
    if sender.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }
    debug!(jobs = jobs_len(&hello), "push client connected");

    let mut subscribed_job: Option<String> = None;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                if let QueueEvent::JobProgress { frame } = &event {
                    if let Some(filter) = &subscribed_job {
                        if &frame.job_id != filter {
                            continue;
                        }
                    }
                }
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "event serialization failed"),
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        match msg {
                            Message::Text(text) => {
                                if let Some(job_id) = parse_subscribe(text.as_str()) {
                                    debug!(%job_id, "client subscribed to job");
                                    subscribed_job = Some(job_id);
                                }
                            }
                            Message::Ping(data) => {
                                if sender.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "push client socket error");
                        break;
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > IDLE_TIMEOUT {
                    debug!("closing idle push client");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("push client disconnected");
}

fn parse_subscribe(text: &str) -> Option<String> {
    let msg: serde_json::Value = serde_json::from_str(text).ok()?;
    if msg.get("type").and_then(|t| t.as_str()) != Some("subscribe_job") {
        return None;
    }
    msg.get("job_id")
        .and_then(|id| id.as_str())
        .map(str::to_owned)
}

fn jobs_len(hello: &serde_json::Value) -> usize {
    hello["jobs"].as_array().map(|a| a.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_parses() {
        assert_eq!(
            parse_subscribe(r#"{"type":"subscribe_job","job_id":"j-1"}"#),
            Some("j-1".to_owned())
        );
        assert_eq!(parse_subscribe(r#"{"type":"other","job_id":"j-1"}"#), None);
        assert_eq!(parse_subscribe("not json"), None);
    }
}
