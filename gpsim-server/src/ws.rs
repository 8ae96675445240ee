//! `WS /ws/sim`: live state, status and data events
//!
//! New clients get `state` and `data`. A client message
//! `{"type": "subscribe", "topics": ["status", ...]}` replaces the set.
//! `?session_id=` limits the stream to one session.

use crate::state::AppState;
use crate::telemetry::{default_topics, SimEvent, Topic};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Deserialize)]
pub struct WsQuery {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { topics: Vec<String> },
}

/// Topics named by a client subscribe message; unknown names are dropped
fn subscribed_topics(text: &str) -> serde_json::Result<HashSet<Topic>> {
    let ClientMessage::Subscribe { topics } = serde_json::from_str(text)?;
    Ok(topics.iter().filter_map(|t| Topic::parse(t)).collect())
}

/// Whether `event` belongs on a socket opened with `?session_id=filter`
fn for_client(filter: Option<&str>, event: &SimEvent) -> bool {
    filter.map_or(true, |id| id == event.session_id())
}

pub async fn sim_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| serve_client(socket, state, query.session_id))
}

async fn serve_client(mut socket: WebSocket, state: AppState, session_id: Option<String>) {
    let _client = state.telemetry.connect();
    let mut subscription = state.telemetry.subscribe(default_topics());
    info!(
        clients = state.telemetry.client_count(),
        session_id = ?session_id,
        "WebSocket client connected"
    );

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if !for_client(session_id.as_deref(), &event) {
                    continue;
                }
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => match subscribed_topics(&text) {
                    Ok(topics) => {
                        info!(?topics, "WebSocket subscriptions updated");
                        subscription.set_topics(topics);
                    }
                    Err(e) => debug!("Ignoring client message: {}", e),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    info!(
        clients = state.telemetry.client_count().saturating_sub(1),
        "WebSocket client disconnected"
    );
}
