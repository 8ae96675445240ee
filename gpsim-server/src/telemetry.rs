//! Telemetry fan-out
//!
//! Every state change, build/run status and playback frame goes through one
//! bounded broadcast channel. Publishing never blocks; a subscriber that falls
//! behind loses the oldest messages and keeps going.

use crate::jobs::Progress;
use crate::run::RunState;
use gpsim_core::TelemetryFrame;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    State,
    Status,
    Data,
}

impl Topic {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "state" => Some(Topic::State),
            "status" => Some(Topic::Status),
            "data" => Some(Topic::Data),
            _ => None,
        }
    }
}

/// Topics a WebSocket client gets before it sends a subscribe message
pub fn default_topics() -> HashSet<Topic> {
    HashSet::from([Topic::State, Topic::Data])
}

/// Message on the wire: `{"type": "state" | "status" | "data", "session_id": ..}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SimEvent {
    State(StateEvent),
    Status(StatusEvent),
    Data(DataEvent),
}

impl SimEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SimEvent::State(_) => Topic::State,
            SimEvent::Status(_) => Topic::Status,
            SimEvent::Data(_) => Topic::Data,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SimEvent::State(e) => &e.session_id,
            SimEvent::Status(e) => &e.session_id,
            SimEvent::Data(e) => &e.session_id,
        }
    }

    pub fn state(session_id: &str, run: &RunState) -> Self {
        SimEvent::State(StateEvent {
            session_id: session_id.to_string(),
            run: run.clone(),
        })
    }

    pub fn data(session_id: &str, frame: TelemetryFrame) -> Self {
        SimEvent::Data(DataEvent {
            session_id: session_id.to_string(),
            frame,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub run: RunState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Build,
    Run,
}

/// Build job or run lifecycle change
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub session_id: String,
    pub source: StatusSource,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub frame: TelemetryFrame,
}

#[derive(Clone)]
pub struct Telemetry {
    tx: broadcast::Sender<SimEvent>,
    clients: Arc<AtomicUsize>,
}

impl Telemetry {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, event: SimEvent) {
        // No receivers is fine; the next subscriber starts from live events
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, topics: HashSet<Topic>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics,
        }
    }

    /// Unfiltered receiver, for stream adapters
    pub fn receiver(&self) -> broadcast::Receiver<SimEvent> {
        self.tx.subscribe()
    }

    /// Count a connected observer until the guard is dropped
    pub fn connect(&self) -> ClientGuard {
        self.clients.fetch_add(1, Ordering::SeqCst);
        ClientGuard {
            clients: self.clients.clone(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

pub struct ClientGuard {
    clients: Arc<AtomicUsize>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<SimEvent>,
    topics: HashSet<Topic>,
}

impl Subscription {
    pub fn topics(&self) -> &HashSet<Topic> {
        &self.topics
    }

    pub fn set_topics(&mut self, topics: HashSet<Topic>) {
        self.topics = topics;
    }

    /// Next event on a subscribed topic; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<SimEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topics.contains(&event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Telemetry subscriber lagged; dropped oldest messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
