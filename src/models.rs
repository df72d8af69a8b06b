//! Data models for streamed events and runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a pull-stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(EventKind::Message),
            "heartbeat" => Ok(EventKind::Heartbeat),
            other => Err(other.to_string()),
        }
    }
}

/// One event of a topic. Ids are the order key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    /// JSON-encoded payload, kept opaque.
    pub payload: String,
}

impl Event {
    pub fn new(id: u64, kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
        }
    }

    /// A synthesized demo message.
    pub fn message(id: u64) -> Self {
        let payload = serde_json::json!({ "text": format!("message {}", id) });
        Self::new(id, EventKind::Message, payload.to_string())
    }

    /// A content-free keep-alive.
    pub fn heartbeat(id: u64) -> Self {
        let payload = serde_json::json!({ "type": "heartbeat" });
        Self::new(id, EventKind::Heartbeat, payload.to_string())
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Done,
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Done => write!(f, "done"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Types of push-stream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsEventType {
    Connected,
    RunStarted,
    RunEvent,
    RunDone,
    RunCancelled,
    Error,
}

/// A push-stream event as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEvent {
    pub event_type: WsEventType,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl WsEvent {
    /// Create a new event stamped with the current time.
    pub fn new(event_type: WsEventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            ts: Utc::now(),
            payload,
        }
    }

    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<&str> {
        self.payload.get("run_id").and_then(|v| v.as_str())
    }
}
