//! Error types for the streaming core.
//!
//! Every error exposes `as_label()`, a short stable snake_case label used in
//! logs and in the `code` field of push-stream `error` events.

use thiserror::Error;

/// Errors raised while framing or parsing a pull-stream event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("invalid event id: {0:?}")]
    InvalidId(String),

    #[error("unknown event kind: {0:?}")]
    UnknownKind(String),

    /// A carriage return is a line terminator on the wire and cannot travel inside data.
    #[error("payload of event {id} contains a carriage return")]
    CarriageReturn { id: u64 },
}

impl CodecError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CodecError::MissingField(_) => "codec_missing_field",
            CodecError::InvalidId(_) => "codec_invalid_id",
            CodecError::UnknownKind(_) => "codec_unknown_kind",
            CodecError::CarriageReturn { .. } => "codec_carriage_return",
        }
    }
}

/// Errors raised by the event buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The id was already produced on this topic.
    #[error("event id {id} on topic {topic:?} is not above high-water id {high_water}")]
    StaleId {
        topic: String,
        id: u64,
        high_water: u64,
    },
}

impl BufferError {
    pub fn as_label(&self) -> &'static str {
        match self {
            BufferError::StaleId { .. } => "buffer_stale_id",
        }
    }
}

/// Errors that end a broadcast session abnormally.
///
/// A peer disconnect is not an error; it ends the session with `Ok`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The hosting transport was shut down while the session was live.
    #[error("session cancelled by host")]
    Cancelled,
}

impl SessionError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionError::Cancelled => "session_cancelled",
        }
    }
}

/// Errors returned by the run registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("run {0:?} is already running")]
    AlreadyRunning(String),

    #[error("no active run {0:?}")]
    NotFound(String),
}

impl RunError {
    pub fn as_label(&self) -> &'static str {
        match self {
            RunError::AlreadyRunning(_) => "already_running",
            RunError::NotFound(_) => "not_found",
        }
    }

    /// Client-facing message.
    pub fn as_message(&self) -> &'static str {
        match self {
            RunError::AlreadyRunning(_) => "Run already in progress",
            RunError::NotFound(_) => "No active run to cancel",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            RunError::AlreadyRunning(id) | RunError::NotFound(id) => id,
        }
    }
}

/// Errors raised while decoding an inbound push-stream command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("inbound text is not JSON")]
    InvalidJson { received: String },

    #[error("run_id is required")]
    MissingRunId { received: serde_json::Value },

    #[error("unknown command")]
    UnknownCommand { received: serde_json::Value },
}

impl CommandError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CommandError::InvalidJson { .. } => "invalid_json",
            CommandError::MissingRunId { .. } => "client_protocol_error",
            CommandError::UnknownCommand { .. } => "unknown_command",
        }
    }

    /// Client-facing message.
    pub fn as_message(&self) -> &'static str {
        match self {
            CommandError::InvalidJson { .. } => "Invalid JSON",
            CommandError::MissingRunId { .. } => "run_id is required",
            CommandError::UnknownCommand { .. } => "Unknown command",
        }
    }

    /// What the client sent, echoed back in the error event.
    pub fn received(&self) -> serde_json::Value {
        match self {
            CommandError::InvalidJson { received } => serde_json::Value::String(received.clone()),
            CommandError::MissingRunId { received } | CommandError::UnknownCommand { received } => {
                received.clone()
            }
        }
    }
}
