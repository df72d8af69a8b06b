//! Push-stream command handling.
//!
//! One [`RunOrchestrator`] serves one connection. Commands are handled one
//! at a time, in arrival order; runs stream their events concurrently through
//! the same outbound queue.

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::SendError};
use tracing::{debug, warn};

use crate::config::Pacing;
use crate::error::{CommandError, RunError};
use crate::models::{WsEvent, WsEventType};
use crate::runs::RunRegistry;

/// An inbound client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartRun { run_id: String },
    CancelRun { run_id: String },
}

/// Parse inbound text into a command.
pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    let received: Value = serde_json::from_str(text).map_err(|_| CommandError::InvalidJson {
        received: text.to_string(),
    })?;

    let is_start = match received.get("command").and_then(Value::as_str) {
        Some("start_run") => true,
        Some("cancel_run") => false,
        _ => return Err(CommandError::UnknownCommand { received }),
    };

    let run_id = received
        .get("run_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let Some(run_id) = run_id else {
        return Err(CommandError::MissingRunId { received });
    };

    Ok(if is_start {
        Command::StartRun { run_id }
    } else {
        Command::CancelRun { run_id }
    })
}

/// Per-connection command loop state.
pub struct RunOrchestrator {
    registry: RunRegistry,
    outbound: mpsc::Sender<WsEvent>,
}

impl RunOrchestrator {
    pub fn new(outbound: mpsc::Sender<WsEvent>, pacing: Pacing) -> Self {
        Self {
            registry: RunRegistry::new(outbound.clone(), pacing),
            outbound,
        }
    }

    /// Greet a freshly connected client.
    pub async fn connected(&self) -> Result<(), SendError<WsEvent>> {
        self.emit(WsEventType::Connected, json!({ "message": "Connected" }))
            .await
    }

    /// Handle one inbound text frame.
    ///
    /// Client mistakes are answered with an `error` event; only a closed
    /// outbound queue is reported as an error.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), SendError<WsEvent>> {
        match parse_command(text) {
            Ok(Command::StartRun { run_id }) => self.start_run(&run_id).await,
            Ok(Command::CancelRun { run_id }) => self.cancel_run(&run_id).await,
            Err(err) => {
                debug!(code = err.as_label(), "Rejected command");
                self.emit(
                    WsEventType::Error,
                    json!({
                        "message": err.as_message(),
                        "code": err.as_label(),
                        "received": err.received(),
                    }),
                )
                .await
            }
        }
    }

    async fn start_run(&mut self, run_id: &str) -> Result<(), SendError<WsEvent>> {
        match self.registry.start(run_id) {
            // run_started comes from the producer so it always precedes the steps
            Ok(handle) => {
                debug!(run_id = handle.run_id(), "Run started");
                Ok(())
            }
            Err(err) => self.run_error(err).await,
        }
    }

    async fn cancel_run(&mut self, run_id: &str) -> Result<(), SendError<WsEvent>> {
        match self.registry.cancel(run_id).await {
            // the producer already emitted run_cancelled (or run_done if it won the race)
            Ok(state) => {
                debug!(run_id, %state, "Run settled");
                Ok(())
            }
            Err(err) => self.run_error(err).await,
        }
    }

    async fn run_error(&self, err: RunError) -> Result<(), SendError<WsEvent>> {
        warn!(
            run_id = err.run_id(),
            code = err.as_label(),
            state = ?self.registry.state(err.run_id()),
            "{}",
            err
        );
        self.emit(
            WsEventType::Error,
            json!({
                "message": err.as_message(),
                "code": err.as_label(),
                "run_id": err.run_id(),
            }),
        )
        .await
    }

    async fn emit(&self, event_type: WsEventType, payload: Value) -> Result<(), SendError<WsEvent>> {
        self.outbound.send(WsEvent::new(event_type, payload)).await
    }

    /// Ids of runs still in flight.
    pub fn active_runs(&self) -> Vec<String> {
        self.registry.active()
    }

    /// Connection closed: stop every run still in flight.
    pub fn close(mut self) {
        self.registry.teardown();
    }
}
