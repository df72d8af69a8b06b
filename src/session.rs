//! Pull-stream broadcast session.
//!
//! A session runs three phases in order and never goes back:
//!
//! ```text
//! replay     query(topic, cursor), emitted back to back
//!    │
//! messages   ids [next_id, message_count), one per message_interval
//!    │
//! heartbeats ids from max(next_id, message_count), one per heartbeat_interval, forever
//! ```
//!
//! Every synthesized event is appended to the shared buffer before it is
//! emitted. The peer is checked for disconnect before each emission; the host
//! cancellation token is checked at the same points and during every delay.

use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::EventBuffer;
use crate::codec::check_frame;
use crate::config::Pacing;
use crate::error::{BufferError, SessionError};
use crate::models::Event;

/// Summary of a session that ended because the peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub emitted: usize,
    pub last_id: Option<u64>,
}

enum Stop {
    Disconnected,
    Cancelled,
}

/// Per-connection state of one pull stream.
pub struct BroadcastSession {
    buffer: EventBuffer,
    pacing: Pacing,
    topic: String,
    cursor: u64,
    next_id: u64,
    emitted: usize,
    last_id: Option<u64>,
}

impl BroadcastSession {
    pub fn new(buffer: EventBuffer, pacing: Pacing, topic: impl Into<String>, cursor: u64) -> Self {
        Self {
            buffer,
            pacing,
            topic: topic.into(),
            cursor,
            next_id: cursor,
            emitted: 0,
            last_id: None,
        }
    }

    /// Drive the session until the peer disconnects (`Ok`) or the host
    /// cancels it (`Err(SessionError::Cancelled)`).
    pub async fn run(
        mut self,
        tx: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SessionError> {
        info!(topic = %self.topic, cursor = self.cursor, "Stream session started");

        let stop = match self.drive(&tx, &cancel).await {
            Ok(never) => match never {},
            Err(stop) => stop,
        };

        let report = SessionReport {
            emitted: self.emitted,
            last_id: self.last_id,
        };
        match stop {
            Stop::Disconnected => {
                info!(
                    topic = %self.topic,
                    emitted = report.emitted,
                    last_id = ?report.last_id,
                    "Client disconnected"
                );
                Ok(report)
            }
            Stop::Cancelled => Err(SessionError::Cancelled),
        }
    }

    async fn drive(
        &mut self,
        tx: &mpsc::Sender<Event>,
        cancel: &CancellationToken,
    ) -> Result<Infallible, Stop> {
        self.replay(tx, cancel).await?;

        while self.next_id < self.pacing.message_count {
            self.produce(tx, cancel, Event::message).await?;
            pace(self.pacing.message_interval, cancel).await?;
        }

        self.next_id = self.next_id.max(self.pacing.message_count);
        loop {
            self.produce(tx, cancel, Event::heartbeat).await?;
            pace(self.pacing.heartbeat_interval, cancel).await?;
        }
    }

    async fn replay(
        &mut self,
        tx: &mpsc::Sender<Event>,
        cancel: &CancellationToken,
    ) -> Result<(), Stop> {
        let backlog = self.buffer.query(&self.topic, self.cursor).await;
        debug!(topic = %self.topic, count = backlog.len(), "Replaying backlog");

        for event in &backlog {
            self.send(tx, cancel, event).await?;
        }
        if let Some(last) = backlog.last() {
            self.next_id = last.id + 1;
        }
        Ok(())
    }

    /// Append the next synthesized event and emit it.
    ///
    /// If another session on the same topic already produced this id, forward
    /// what it produced and continue above its high-water mark instead.
    async fn produce(
        &mut self,
        tx: &mpsc::Sender<Event>,
        cancel: &CancellationToken,
        make: fn(u64) -> Event,
    ) -> Result<(), Stop> {
        check(tx, cancel)?;

        let event = make(self.next_id);
        match self.buffer.append(&self.topic, event.clone()).await {
            Ok(()) => {
                self.send(tx, cancel, &event).await?;
                self.next_id += 1;
            }
            Err(err @ BufferError::StaleId { high_water, .. }) => {
                debug!(
                    code = err.as_label(),
                    topic = %self.topic,
                    id = self.next_id,
                    high_water,
                    "Topic advanced by another producer"
                );
                let produced = self.buffer.query(&self.topic, self.next_id).await;
                let mut next = high_water + 1;
                for event in &produced {
                    self.send(tx, cancel, event).await?;
                    next = next.max(event.id + 1);
                }
                self.next_id = next;
            }
        }
        Ok(())
    }

    async fn send(
        &mut self,
        tx: &mpsc::Sender<Event>,
        cancel: &CancellationToken,
        event: &Event,
    ) -> Result<(), Stop> {
        if matches!(self.last_id, Some(last) if event.id <= last) {
            return Ok(());
        }
        check(tx, cancel)?;
        if let Err(err) = check_frame(event) {
            warn!(topic = %self.topic, code = err.as_label(), "Skipping event: {}", err);
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Stop::Cancelled),
            sent = tx.send(event.clone()) => sent.map_err(|_| Stop::Disconnected)?,
        }

        debug!(topic = %self.topic, id = event.id, kind = %event.kind, "Emitted event");
        self.emitted += 1;
        self.last_id = Some(event.id);
        Ok(())
    }
}

fn check(tx: &mpsc::Sender<Event>, cancel: &CancellationToken) -> Result<(), Stop> {
    if cancel.is_cancelled() {
        return Err(Stop::Cancelled);
    }
    if tx.is_closed() {
        return Err(Stop::Disconnected);
    }
    Ok(())
}

async fn pace(delay: Duration, cancel: &CancellationToken) -> Result<(), Stop> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Stop::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
