//! Wire framing for both delivery surfaces.
//!
//! Pull stream frames look like `id: 7\nevent: message\ndata: {...}\n\n`.
//! Push stream events are JSON objects `{event_type, ts, payload}`.

use axum::response::sse::Event as SseEvent;

use crate::error::CodecError;
use crate::models::{Event, EventKind, WsEvent};

/// Check that an event survives framing unchanged.
///
/// CR, LF and CRLF all end a line on the wire; payload newlines are carried
/// as separate `data:` lines, but a carriage return would come back as a newline.
pub fn check_frame(event: &Event) -> Result<(), CodecError> {
    if event.payload.contains('\r') {
        return Err(CodecError::CarriageReturn { id: event.id });
    }
    Ok(())
}

/// Build the pull-stream frame for one event.
pub fn to_sse_event(event: &Event) -> Result<SseEvent, CodecError> {
    check_frame(event)?;
    Ok(SseEvent::default()
        .id(event.id.to_string())
        .event(event.kind.as_str())
        .data(&event.payload))
}

/// Parse one pull-stream frame. Blank lines and comment lines are ignored.
pub fn decode_sse(frame: &str) -> Result<Event, CodecError> {
    let mut id = None;
    let mut kind = None;
    let mut data: Option<String> = None;

    // a CRLF pair yields an extra empty line, which is skipped like any other
    for line in frame.split(['\r', '\n']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "id" => id = Some(value),
            "event" => kind = Some(value),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    let id = id.ok_or(CodecError::MissingField("id"))?;
    let id = id
        .parse::<u64>()
        .map_err(|_| CodecError::InvalidId(id.to_string()))?;
    let kind = kind
        .ok_or(CodecError::MissingField("event"))?
        .parse::<EventKind>()
        .map_err(CodecError::UnknownKind)?;
    let payload = data.ok_or(CodecError::MissingField("data"))?;

    Ok(Event::new(id, kind, payload))
}

/// Incremental decoder for a pull stream arriving in arbitrary chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Received bytes with every line ending normalized to `\n`.
    pending: Vec<u8>,
    /// The previous byte was a CR, so an immediately following LF is part of it.
    after_cr: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Event, CodecError>> {
        for &byte in chunk {
            match byte {
                b'\r' => {
                    self.pending.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => self.after_cr = false,
                _ => {
                    self.pending.push(byte);
                    self.after_cr = false;
                }
            }
        }

        let mut frames = Vec::new();
        while let Some(pos) = self.pending.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.pending.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&raw);
            // keep-alive comments carry no event
            if text.lines().all(|l| l.is_empty() || l.starts_with(':')) {
                continue;
            }
            frames.push(decode_sse(&text));
        }
        frames
    }
}

/// Serialize a push-stream event.
pub fn encode_ws(event: &WsEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}
