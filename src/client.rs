//! Pull-stream client behind `stream-relay tail`.

use anyhow::Result;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::SseDecoder;
use crate::models::Event;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Where to connect and where to resume from.
#[derive(Debug, Clone)]
pub struct TailOptions {
    pub url: String,
    pub topic: Option<String>,
    /// Last id already seen; the server resumes right after it.
    pub last_event_id: Option<u64>,
}

/// Follow the stream until `shutdown` is cancelled, reconnecting after every
/// dropped connection and resuming from the last id seen.
pub async fn tail(
    opts: &TailOptions,
    shutdown: CancellationToken,
    mut on_event: impl FnMut(&Event),
) -> Result<()> {
    let client = reqwest::Client::new();
    let mut last_seen = opts.last_event_id;

    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            outcome = stream_once(&client, opts, &mut last_seen, &mut on_event) => outcome,
        };
        match outcome {
            Ok(()) => info!(last_id = ?last_seen, "Stream closed by server"),
            Err(e) => warn!(last_id = ?last_seen, "Stream error: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn stream_once(
    client: &reqwest::Client,
    opts: &TailOptions,
    last_seen: &mut Option<u64>,
    on_event: &mut impl FnMut(&Event),
) -> Result<()> {
    let mut request = client
        .get(stream_url(&opts.url))
        .header(ACCEPT, "text/event-stream");
    if let Some(topic) = &opts.topic {
        request = request.query(&[("topic", topic)]);
    }
    if let Some(id) = *last_seen {
        request = request.header("Last-Event-ID", id.to_string());
    }

    let response = request.send().await?.error_for_status()?;
    info!(url = %response.url(), "Connected to stream");

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        for frame in decoder.push(&chunk?) {
            match frame {
                Ok(event) => {
                    *last_seen = Some(event.id);
                    on_event(&event);
                }
                Err(e) => warn!(code = e.as_label(), "Skipping malformed frame: {}", e),
            }
        }
    }
    Ok(())
}

fn stream_url(base: &str) -> String {
    format!("{}/stream", base.trim_end_matches('/'))
}
