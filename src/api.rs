//! HTTP surface: pull stream, push stream, history and health endpoints.

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::buffer::EventBuffer;
use crate::codec::{encode_ws, to_sse_event};
use crate::config::{Config, Pacing};
use crate::models::WsEvent;
use crate::orchestrator::RunOrchestrator;
use crate::session::BroadcastSession;

/// Application state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub buffer: EventBuffer,
    pub pacing: Pacing,
    pub default_topic: String,
    pub outbound_queue: usize,
    /// Cancelled when the daemon shuts down.
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: &Config, shutdown: CancellationToken) -> Self {
        Self {
            buffer: EventBuffer::new(config.history_capacity, config.capacity_scope),
            pacing: config.pacing(),
            default_topic: config.default_topic.clone(),
            outbound_queue: config.outbound_queue.max(1),
            shutdown,
            started_at: Utc::now(),
        }
    }
}

/// Query parameters for the pull stream.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    topic: Option<String>,
    /// Fallback for clients that cannot set the `Last-Event-ID` header.
    last_event_id: Option<String>,
}

/// Query parameters for the history endpoint.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    cursor: u64,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stream", get(stream_handler))
        .route("/api/v1/topics/:topic/history", get(history_handler))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the web server until `shutdown` is cancelled.
pub async fn run_web_server(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let state = AppState::new(config, shutdown.clone());
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.http_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// The last id a client saw becomes a cursor one past it.
/// Absent or non-numeric means "from the start".
pub fn resume_cursor(last_event_id: Option<&str>) -> u64 {
    last_event_id
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|id| id.saturating_add(1))
        .unwrap_or(0)
}

/// Health check handler.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "retained_events": state.buffer.len().await,
    }))
}

/// Pull stream handler.
async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Response {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .or(query.last_event_id.as_deref());
    let cursor = resume_cursor(last_event_id);
    let topic = query
        .topic
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| state.default_topic.clone());

    let (tx, rx) = mpsc::channel(state.outbound_queue);
    let session = BroadcastSession::new(state.buffer.clone(), state.pacing, topic.clone(), cursor);
    let cancel = state.shutdown.child_token();

    let span = info_span!("stream", conn = %Uuid::new_v4(), topic = %topic);
    tokio::spawn(
        async move {
            match session.run(tx, cancel).await {
                Ok(report) => debug!(?report, "Stream session ended"),
                Err(e) => info!(code = e.as_label(), "Stream session ended: {}", e),
            }
        }
        .instrument(span),
    );

    let stream = ReceiverStream::new(rx).map(|event| to_sse_event(&event));
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

/// Retained history of one topic.
async fn history_handler(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let events = state.buffer.query(&topic, query.cursor).await;
    let last_id = state.buffer.last_id(&topic).await;
    Json(serde_json::json!({
        "topic": topic,
        "cursor": query.cursor,
        "last_id": last_id,
        "total": events.len(),
        "events": events,
    }))
}

/// WebSocket upgrade handler.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let span = info_span!("ws", conn = %Uuid::new_v4());
    ws.on_upgrade(move |socket| handle_websocket(socket, state).instrument(span))
}

/// Handle WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsEvent>(state.outbound_queue);

    // Single writer: every frame of this connection goes through here.
    tokio::spawn(
        async move {
            while let Some(event) = rx.recv().await {
                debug!(event_type = ?event.event_type, run_id = ?event.run_id(), "Sending event");
                let text = match encode_ws(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sender.close().await;
        }
        .in_current_span(),
    );

    let mut orchestrator = RunOrchestrator::new(tx, state.pacing);
    if orchestrator.connected().await.is_err() {
        return;
    }
    info!("WebSocket client connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!("Shutting down WebSocket connection");
                break;
            }
            msg = receiver.next() => {
                let outcome = match msg {
                    Some(Ok(Message::Text(text))) => orchestrator.handle_text(&text).await,
                    Some(Ok(Message::Binary(bytes))) => {
                        orchestrator.handle_text(&String::from_utf8_lossy(&bytes)).await
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // pings are answered by the protocol layer
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => {
                        debug!("WebSocket read error: {}", e);
                        break;
                    }
                };
                if outcome.is_err() {
                    break;
                }
            }
        }
    }

    let active = orchestrator.active_runs();
    orchestrator.close();
    info!(cancelled_runs = ?active, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SseDecoder;
    use crate::models::{Event, EventKind, WsEventType};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(&Config::default(), CancellationToken::new())
    }

    async fn read_events(body: Body, count: usize) -> Vec<Event> {
        let mut stream = body.into_data_stream();
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        while events.len() < count {
            let chunk = stream.next().await.unwrap().unwrap();
            events.extend(decoder.push(&chunk).into_iter().map(|r| r.unwrap()));
        }
        events
    }

    #[test]
    fn test_resume_cursor() {
        assert_eq!(resume_cursor(None), 0);
        assert_eq!(resume_cursor(Some("abc")), 0);
        assert_eq!(resume_cursor(Some("-3")), 0);
        assert_eq!(resume_cursor(Some("4")), 5);
        assert_eq!(resume_cursor(Some(" 9 ")), 10);
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_history_endpoint() {
        let state = state();
        for id in 0..4 {
            state.buffer.append("news", Event::message(id)).await.unwrap();
        }

        let response = router(state)
            .oneshot(
                Request::get("/api/v1/topics/news/history?cursor=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["last_id"], 3);
        assert_eq!(value["total"], 2);
        assert_eq!(value["events"][0]["id"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_resumes_from_header() {
        let state = state();
        for id in 0..5 {
            state.buffer.append("news", Event::message(id)).await.unwrap();
        }

        let response = router(state.clone())
            .oneshot(
                Request::get("/stream?topic=news")
                    .header("Last-Event-ID", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let events = read_events(response.into_body(), 4).await;
        let seen: Vec<(u64, EventKind)> = events.iter().map(|e| (e.id, e.kind)).collect();
        assert_eq!(
            seen,
            vec![
                (2, EventKind::Message),
                (3, EventKind::Message),
                (4, EventKind::Message),
                (5, EventKind::Heartbeat),
            ]
        );
        assert!(state.buffer.query("default", 0).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_defaults_and_query_fallback() {
        let state = state();
        let response = router(state.clone())
            .oneshot(
                Request::get("/stream?last_event_id=not-a-number")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let events = read_events(response.into_body(), 2).await;
        assert_eq!(events[0], Event::message(0));
        assert_eq!(events[1], Event::message(1));
        assert_eq!(state.buffer.last_id("default").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_stream() {
        let state = state();
        let response = router(state.clone())
            .oneshot(Request::get("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let mut stream = response.into_body().into_data_stream();
        assert!(stream.next().await.is_some());
        state.shutdown.cancel();
        assert!(stream.next().await.is_none());
    }

    type ClientSocket =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn serve(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await });
        addr
    }

    async fn connect(addr: SocketAddr) -> ClientSocket {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        socket
    }

    /// Next push-stream event of the given type, skipping everything else.
    async fn wait_for(socket: &mut ClientSocket, event_type: WsEventType) -> WsEvent {
        loop {
            if let ClientMessage::Text(text) = socket.next().await.unwrap().unwrap() {
                let event: WsEvent = serde_json::from_str(&text).unwrap();
                if event.event_type == event_type {
                    return event;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_greets_and_accepts_binary_frames() {
        let state = state();
        let addr = serve(state.clone()).await;
        let mut socket = connect(addr).await;

        let greeting = wait_for(&mut socket, WsEventType::Connected).await;
        assert_eq!(greeting.payload["message"], "Connected");

        let start = br#"{"command":"start_run","run_id":"bin"}"#.to_vec();
        socket.send(ClientMessage::Binary(start)).await.unwrap();
        let started = wait_for(&mut socket, WsEventType::RunStarted).await;
        assert_eq!(started.run_id(), Some("bin"));

        socket
            .send(ClientMessage::Binary(vec![0xff, b'{']))
            .await
            .unwrap();
        let error = wait_for(&mut socket, WsEventType::Error).await;
        assert_eq!(error.payload["code"], "invalid_json");
        assert_eq!(error.payload["received"], "\u{FFFD}{");

        // shutdown tears the connection down and cancels the run in flight
        state.shutdown.cancel();
        let cancelled = wait_for(&mut socket, WsEventType::RunCancelled).await;
        assert_eq!(cancelled.run_id(), Some("bin"));
    }

    #[tokio::test]
    async fn test_websocket_close_ends_connection() {
        let addr = serve(state()).await;
        let mut socket = connect(addr).await;
        wait_for(&mut socket, WsEventType::Connected).await;

        let start = serde_json::json!({ "command": "start_run", "run_id": "run-001" });
        socket
            .send(ClientMessage::Text(start.to_string()))
            .await
            .unwrap();
        wait_for(&mut socket, WsEventType::RunStarted).await;

        socket.close(None).await.unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(_)) = socket.next().await {}
        })
        .await;
        assert!(drained.is_ok(), "server kept the connection open");
    }
}
