//! Per-connection run registry.
//!
//! The registry owns every run started on one connection. It is driven by
//! the connection's sequential command loop, so the check-then-insert in
//! [`RunRegistry::start`] needs no locking.
//!
//! ## Run lifecycle
//! ```text
//! start ─► run_started ─► run_event(0) ─► … ─► run_event(n-1) ─► run_done      (Done)
//!                  └──────── token observed at a step boundary ─► run_cancelled (Cancelled)
//! ```
//! Handles are retained after they settle so that a late `cancel` can tell
//! "never existed" from "already finished".

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Pacing;
use crate::error::RunError;
use crate::models::{RunState, WsEvent, WsEventType};

/// Handle to one run's producer.
pub struct RunHandle {
    run_id: String,
    /// Published by the producer right before its terminal event.
    state: watch::Receiver<RunState>,
    /// Overrides `state` once the producer has been joined.
    settled: Option<RunState>,
    cancel: CancellationToken,
    join: Option<JoinHandle<RunState>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        self.settled.unwrap_or_else(|| *self.state.borrow())
    }
}

/// Table of `run_id -> RunHandle` for one connection.
pub struct RunRegistry {
    runs: HashMap<String, RunHandle>,
    outbound: mpsc::Sender<WsEvent>,
    pacing: Pacing,
}

impl RunRegistry {
    /// Create a registry whose producers write to `outbound`.
    pub fn new(outbound: mpsc::Sender<WsEvent>, pacing: Pacing) -> Self {
        Self {
            runs: HashMap::new(),
            outbound,
            pacing,
        }
    }

    /// Start a run. Fails if a run with the same id is still running.
    pub fn start(&mut self, run_id: &str) -> Result<&RunHandle, RunError> {
        if self.state(run_id) == Some(RunState::Running) {
            return Err(RunError::AlreadyRunning(run_id.to_string()));
        }

        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(produce_run(
            run_id.to_string(),
            self.outbound.clone(),
            cancel.clone(),
            self.pacing,
            state_tx,
        ));
        let handle = RunHandle {
            run_id: run_id.to_string(),
            state: state_rx,
            settled: None,
            cancel,
            join: Some(join),
        };
        info!(run_id, "Run started");

        Ok(match self.runs.entry(run_id.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(handle);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(handle),
        })
    }

    /// Cancel a running run and wait until its producer has emitted its
    /// terminal event. Returns the state the run settled in.
    pub async fn cancel(&mut self, run_id: &str) -> Result<RunState, RunError> {
        let handle = self
            .runs
            .get_mut(run_id)
            .filter(|h| h.state() == RunState::Running)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;

        handle.cancel.cancel();
        let outcome = match handle.join.take() {
            Some(join) => match join.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(run_id, "Run producer failed: {}", e);
                    RunState::Cancelled
                }
            },
            None => handle.state(),
        };
        handle.settled = Some(outcome);

        info!(run_id, state = %outcome, "Run cancel settled");
        Ok(outcome)
    }

    /// Signal every running producer to stop without waiting for it.
    pub fn teardown(&mut self) {
        let mut signalled = 0;
        for handle in self.runs.values() {
            if handle.state() == RunState::Running && !handle.cancel.is_cancelled() {
                handle.cancel.cancel();
                signalled += 1;
            }
        }
        if signalled > 0 {
            info!(signalled, "Cancelled active runs on teardown");
        }
    }

    /// State of a run, or `None` if it never existed on this connection.
    pub fn state(&self, run_id: &str) -> Option<RunState> {
        self.runs.get(run_id).map(RunHandle::state)
    }

    /// Ids of runs that are still running, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runs
            .values()
            .filter(|h| h.state() == RunState::Running)
            .map(|h| h.run_id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for RunRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Body of one run's background task.
async fn produce_run(
    run_id: String,
    tx: mpsc::Sender<WsEvent>,
    cancel: CancellationToken,
    pacing: Pacing,
    state: watch::Sender<RunState>,
) -> RunState {
    let started = WsEvent::new(WsEventType::RunStarted, serde_json::json!({ "run_id": run_id }));
    if tx.send(started).await.is_err() {
        return settle(&state, RunState::Cancelled);
    }

    for step in 0..pacing.run_steps {
        if cancel.is_cancelled() {
            return finish_cancelled(&run_id, &tx, &state).await;
        }
        let event = WsEvent::new(
            WsEventType::RunEvent,
            serde_json::json!({
                "run_id": run_id,
                "step": step,
                "text": format!("agent step {}", step),
            }),
        );
        if tx.send(event).await.is_err() {
            debug!(run_id = %run_id, "Outbound closed, stopping run");
            return settle(&state, RunState::Cancelled);
        }
        tokio::time::sleep(pacing.run_step_interval).await;
    }

    if cancel.is_cancelled() {
        return finish_cancelled(&run_id, &tx, &state).await;
    }
    let done = WsEvent::new(WsEventType::RunDone, serde_json::json!({ "run_id": run_id }));
    let outcome = finish(&tx, &state, RunState::Done, done).await;
    info!(run_id = %run_id, state = %outcome, "Run finished");
    outcome
}

async fn finish_cancelled(
    run_id: &str,
    tx: &mpsc::Sender<WsEvent>,
    state: &watch::Sender<RunState>,
) -> RunState {
    debug!(run_id, "Run observed cancellation");
    let event = WsEvent::new(WsEventType::RunCancelled, serde_json::json!({ "run_id": run_id }));
    finish(tx, state, RunState::Cancelled, event).await
}

/// Publish the terminal state, then emit the terminal event.
///
/// The slot is reserved first so nothing yields between the two: by the time
/// a client can see the terminal event, the run is no longer `Running`.
async fn finish(
    tx: &mpsc::Sender<WsEvent>,
    state: &watch::Sender<RunState>,
    outcome: RunState,
    event: WsEvent,
) -> RunState {
    match tx.reserve().await {
        Ok(permit) => {
            state.send_replace(outcome);
            permit.send(event);
            outcome
        }
        Err(_) => settle(state, RunState::Cancelled),
    }
}

fn settle(state: &watch::Sender<RunState>, outcome: RunState) -> RunState {
    state.send_replace(outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn registry() -> (RunRegistry, mpsc::Receiver<WsEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (RunRegistry::new(tx, Pacing::default()), rx)
    }

    /// Receive events until `run_id` emits a terminal event; returns that run's events.
    async fn drain_run(rx: &mut mpsc::Receiver<WsEvent>, run_id: &str) -> Vec<WsEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if event.run_id() != Some(run_id) {
                continue;
            }
            let terminal = matches!(event.event_type, WsEventType::RunDone | WsEventType::RunCancelled);
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    fn types(events: &[WsEvent]) -> Vec<WsEventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_normally() {
        let (mut registry, mut rx) = registry();
        let started = Instant::now();
        assert_eq!(registry.start("run-001").unwrap().state(), RunState::Running);

        let events = drain_run(&mut rx, "run-001").await;
        assert_eq!(
            types(&events),
            vec![
                WsEventType::RunStarted,
                WsEventType::RunEvent,
                WsEventType::RunEvent,
                WsEventType::RunEvent,
                WsEventType::RunEvent,
                WsEventType::RunEvent,
                WsEventType::RunDone,
            ]
        );
        let steps: Vec<u64> = events[1..6]
            .iter()
            .map(|e| e.payload["step"].as_u64().unwrap())
            .collect();
        assert_eq!(steps, vec![0, 1, 2, 3, 4]);
        assert_eq!(events[3].payload["text"], "agent step 2");
        assert_eq!(Instant::now() - started, Duration::from_secs(5));
        assert_eq!(registry.state("run-001"), Some(RunState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_rejected_until_done() {
        let (mut registry, mut rx) = registry();
        registry.start("run-001").unwrap();

        let err = registry.start("run-001").err().unwrap();
        assert_eq!(err, RunError::AlreadyRunning("run-001".into()));

        drain_run(&mut rx, "run-001").await;
        assert!(registry.start("run-001").is_ok());
        assert_eq!(registry.state("run-001"), Some(RunState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_blocks_until_terminal_event() {
        let (mut registry, mut rx) = registry();
        registry.start("run-001").unwrap();
        registry.start("run-002").unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let outcome = registry.cancel("run-002").await.unwrap();
        assert_eq!(outcome, RunState::Cancelled);
        assert_eq!(registry.state("run-002"), Some(RunState::Cancelled));
        assert_eq!(registry.active(), vec!["run-001".to_string()]);

        // the terminal event is already queued when cancel returns
        let mut run_002 = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.run_id() == Some("run-002") {
                run_002.push(event);
            }
        }
        let last = run_002.last().unwrap();
        assert_eq!(last.event_type, WsEventType::RunCancelled);
        let max_step = run_002
            .iter()
            .filter_map(|e| e.payload["step"].as_u64())
            .max()
            .unwrap();
        assert_eq!(max_step, 2);

        let run_001 = drain_run(&mut rx, "run-001").await;
        assert_eq!(run_001.last().unwrap().event_type, WsEventType::RunDone);
        assert_eq!(registry.state("run-001"), Some(RunState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unknown_or_finished_is_not_found() {
        let (mut registry, mut rx) = registry();
        assert_eq!(
            registry.cancel("run-999").await,
            Err(RunError::NotFound("run-999".into()))
        );

        registry.start("run-001").unwrap();
        drain_run(&mut rx, "run-001").await;
        assert_eq!(
            registry.cancel("run-001").await,
            Err(RunError::NotFound("run-001".into()))
        );
        assert_eq!(registry.state("run-999"), None);
        assert_eq!(registry.state("run-001"), Some(RunState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_right_after_start() {
        let (mut registry, mut rx) = registry();
        registry.start("run-001").unwrap();
        assert_eq!(registry.cancel("run-001").await, Ok(RunState::Cancelled));

        let events = drain_run(&mut rx, "run-001").await;
        let kinds = types(&events);
        assert_eq!(kinds.first(), Some(&WsEventType::RunStarted));
        assert_eq!(kinds.last(), Some(&WsEventType::RunCancelled));
        assert!(kinds.len() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_all_runs() {
        let (mut registry, mut rx) = registry();
        registry.start("a").unwrap();
        registry.start("b").unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        registry.teardown();
        let a = drain_run(&mut rx, "a").await;
        assert_eq!(a.last().unwrap().event_type, WsEventType::RunCancelled);
        let b = drain_run(&mut rx, "b").await;
        assert_eq!(b.last().unwrap().event_type, WsEventType::RunCancelled);
        assert!(registry.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_registry_cancels_runs() {
        let (mut registry, mut rx) = registry();
        registry.start("a").unwrap();
        drop(registry);

        let events = drain_run(&mut rx, "a").await;
        assert_eq!(events.last().unwrap().event_type, WsEventType::RunCancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_outbound_settles_cancelled() {
        let (mut registry, rx) = registry();
        registry.start("run-001").unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        drop(rx);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.state("run-001"), Some(RunState::Cancelled));
        assert!(registry.active().is_empty());

        // a settled run may be started again under the same id
        assert!(registry.start("run-001").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_losing_to_completion_reports_done() {
        // room for run_started and every step, but not for run_done
        let (tx, mut rx) = mpsc::channel(6);
        let mut registry = RunRegistry::new(tx, Pacing::default());
        registry.start("run-001").unwrap();

        // past the last step: the producer is waiting to queue run_done
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(registry.state("run-001"), Some(RunState::Running));

        let (outcome, events) = tokio::join!(
            registry.cancel("run-001"),
            drain_run(&mut rx, "run-001")
        );
        assert_eq!(outcome, Ok(RunState::Done));
        assert_eq!(events.last().unwrap().event_type, WsEventType::RunDone);
        assert!(events
            .iter()
            .all(|e| e.event_type != WsEventType::RunCancelled));
        assert_eq!(registry.state("run-001"), Some(RunState::Done));
    }
}
