//! Bounded, topic-aware event history used for replay on reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CapacityScope;
use crate::error::BufferError;
use crate::models::Event;

/// Process-scoped event history shared by every broadcast session.
///
/// A single mutex guards all operations, so every call observes a
/// consistent snapshot.
#[derive(Clone)]
pub struct EventBuffer {
    inner: Arc<Mutex<History>>,
}

struct History {
    capacity: usize,
    scope: CapacityScope,
    topics: HashMap<String, VecDeque<Event>>,
    /// Topic of every retained event in arrival order; only used in shared scope.
    arrival: VecDeque<String>,
    /// Highest id ever produced per topic. Eviction never lowers it.
    high_water: HashMap<String, u64>,
    len: usize,
}

impl EventBuffer {
    /// Create a new buffer holding at most `capacity` events.
    pub fn new(capacity: usize, scope: CapacityScope) -> Self {
        Self {
            inner: Arc::new(Mutex::new(History {
                capacity: capacity.max(1),
                scope,
                topics: HashMap::new(),
                arrival: VecDeque::new(),
                high_water: HashMap::new(),
                len: 0,
            })),
        }
    }

    /// Append an event at the tail of `topic`, evicting the oldest entries
    /// once over capacity.
    ///
    /// Rejects ids that are not above the highest id already produced on the topic.
    pub async fn append(&self, topic: &str, event: Event) -> Result<(), BufferError> {
        let mut history = self.inner.lock().await;

        if let Some(&high_water) = history.high_water.get(topic) {
            if event.id <= high_water {
                return Err(BufferError::StaleId {
                    topic: topic.to_string(),
                    id: event.id,
                    high_water,
                });
            }
        }

        history.high_water.insert(topic.to_string(), event.id);
        history
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(event);
        history.len += 1;

        let scope = history.scope;
        match scope {
            CapacityScope::Shared => {
                history.arrival.push_back(topic.to_string());
                while history.len > history.capacity {
                    history.evict_oldest();
                }
            }
            CapacityScope::PerTopic => {
                let capacity = history.capacity;
                let mut evicted = 0;
                if let Some(queue) = history.topics.get_mut(topic) {
                    while queue.len() > capacity {
                        queue.pop_front();
                        evicted += 1;
                    }
                }
                history.len -= evicted;
            }
        }

        Ok(())
    }

    /// All retained events of `topic` with id >= `start_id`, ascending.
    pub async fn query(&self, topic: &str, start_id: u64) -> Vec<Event> {
        let history = self.inner.lock().await;
        history
            .topics
            .get(topic)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|e| e.id >= start_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest id retained for `topic`.
    pub async fn last_id(&self, topic: &str) -> Option<u64> {
        let history = self.inner.lock().await;
        history
            .topics
            .get(topic)
            .and_then(|queue| queue.back())
            .map(|e| e.id)
    }

    /// Number of retained events across all topics.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len
    }
}

impl History {
    fn evict_oldest(&mut self) {
        let Some(topic) = self.arrival.pop_front() else {
            return;
        };
        if let Some(queue) = self.topics.get_mut(&topic) {
            if let Some(evicted) = queue.pop_front() {
                self.len -= 1;
                debug!(topic = %topic, id = evicted.id, "Evicted event from history");
            }
        }
    }
}
