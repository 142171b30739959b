use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::sse::Event;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use tailcast_core::types::{SessionEvent, SessionId};
use tailcast_session::BufferManager;

/// Per-subscriber queue depth. A subscriber that cannot drain this many
/// frames is considered dead and dropped.
const SUBSCRIBER_QUEUE: usize = 64;

/// Why a session's stream ended, as sent in the `session_ended` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    FileDeleted,
    Detached,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileDeleted => "file_deleted",
            Self::Detached => "detached",
            Self::Shutdown => "shutdown",
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Per-session SSE subscriber sets with replay-on-connect.
pub struct SseBroker {
    subscribers: Mutex<HashMap<SessionId, Vec<Subscriber>>>,
    buffers: Arc<BufferManager>,
    next_id: AtomicU64,
}

impl SseBroker {
    pub fn new(buffers: Arc<BufferManager>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            buffers,
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe a connection. Events after `last_event_id` (or the whole
    /// buffer) are queued immediately, then live events follow.
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        last_event_id: Option<&str>,
    ) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        for (id, event) in self.buffers.get_since(session_id, last_event_id) {
            let _ = tx.try_send(frame(&id, &event));
        }

        let subscriber = Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .entry(session_id.clone())
            .or_default()
            .push(subscriber);
        debug!(session = %session_id, "SSE subscriber connected");

        ReceiverStream::new(rx)
    }

    /// Deliver one event to every live subscriber. Writes are non-blocking;
    /// a subscriber with a full or closed queue is dropped.
    pub fn broadcast(&self, session_id: &SessionId, event_id: &str, event: &SessionEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = subscribers.get_mut(session_id) else {
            return;
        };
        list.retain(|subscriber| match subscriber.tx.try_send(frame(event_id, event)) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    session = %session_id,
                    subscriber = subscriber.id,
                    error = %e,
                    "Dropping SSE subscriber"
                );
                false
            }
        });
        if list.is_empty() {
            subscribers.remove(session_id);
        }
    }

    /// Send `session_ended` and close every subscriber of the session.
    pub fn close_session(&self, session_id: &SessionId, reason: EndReason) {
        let removed = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.remove(session_id)
        };
        let Some(list) = removed else {
            return;
        };
        let data = serde_json::json!({ "reason": reason.as_str() }).to_string();
        for subscriber in list {
            let event = Event::default().event("session_ended").data(&data);
            let _ = subscriber.tx.try_send(event);
            // Dropping the sender closes the stream.
        }
        debug!(session = %session_id, reason = reason.as_str(), "SSE session closed");
    }

    /// Close everything (service shutdown).
    pub fn close_all(&self, reason: EndReason) {
        let sessions: Vec<SessionId> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.keys().cloned().collect()
        };
        for session_id in sessions {
            self.close_session(&session_id, reason);
        }
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.get(session_id).map(Vec::len).unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.values().map(Vec::len).sum()
    }
}

/// One SSE frame: `id:` is the buffer id, `event:` the wire name, `data:`
/// a single line of JSON.
fn frame(event_id: &str, event: &SessionEvent) -> Event {
    Event::default()
        .id(event_id)
        .event(event.wire_name())
        .data(event.wire_data().to_string())
}
