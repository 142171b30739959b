use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tailcast_core::types::{SessionEvent, SessionId};

/// Ring capacity per session; reconnecting SSE clients can replay at most
/// this many events.
pub const BUFFER_CAPACITY: usize = 20;

/// Bounded per-session event buffer with monotonic, lexicographically
/// ordered ids (`evt_000001`, `evt_000002`, …).
#[derive(Debug)]
pub struct EventBuffer {
    entries: VecDeque<(String, SessionEvent)>,
    counter: u64,
    capacity: usize,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(BUFFER_CAPACITY)
    }
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            counter: 0,
            capacity,
        }
    }

    /// Append an event, evicting the oldest entry when full. Returns the
    /// assigned event id.
    pub fn add(&mut self, event: SessionEvent) -> String {
        self.counter += 1;
        let id = format!("evt_{:06}", self.counter);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((id.clone(), event));
        id
    }

    /// Events strictly after `last_id`. A null, unknown, or evicted id
    /// yields the full current contents (SSE reconnection semantics).
    pub fn get_since(&self, last_id: Option<&str>) -> Vec<(String, SessionEvent)> {
        let Some(last_id) = last_id else {
            return self.entries.iter().cloned().collect();
        };
        match self.entries.iter().position(|(id, _)| id == last_id) {
            Some(pos) => self.entries.iter().skip(pos + 1).cloned().collect(),
            None => self.entries.iter().cloned().collect(),
        }
    }

    /// Empty the buffer and reset the id counter.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.counter = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One buffer per watched session.
#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: Mutex<HashMap<SessionId, EventBuffer>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the session's buffer, creating it on first use.
    pub fn add(&self, session_id: &SessionId, event: SessionEvent) -> String {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.entry(session_id.clone()).or_default().add(event)
    }

    pub fn get_since(
        &self,
        session_id: &SessionId,
        last_id: Option<&str>,
    ) -> Vec<(String, SessionEvent)> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .get(session_id)
            .map(|b| b.get_since(last_id))
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &SessionId) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(buffer) = buffers.get_mut(session_id) {
            buffer.clear();
        }
    }

    /// Drop the session's buffer entirely (unwatch).
    pub fn remove(&self, session_id: &SessionId) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailcast_core::types::SessionEvent;

    fn event() -> SessionEvent {
        SessionEvent::ClearAll
    }

    #[test]
    fn ids_are_monotonic_and_padded() {
        let mut buffer = EventBuffer::default();
        let a = buffer.add(event());
        let b = buffer.add(event());
        assert_eq!(a, "evt_000001");
        assert_eq!(b, "evt_000002");
        assert!(a < b);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut buffer = EventBuffer::default();
        for _ in 0..50 {
            buffer.add(event());
        }
        assert_eq!(buffer.len(), BUFFER_CAPACITY);
    }

    #[test]
    fn replay_semantics() {
        // 25 events at capacity 20: the buffer holds 6..=25.
        let mut buffer = EventBuffer::default();
        for _ in 0..25 {
            buffer.add(event());
        }

        let from_ten = buffer.get_since(Some("evt_000010"));
        assert_eq!(from_ten.len(), 15);
        assert_eq!(from_ten.first().unwrap().0, "evt_000011");
        assert_eq!(from_ten.last().unwrap().0, "evt_000025");

        // Evicted id: full contents.
        let evicted = buffer.get_since(Some("evt_000003"));
        assert_eq!(evicted.len(), 20);
        assert_eq!(evicted.first().unwrap().0, "evt_000006");

        // Null and unknown ids: full contents.
        assert_eq!(buffer.get_since(None).len(), 20);
        assert_eq!(buffer.get_since(Some("evt_999999")).len(), 20);

        // Latest id: nothing new.
        assert!(buffer.get_since(Some("evt_000025")).is_empty());
    }

    #[test]
    fn clear_resets_counter() {
        let mut buffer = EventBuffer::default();
        buffer.add(event());
        buffer.add(event());
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.add(event()), "evt_000001");
    }

    #[test]
    fn manager_keeps_sessions_separate() {
        let manager = BufferManager::new();
        let a = SessionId::from_str("a");
        let b = SessionId::from_str("b");

        manager.add(&a, event());
        manager.add(&a, event());
        manager.add(&b, event());

        assert_eq!(manager.get_since(&a, None).len(), 2);
        assert_eq!(manager.get_since(&b, None).len(), 1);

        manager.remove(&a);
        assert!(manager.get_since(&a, None).is_empty());
        assert_eq!(manager.get_since(&b, None).len(), 1);
    }
}
