use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tailcast_core::config::AppConfig;
use tailcast_core::types::{AttachedDestination, Destination, SessionId};
use tailcast_core::{Result, TailcastError};

/// How long file watching survives after the last destination detaches, so
/// a quick re-attach keeps its context.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(300);

/// Session lifecycle callbacks the manager drives: bring a session's watch
/// up on first attach, tear it down when the keep-alive expires.
pub trait SessionLifecycle: Send + Sync + 'static {
    fn on_session_start(&self, session_id: &SessionId) -> BoxFuture<'_, Result<()>>;
    fn on_session_stop(&self, session_id: &SessionId) -> BoxFuture<'_, ()>;
}

struct Inner {
    destinations: HashMap<SessionId, Vec<AttachedDestination>>,
    keep_alive_timers: HashMap<SessionId, JoinHandle<()>>,
}

/// Tracks which destinations are attached to which sessions and owns the
/// keep-alive timers between last detach and session stop.
pub struct DestinationManager {
    inner: Arc<Mutex<Inner>>,
    lifecycle: Arc<dyn SessionLifecycle>,
    keep_alive: Duration,
}

impl DestinationManager {
    pub fn new(lifecycle: Arc<dyn SessionLifecycle>) -> Self {
        Self::with_keep_alive(lifecycle, DEFAULT_KEEP_ALIVE)
    }

    pub fn with_keep_alive(lifecycle: Arc<dyn SessionLifecycle>, keep_alive: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                destinations: HashMap::new(),
                keep_alive_timers: HashMap::new(),
            })),
            lifecycle,
            keep_alive,
        }
    }

    /// Attach a destination. The first attach for a session starts it; a
    /// pending keep-alive timer is cancelled without restarting. Attaching
    /// an already-present destination is a no-op success.
    pub async fn attach(&self, session_id: &SessionId, destination: Destination) -> Result<()> {
        destination.validate()?;

        let needs_start = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            let had_timer = match inner.keep_alive_timers.remove(session_id) {
                Some(timer) => {
                    timer.abort();
                    debug!(session = %session_id, "Keep-alive cancelled by re-attach");
                    true
                }
                None => false,
            };

            let attached = inner.destinations.entry(session_id.clone()).or_default();
            if attached
                .iter()
                .any(|a| a.destination == destination)
            {
                return Ok(());
            }
            let was_empty = attached.is_empty();
            attached.push(AttachedDestination::now(destination.clone()));
            // A session in keep-alive still has a live watch; only a
            // genuinely fresh session needs starting.
            was_empty && !had_timer
        };

        if needs_start {
            if let Err(e) = self.lifecycle.on_session_start(session_id).await {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(attached) = inner.destinations.get_mut(session_id) {
                    attached.retain(|a| a.destination != destination);
                    if attached.is_empty() {
                        inner.destinations.remove(session_id);
                    }
                }
                return Err(e);
            }
            info!(session = %session_id, destination = %destination, "Session started");
        } else {
            debug!(session = %session_id, destination = %destination, "Destination attached");
        }
        Ok(())
    }

    /// Detach by exact identifier match (including the Telegram thread).
    /// The last detach arms the keep-alive timer.
    pub async fn detach(&self, session_id: &SessionId, destination: &Destination) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let attached = inner
            .destinations
            .get_mut(session_id)
            .ok_or_else(|| TailcastError::SessionNotFound(session_id.to_string()))?;

        let before = attached.len();
        attached.retain(|a| a.destination != *destination);
        if attached.len() == before {
            return Err(TailcastError::DestinationNotAttached(
                destination.to_string(),
            ));
        }

        if attached.is_empty() {
            inner.destinations.remove(session_id);
            let timer = self.spawn_keep_alive(session_id.clone());
            inner.keep_alive_timers.insert(session_id.clone(), timer);
            info!(session = %session_id, keep_alive_secs = self.keep_alive.as_secs(), "Last destination detached, keep-alive armed");
        }
        Ok(())
    }

    fn spawn_keep_alive(&self, session_id: SessionId) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let lifecycle = self.lifecycle.clone();
        let keep_alive = self.keep_alive;
        tokio::spawn(async move {
            tokio::time::sleep(keep_alive).await;
            {
                let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                guard.keep_alive_timers.remove(&session_id);
            }
            info!(session = %session_id, "Keep-alive expired, stopping session");
            lifecycle.on_session_stop(&session_id).await;
        })
    }

    /// Populate runtime state from persisted config at startup, starting
    /// every session that has destinations.
    pub async fn restore_from_config(&self, config: &AppConfig) -> Result<()> {
        for (session_id, session_config) in &config.sessions {
            let destinations = session_config.destinations.to_destinations();
            if destinations.is_empty() {
                continue;
            }
            let session_id = SessionId::from_str(session_id);
            for destination in destinations {
                if let Err(e) = self.attach(&session_id, destination.clone()).await {
                    warn!(
                        session = %session_id,
                        destination = %destination,
                        error = %e,
                        "Failed to restore destination"
                    );
                }
            }
        }
        Ok(())
    }

    /// Destinations attached to one session.
    pub fn destinations(&self, session_id: &SessionId) -> Vec<AttachedDestination> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .destinations
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of all sessions with at least one destination.
    pub fn list(&self) -> Vec<(SessionId, Vec<AttachedDestination>)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = inner
            .destinations
            .iter()
            .map(|(id, attached)| (id.clone(), attached.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.destinations.contains_key(session_id) || inner.keep_alive_timers.contains_key(session_id)
    }

    /// Cancel all keep-alive timers. Attached destinations stay in place for
    /// config persistence.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in inner.keep_alive_timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingLifecycle {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl SessionLifecycle for RecordingLifecycle {
        fn on_session_start(&self, _session_id: &SessionId) -> BoxFuture<'_, Result<()>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn on_session_stop(&self, _session_id: &SessionId) -> BoxFuture<'_, ()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    fn telegram(chat_id: i64, thread_id: Option<i64>) -> Destination {
        Destination::Telegram { chat_id, thread_id }
    }

    fn session() -> SessionId {
        SessionId::from_str("s-1")
    }

    #[tokio::test]
    async fn first_attach_starts_session_once() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let manager = DestinationManager::new(lifecycle.clone());

        manager.attach(&session(), telegram(1, None)).await.unwrap();
        manager.attach(&session(), telegram(2, None)).await.unwrap();
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.destinations(&session()).len(), 2);
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let manager = DestinationManager::new(lifecycle.clone());

        manager.attach(&session(), telegram(1, None)).await.unwrap();
        manager.attach(&session(), telegram(1, None)).await.unwrap();
        assert_eq!(manager.destinations(&session()).len(), 1);
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn general_topic_thread_is_rejected() {
        let manager = DestinationManager::new(Arc::new(RecordingLifecycle::default()));
        let err = manager
            .attach(&session(), telegram(-100, Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, TailcastError::InvalidDestination(_)));
        assert!(manager.destinations(&session()).is_empty());
    }

    #[tokio::test]
    async fn detach_requires_exact_thread_match() {
        let manager = DestinationManager::new(Arc::new(RecordingLifecycle::default()));
        manager
            .attach(&session(), telegram(-100, Some(123)))
            .await
            .unwrap();

        let err = manager
            .detach(&session(), &telegram(-100, None))
            .await
            .unwrap_err();
        assert!(matches!(err, TailcastError::DestinationNotAttached(_)));

        manager
            .detach(&session(), &telegram(-100, Some(123)))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_expiry_stops_session() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let manager =
            DestinationManager::with_keep_alive(lifecycle.clone(), Duration::from_secs(300));

        manager.attach(&session(), telegram(1, None)).await.unwrap();
        manager.detach(&session(), &telegram(1, None)).await.unwrap();
        assert!(manager.is_active(&session()));

        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;
        assert_eq!(lifecycle.stops.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active(&session()));
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_cancels_keep_alive_without_restart() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let manager =
            DestinationManager::with_keep_alive(lifecycle.clone(), Duration::from_secs(300));

        manager.attach(&session(), telegram(1, None)).await.unwrap();
        manager.detach(&session(), &telegram(1, None)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(100)).await;
        manager.attach(&session(), telegram(1, None)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(400)).await;
        tokio::task::yield_now().await;
        assert_eq!(lifecycle.stops.load(Ordering::SeqCst), 0);
        // on_session_start ran only for the very first attach.
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restore_from_config_starts_sessions() {
        use tailcast_core::config::{
            DestinationsConfig, SessionConfig, TelegramDestination,
        };

        let lifecycle = Arc::new(RecordingLifecycle::default());
        let manager = DestinationManager::new(lifecycle.clone());

        let mut config = AppConfig::default();
        config.sessions.insert(
            "s-1".into(),
            SessionConfig {
                path: "/tmp/s-1.jsonl".into(),
                destinations: DestinationsConfig {
                    telegram: vec![TelegramDestination {
                        chat_id: 7,
                        thread_id: None,
                    }],
                    slack: Vec::new(),
                },
            },
        );
        config.sessions.insert(
            "s-empty".into(),
            SessionConfig {
                path: "/tmp/s-empty.jsonl".into(),
                destinations: DestinationsConfig::default(),
            },
        );

        manager.restore_from_config(&config).await.unwrap();
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.list().len(), 1);
    }
}
