use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::publisher::OutboundMessage;

/// Default coalescing delays, roughly half of each platform's published
/// per-message edit rate limits.
pub const TELEGRAM_DEBOUNCE: Duration = Duration::from_millis(500);
pub const SLACK_DEBOUNCE: Duration = Duration::from_millis(2000);

pub fn delay_for(platform: &str) -> Duration {
    match platform {
        "telegram" => TELEGRAM_DEBOUNCE,
        "slack" => SLACK_DEBOUNCE,
        _ => TELEGRAM_DEBOUNCE,
    }
}

/// One pending update per `(platform, identifier, platform_message_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub platform: &'static str,
    pub identifier: String,
    pub message_id: String,
}

pub type UpdateFn = Box<dyn FnOnce(OutboundMessage) -> BoxFuture<'static, ()> + Send>;

struct Pending {
    fire_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Coalesces rapid edits of the same message: each `schedule_update` replaces
/// the previous pending one, and only the latest content is delivered when
/// the timer fires.
#[derive(Default)]
pub struct Debouncer {
    pending: Arc<Mutex<HashMap<DebounceKey, Pending>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the pending update for `key`. `update_fn` runs
    /// once, after `delay`, with `content`; its failures are the callee's to
    /// log, never propagated here.
    pub fn schedule_update(
        &self,
        key: DebounceKey,
        delay: Duration,
        content: OutboundMessage,
        update_fn: UpdateFn,
    ) {
        let (fire_tx, fire_rx) = oneshot::channel();
        let pending = self.pending.clone();
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = fire_rx => {}
            }
            {
                let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                map.remove(&task_key);
            }
            update_fn(content).await;
        });

        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = map.insert(key, Pending { fire_tx, handle }) {
            previous.handle.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Fire all pending updates immediately and wait for them to finish.
    /// Called before session stop and service shutdown.
    pub async fn flush(&self) {
        let drained: Vec<Pending> = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, pending)| pending).collect()
        };
        for pending in drained {
            let _ = pending.fire_tx.send(());
            if let Err(e) = pending.handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Debounced update panicked");
                }
            }
        }
    }

    /// Drop all pending updates without executing them.
    pub fn cancel_all(&self) {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, pending) in map.drain() {
            pending.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(message_id: &str) -> DebounceKey {
        DebounceKey {
            platform: "telegram",
            identifier: "42".into(),
            message_id: message_id.into(),
        }
    }

    fn counting_fn(counter: Arc<AtomicUsize>) -> UpdateFn {
        Box::new(move |_content| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_updates_coalesce_to_one() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            debouncer.schedule_update(
                key("m1"),
                TELEGRAM_DEBOUNCE,
                OutboundMessage::text(format!("v{i}")),
                counting_fn(fired.clone()),
            );
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_fire_independently() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.schedule_update(
            key("m1"),
            TELEGRAM_DEBOUNCE,
            OutboundMessage::text("a"),
            counting_fn(fired.clone()),
        );
        debouncer.schedule_update(
            key("m2"),
            TELEGRAM_DEBOUNCE,
            OutboundMessage::text("b"),
            counting_fn(fired.clone()),
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_content_wins() {
        let debouncer = Debouncer::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for text in ["first", "second", "final"] {
            let seen = seen.clone();
            debouncer.schedule_update(
                key("m1"),
                TELEGRAM_DEBOUNCE,
                OutboundMessage::text(text),
                Box::new(move |content| {
                    Box::pin(async move {
                        seen.lock().unwrap().push(content.text);
                    })
                }),
            );
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().unwrap(), vec!["final".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_fires_without_waiting() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.schedule_update(
            key("m1"),
            Duration::from_secs(60),
            OutboundMessage::text("x"),
            counting_fn(fired.clone()),
        );

        debouncer.flush().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_drops_updates() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.schedule_update(
            key("m1"),
            TELEGRAM_DEBOUNCE,
            OutboundMessage::text("x"),
            counting_fn(fired.clone()),
        );
        debouncer.cancel_all();

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending_count(), 0);
    }
}
