use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use tailcast_channels::DestinationManager;
use tailcast_core::config::SearchConfig;
use tailcast_core::types::{Destination, SessionId};
use tailcast_core::Result;
use tailcast_index::SearchIndex;

use crate::ratelimit::RateLimiter;
use crate::sse::SseBroker;

#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub session_id: SessionId,
    pub path: Option<PathBuf>,
    pub destination: Destination,
    pub replay_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AttachOutcome {
    pub attached: bool,
    pub replayed_events: usize,
}

/// The slice of the orchestrator the HTTP surface drives. Keeps the gateway
/// free of service wiring and testable against a stub.
pub trait ServiceApi: Send + Sync + 'static {
    fn attach(&self, request: AttachRequest) -> BoxFuture<'_, Result<AttachOutcome>>;

    fn detach(
        &self,
        session_id: &SessionId,
        destination: &Destination,
    ) -> BoxFuture<'_, Result<()>>;

    /// First `limit` rendered events from the head of the transcript.
    fn preview(&self, session_id: &SessionId, limit: usize) -> BoxFuture<'_, Result<String>>;

    /// Kick an incremental index refresh.
    fn refresh_index(&self) -> BoxFuture<'_, Result<()>>;

    fn is_watched(&self, session_id: &SessionId) -> bool;

    fn sessions_watched(&self) -> usize;

    /// Bot health for `/health`: platform → configured/validated.
    fn bot_status(&self) -> serde_json::Value;
}

/// Shared application state for axum handlers.
pub struct AppState {
    pub api: Arc<dyn ServiceApi>,
    pub broker: Arc<SseBroker>,
    pub manager: Arc<DestinationManager>,
    pub index: Option<Arc<SearchIndex>>,
    pub search: SearchConfig,
    pub started_at: Instant,
    pub search_limiter: RateLimiter,
    pub preview_limiter: RateLimiter,
    pub refresh_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        api: Arc<dyn ServiceApi>,
        broker: Arc<SseBroker>,
        manager: Arc<DestinationManager>,
        index: Option<Arc<SearchIndex>>,
        search: SearchConfig,
    ) -> Self {
        Self {
            api,
            broker,
            manager,
            index,
            search,
            started_at: Instant::now(),
            search_limiter: RateLimiter::new(30, Duration::from_secs(60)),
            preview_limiter: RateLimiter::new(60, Duration::from_secs(60)),
            refresh_limiter: RateLimiter::new(1, Duration::from_secs(60)),
        }
    }
}
