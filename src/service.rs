use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tailcast_channels::{
    debounce, edit_with_retry, format, send_with_retry, DebounceKey, Debouncer,
    DestinationManager, EditOutcome, MessageAction, MessageKey, MessagePayload,
    MessageStateTracker, OutboundMessage, Publisher, SessionLifecycle, SlackPublisher,
    TelegramPublisher,
};
use tailcast_core::config::AppConfig;
use tailcast_core::types::{Destination, SessionId};
use tailcast_core::{Result, TailcastError};
use tailcast_gateway::sse::EndReason;
use tailcast_gateway::{AttachOutcome, AttachRequest, ServiceApi, SseBroker};
use tailcast_index::{refresh, SearchIndex};
use tailcast_session::{
    process, read_new_lines, seek_to_last_n_lines, BufferManager, Consumer, ProcessingContext,
    SessionState, SessionWatcher, StateStore, WatchEvent,
};

/// Lines of existing transcript replayed into a fresh context when a
/// session is first watched.
const CATCHUP_LINES: usize = 50;
/// Seconds between backup passes when backups are enabled.
const BACKUP_INTERVAL_SECS: u64 = 3600;

struct ActiveSession {
    path: PathBuf,
    consumer: Consumer,
    context: ProcessingContext,
    offset: u64,
    line_number: u64,
}

/// Owns every component's lifecycle and runs the per-session pipeline:
/// read, classify, process, broadcast, track, debounce, publish, persist.
pub struct Service {
    config: Mutex<AppConfig>,
    config_path: PathBuf,
    state_store: StateStore,
    buffers: Arc<BufferManager>,
    broker: Arc<SseBroker>,
    tracker: Arc<MessageStateTracker>,
    debouncer: Arc<Debouncer>,
    publishers: HashMap<&'static str, Arc<dyn Publisher>>,
    validated: Mutex<HashSet<&'static str>>,
    watcher: Arc<SessionWatcher>,
    index: Option<Arc<SearchIndex>>,
    manager: OnceLock<Arc<DestinationManager>>,
    active: Mutex<HashMap<SessionId, ActiveSession>>,
    cancel: CancellationToken,
}

impl Service {
    /// Wire the components from config. The watcher is created here but
    /// only starts delivering in `start()`.
    pub fn new(
        config: AppConfig,
        config_path: PathBuf,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<WatchEvent>)> {
        let mut publishers: HashMap<&'static str, Arc<dyn Publisher>> = HashMap::new();
        if let Some(telegram) = &config.bots.telegram {
            publishers.insert("telegram", Arc::new(TelegramPublisher::new(&telegram.token)));
        }
        if let Some(slack) = &config.bots.slack {
            publishers.insert("slack", Arc::new(SlackPublisher::new(&slack.token)));
        }
        if publishers.is_empty() {
            info!("No bots configured; SSE-only mode");
        }

        let index = if config.index.persist {
            Some(Arc::new(SearchIndex::safe_initialize(
                &config.search_db_path(),
            )?))
        } else {
            Some(Arc::new(SearchIndex::in_memory()?))
        };

        let state_store = StateStore::new(config.database.state_dir.clone());
        let buffers = Arc::new(BufferManager::new());
        let (watcher, watch_rx) = SessionWatcher::new();

        let service = Arc::new(Self {
            config: Mutex::new(config),
            config_path,
            state_store,
            buffers: buffers.clone(),
            broker: Arc::new(SseBroker::new(buffers)),
            tracker: Arc::new(MessageStateTracker::new()),
            debouncer: Arc::new(Debouncer::new()),
            publishers,
            validated: Mutex::new(HashSet::new()),
            watcher: Arc::new(watcher),
            index,
            manager: OnceLock::new(),
            active: Mutex::new(HashMap::new()),
            cancel,
        });

        let lifecycle: Arc<dyn SessionLifecycle> = service.clone();
        let manager = Arc::new(DestinationManager::new(lifecycle));
        let _ = service.manager.set(manager);

        Ok((service, watch_rx))
    }

    pub fn manager(&self) -> Arc<DestinationManager> {
        self.manager.get().expect("manager wired in new()").clone()
    }

    pub fn broker(&self) -> Arc<SseBroker> {
        self.broker.clone()
    }

    pub fn index(&self) -> Option<Arc<SearchIndex>> {
        self.index.clone()
    }

    pub fn search_config(&self) -> tailcast_core::config::SearchConfig {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .search
            .clone()
    }

    /// Bring everything up: initial index build, periodic tasks, restored
    /// destinations, watch loop.
    pub async fn start(
        self: Arc<Self>,
        watch_rx: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
    ) -> Result<()> {
        if let Some(index) = &self.index {
            let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if config.database.vacuum_on_startup {
                index.vacuum()?;
            }
            if index.session_count()? == 0 && !config.index.paths.is_empty() {
                info!("Search index empty, building");
                let index = index.clone();
                let index_config = config.index.clone();
                tokio::task::spawn_blocking(move || refresh(&index, &index_config))
                    .await
                    .map_err(|e| TailcastError::Database(e.to_string()))?
                    .map_err(|e| {
                        error!(error = %e, "Initial index build failed");
                        e
                    })
                    .ok();
            }
            self.spawn_periodic_tasks();
        }

        self.watcher.start()?;
        self.clone().spawn_watch_loop(watch_rx);

        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        self.manager().restore_from_config(&config).await?;

        Ok(())
    }

    /// Orderly shutdown: flush pending edits, end all streams, persist
    /// session states, close publishers and the database.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.manager().shutdown();
        self.debouncer.flush().await;
        self.broker.close_all(EndReason::Shutdown);

        let sessions: Vec<SessionId> = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.keys().cloned().collect()
        };
        for session_id in &sessions {
            self.persist_session(session_id);
        }

        for publisher in self.publishers.values() {
            if let Err(e) = publisher.close().await {
                warn!(platform = publisher.platform(), error = %e, "Publisher close failed");
            }
        }
        if let Some(index) = &self.index {
            if let Err(e) = index.checkpoint() {
                warn!(error = %e, "Final checkpoint failed");
            }
        }
        self.watcher.stop();
        info!("Service stopped");
    }

    fn spawn_periodic_tasks(&self) {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(index) = self.index.clone() else {
            return;
        };

        if config.index.refresh_interval > 0 {
            let index = index.clone();
            let index_config = config.index.clone();
            let cancel = self.cancel.clone();
            let interval = Duration::from_secs(config.index.refresh_interval);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let index = index.clone();
                    let index_config = index_config.clone();
                    let result =
                        tokio::task::spawn_blocking(move || refresh(&index, &index_config)).await;
                    match result {
                        Ok(Ok(stats)) => debug!(?stats, "Periodic refresh done"),
                        Ok(Err(e)) => warn!(error = %e, "Periodic refresh failed"),
                        Err(e) => warn!(error = %e, "Refresh task panicked"),
                    }
                }
            });
        }

        if config.database.checkpoint_interval > 0 {
            let index = index.clone();
            let cancel = self.cancel.clone();
            let interval = Duration::from_secs(config.database.checkpoint_interval);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = index.checkpoint() {
                        warn!(error = %e, "Periodic checkpoint failed");
                    }
                }
            });
        }

        if config.database.backup.enabled {
            if let Some(backup_dir) = config.database.backup.path.clone() {
                let keep = config.database.backup.keep_count;
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(BACKUP_INTERVAL_SECS)) => {}
                        }
                        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
                        let destination = backup_dir.join(format!("search-{stamp}.db"));
                        if let Err(e) = index.backup(&destination) {
                            warn!(error = %e, "Periodic backup failed");
                            continue;
                        }
                        match tailcast_index::store::rotate_backups(&backup_dir, "search-", keep) {
                            Ok(removed) if removed > 0 => {
                                debug!(removed, "Rotated old backups")
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Backup rotation failed"),
                        }
                    }
                });
            }
        }
    }

    fn spawn_watch_loop(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        let service = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    event = rx.recv() => {
                        match event {
                            Some(WatchEvent::Changed(session_id)) => {
                                service.process_session(&session_id).await;
                            }
                            Some(WatchEvent::Deleted(session_id)) => {
                                service.handle_file_deleted(&session_id);
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("Watch loop exited");
        });
    }

    /// Read and process any new lines for one session, fanning events out
    /// to the buffer, SSE subscribers, and messaging destinations.
    async fn process_session(&self, session_id: &SessionId) {
        let Some(mut session) = ({
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(session_id)
        }) else {
            return;
        };

        let batch = match read_new_lines(&session.path, session.offset) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Read failed");
                let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
                active.insert(session_id.clone(), session);
                return;
            }
        };

        for record in &batch.records {
            let (events, next_context) = process(&session.context, record);
            session.context = next_context;
            for event in &events {
                session.consumer.apply(event);
                let event_id = self.buffers.add(session_id, event.clone());
                self.broker.broadcast(session_id, &event_id, event);
                if let Some(action) = self.tracker.handle_event(session_id, event) {
                    self.dispatch_action(session_id, action).await;
                }
            }
        }

        session.offset = batch.new_offset;
        session.line_number += batch.lines_read as u64;

        let state = SessionState {
            file_position: session.offset,
            line_number: session.line_number,
            processing_context: session.context.clone(),
            last_modified: Utc::now(),
        };
        if let Err(e) = self.state_store.save(session_id, &state) {
            warn!(session = %session_id, error = %e, "State save failed");
        }

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(session_id.clone(), session);
    }

    /// Route one tracker action to every attached destination: a known
    /// message id becomes a debounced edit, everything else a direct send.
    async fn dispatch_action(&self, session_id: &SessionId, action: MessageAction) {
        let destinations = self.manager().destinations(session_id);
        if destinations.is_empty() {
            return;
        }

        let message = outbound_message(&action);
        for attached in destinations {
            let destination = attached.destination;
            let Some(publisher) = self.publishers.get(destination.kind()) else {
                continue;
            };

            match self
                .tracker
                .message_id_for(session_id, &action.key, &destination)
            {
                Some(message_id) => {
                    self.schedule_edit(
                        session_id,
                        publisher.clone(),
                        destination,
                        action.key.clone(),
                        message_id,
                        message.clone(),
                    );
                }
                None => {
                    if let Some(platform_id) =
                        send_with_retry(publisher.as_ref(), &destination, &message).await
                    {
                        self.tracker.record_message_id(
                            session_id,
                            &action.key,
                            &destination,
                            platform_id,
                        );
                    }
                }
            }
        }
    }

    fn schedule_edit(
        &self,
        session_id: &SessionId,
        publisher: Arc<dyn Publisher>,
        destination: Destination,
        key: MessageKey,
        message_id: String,
        message: OutboundMessage,
    ) {
        let debounce_key = DebounceKey {
            platform: publisher.platform(),
            identifier: destination.identifier(),
            message_id: message_id.clone(),
        };
        let delay = debounce::delay_for(publisher.platform());
        let tracker = self.tracker.clone();
        let session_id = session_id.clone();
        self.debouncer.schedule_update(
            debounce_key,
            delay,
            message,
            Box::new(move |content| {
                Box::pin(async move {
                    let outcome = edit_with_retry(
                        publisher.as_ref(),
                        &destination,
                        &message_id,
                        &content,
                    )
                    .await;
                    if outcome == Some(EditOutcome::NotFound) {
                        tracker.forget_message_id(&session_id, &key, &destination);
                    }
                })
            }),
        );
    }

    fn handle_file_deleted(&self, session_id: &SessionId) {
        warn!(session = %session_id, "Transcript deleted");
        self.broker.close_session(session_id, EndReason::FileDeleted);
        self.watcher.remove(session_id);
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(session_id);
        // Destinations stay attached; removing them is the operator's call.
    }

    fn persist_session(&self, session_id: &SessionId) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(session) = active.get(session_id) else {
            return;
        };
        let state = SessionState {
            file_position: session.offset,
            line_number: session.line_number,
            processing_context: session.context.clone(),
            last_modified: Utc::now(),
        };
        if let Err(e) = self.state_store.save(session_id, &state) {
            warn!(session = %session_id, error = %e, "State save failed");
        }
    }

    fn session_path(&self, session_id: &SessionId) -> Option<PathBuf> {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config
            .sessions
            .get(session_id.as_str())
            .map(|s| s.path.clone())
    }

    /// Validate a publisher's credentials once per process.
    async fn ensure_validated(&self, kind: &'static str) -> Result<()> {
        {
            let validated = self.validated.lock().unwrap_or_else(|e| e.into_inner());
            if validated.contains(kind) {
                return Ok(());
            }
        }
        let publisher = self
            .publishers
            .get(kind)
            .ok_or_else(|| TailcastError::BotNotConfigured(kind.to_string()))?;
        publisher.validate().await?;
        let mut validated = self.validated.lock().unwrap_or_else(|e| e.into_inner());
        validated.insert(kind);
        Ok(())
    }

    fn save_config(&self) {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Err(e) = config.save(&self.config_path) {
            warn!(path = %self.config_path.display(), error = %e, "Config save failed");
        }
    }
}

impl SessionLifecycle for Service {
    /// First attach: resume from persisted state, or seed the context from
    /// the transcript tail, then start watching.
    fn on_session_start(&self, session_id: &SessionId) -> BoxFuture<'_, Result<()>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            let path = self
                .session_path(&session_id)
                .ok_or_else(|| TailcastError::SessionNotFound(session_id.to_string()))?;
            if !path.exists() {
                return Err(TailcastError::SessionFileNotFound(
                    path.display().to_string(),
                ));
            }

            let (offset, line_number, context) = match self.state_store.load(&session_id) {
                Some(state) => {
                    debug!(session = %session_id, offset = state.file_position, "Resuming from saved state");
                    (
                        state.file_position,
                        state.line_number,
                        state.processing_context,
                    )
                }
                None => {
                    let offset = seek_to_last_n_lines(&path, CATCHUP_LINES)?;
                    (offset, 0, ProcessingContext::default())
                }
            };

            let mut session = ActiveSession {
                path: path.clone(),
                consumer: Consumer::new(),
                context,
                offset,
                line_number,
            };

            // Catch-up: build context and replay history without touching
            // the messaging destinations.
            let batch = read_new_lines(&path, session.offset)?;
            for record in &batch.records {
                let (events, next_context) = process(&session.context, record);
                session.context = next_context;
                for event in &events {
                    session.consumer.apply(event);
                    let event_id = self.buffers.add(&session_id, event.clone());
                    self.broker.broadcast(&session_id, &event_id, event);
                    self.tracker.handle_event(&session_id, event);
                }
            }
            session.offset = batch.new_offset;
            session.line_number += batch.lines_read as u64;

            {
                let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
                active.insert(session_id.clone(), session);
            }
            self.persist_session(&session_id);
            self.watcher.add(session_id.clone(), &path)?;
            info!(session = %session_id, path = %path.display(), "Session watching started");
            Ok(())
        })
    }

    /// Keep-alive expiry: flush, end streams, unwatch, drop state.
    fn on_session_stop(&self, session_id: &SessionId) -> BoxFuture<'_, ()> {
        let session_id = session_id.clone();
        Box::pin(async move {
            self.debouncer.flush().await;
            self.persist_session(&session_id);
            self.broker.close_session(&session_id, EndReason::Detached);
            self.watcher.remove(&session_id);
            self.buffers.remove(&session_id);
            self.tracker.remove_session(&session_id);
            {
                let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
                active.remove(&session_id);
            }
            if let Err(e) = self.state_store.delete(&session_id) {
                warn!(session = %session_id, error = %e, "State delete failed");
            }
            info!(session = %session_id, "Session watching stopped");
        })
    }
}

impl ServiceApi for Service {
    fn attach(&self, request: AttachRequest) -> BoxFuture<'_, Result<AttachOutcome>> {
        Box::pin(async move {
            request.destination.validate()?;

            let kind = request.destination.kind();
            if !self.publishers.contains_key(kind) {
                return Err(TailcastError::BotNotConfigured(kind.to_string()));
            }
            self.ensure_validated(kind).await?;

            // Resolve and persist the transcript path before the manager
            // fires on_session_start.
            {
                let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
                let existed = config.sessions.contains_key(request.session_id.as_str());
                let entry = config
                    .sessions
                    .entry(request.session_id.to_string())
                    .or_default();
                if let Some(path) = &request.path {
                    entry.path = path.clone();
                }
                let path_problem = if entry.path.as_os_str().is_empty() {
                    Some("no path known for session".to_string())
                } else if !entry.path.exists() {
                    Some(entry.path.display().to_string())
                } else {
                    None
                };
                if let Some(missing) = path_problem {
                    if !existed {
                        config.sessions.remove(request.session_id.as_str());
                    }
                    return Err(TailcastError::SessionFileNotFound(missing));
                }
            }

            self.manager()
                .attach(&request.session_id, request.destination.clone())
                .await?;

            {
                let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = config.sessions.get_mut(request.session_id.as_str()) {
                    entry.destinations.insert(&request.destination);
                }
            }
            self.save_config();

            let mut replayed_events = 0;
            if request.replay_count > 0 {
                let messages = self
                    .tracker
                    .replay_messages(&request.session_id, request.replay_count);
                replayed_events = messages.len();
                if !messages.is_empty() {
                    if let Some(publisher) = self.publishers.get(kind) {
                        let body = OutboundMessage::text(messages.join("\n\n"));
                        send_with_retry(publisher.as_ref(), &request.destination, &body).await;
                    }
                }
            }

            Ok(AttachOutcome {
                attached: true,
                replayed_events,
            })
        })
    }

    fn detach(
        &self,
        session_id: &SessionId,
        destination: &Destination,
    ) -> BoxFuture<'_, Result<()>> {
        let session_id = session_id.clone();
        let destination = destination.clone();
        Box::pin(async move {
            self.manager().detach(&session_id, &destination).await?;
            {
                let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = config.sessions.get_mut(session_id.as_str()) {
                    entry.destinations.remove(&destination);
                }
            }
            self.save_config();
            Ok(())
        })
    }

    /// Render the first `limit` events from the head of the transcript.
    /// Bounded: at most `limit * 8` lines are read, so previews of very
    /// large transcripts stay cheap.
    fn preview(&self, session_id: &SessionId, limit: usize) -> BoxFuture<'_, Result<String>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            let path = self
                .session_path(&session_id)
                .ok_or_else(|| TailcastError::SessionNotFound(session_id.to_string()))?;
            if !path.exists() {
                return Err(TailcastError::SessionFileNotFound(
                    path.display().to_string(),
                ));
            }

            let limit = limit.clamp(1, 200);
            let rendered = tokio::task::spawn_blocking(move || -> Result<String> {
                use std::io::BufRead;
                let file = std::fs::File::open(&path)?;
                let reader = std::io::BufReader::new(file);
                let mut consumer = Consumer::new();
                let mut context = ProcessingContext::default();
                let mut emitted = 0usize;

                for line in reader.lines().take(limit * 8) {
                    let Ok(line) = line else { break };
                    let Ok(record) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };
                    let (events, next_context) = process(&context, &record);
                    context = next_context;
                    for event in &events {
                        consumer.apply(event);
                        emitted += 1;
                    }
                    if emitted >= limit {
                        break;
                    }
                }
                Ok(consumer.render())
            })
            .await
            .map_err(|e| TailcastError::Gateway(e.to_string()))??;

            Ok(rendered)
        })
    }

    fn refresh_index(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(index) = self.index.clone() else {
                return Err(TailcastError::Database("no search index".into()));
            };
            let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).index.clone();
            tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || refresh(&index, &config)).await;
                match result {
                    Ok(Ok(stats)) => info!(?stats, "Forced refresh done"),
                    Ok(Err(e)) => warn!(error = %e, "Forced refresh failed"),
                    Err(e) => warn!(error = %e, "Refresh task panicked"),
                }
            });
            Ok(())
        })
    }

    fn is_watched(&self, session_id: &SessionId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(session_id)
    }

    fn sessions_watched(&self) -> usize {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.len()
    }

    fn bot_status(&self) -> serde_json::Value {
        let validated = self.validated.lock().unwrap_or_else(|e| e.into_inner());
        let status = |kind: &str| {
            serde_json::json!({
                "configured": self.publishers.contains_key(kind),
                "validated": validated.contains(kind),
            })
        };
        serde_json::json!({
            "telegram": status("telegram"),
            "slack": status("slack"),
        })
    }
}

/// Render a tracker action into the platform-neutral outbound form.
fn outbound_message(action: &MessageAction) -> OutboundMessage {
    let text = format::payload_text(&action.payload);
    let question = match &action.payload {
        MessagePayload::Question(q) => Some(q.clone()),
        _ => None,
    };
    OutboundMessage {
        text,
        question,
        remove_keyboard: action.remove_keyboard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use tailcast_core::config::{DestinationsConfig, SessionConfig};

    fn test_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.state_dir = dir.join("state");
        config.index.persist = false;
        config
    }

    fn write_lines(path: &std::path::Path, lines: &[&str]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.sync_all().unwrap();
    }

    #[tokio::test]
    async fn session_start_seeds_from_transcript_tail() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("s-1.jsonl");
        write_lines(
            &transcript,
            &[
                r#"{"type":"user","message":{"content":"hello"}}"#,
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
            ],
        );

        let mut config = test_config(dir.path());
        config.sessions.insert(
            "s-1".into(),
            SessionConfig {
                path: transcript.clone(),
                destinations: DestinationsConfig::default(),
            },
        );

        let (service, _rx) = Service::new(
            config,
            dir.path().join("tailcast.yaml"),
            CancellationToken::new(),
        )
        .unwrap();

        let session_id = SessionId::from_str("s-1");
        service.on_session_start(&session_id).await.unwrap();
        assert!(service.is_watched(&session_id));

        // Catch-up fed the buffer, so SSE replay works from the start.
        let replay = service.buffers.get_since(&session_id, None);
        assert_eq!(replay.len(), 2);

        // State was persisted at the post-catch-up offset.
        let state = service.state_store.load(&session_id).unwrap();
        assert_eq!(state.file_position, transcript.metadata().unwrap().len());
    }

    #[tokio::test]
    async fn session_start_resumes_from_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("s-1.jsonl");
        write_lines(
            &transcript,
            &[r#"{"type":"user","message":{"content":"old"}}"#],
        );
        let resume_offset = transcript.metadata().unwrap().len();
        write_lines(
            &transcript,
            &[r#"{"type":"user","message":{"content":"new"}}"#],
        );

        let mut config = test_config(dir.path());
        config.sessions.insert(
            "s-1".into(),
            SessionConfig {
                path: transcript.clone(),
                destinations: DestinationsConfig::default(),
            },
        );

        let (service, _rx) = Service::new(
            config,
            dir.path().join("tailcast.yaml"),
            CancellationToken::new(),
        )
        .unwrap();

        let session_id = SessionId::from_str("s-1");
        let state = SessionState {
            file_position: resume_offset,
            line_number: 1,
            processing_context: ProcessingContext::default(),
            last_modified: Utc::now(),
        };
        service.state_store.save(&session_id, &state).unwrap();

        service.on_session_start(&session_id).await.unwrap();

        // Only the line after the saved offset was replayed.
        let replay = service.buffers.get_since(&session_id, None);
        assert_eq!(replay.len(), 1);
    }

    #[tokio::test]
    async fn processing_pipeline_feeds_buffer_and_sse() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("s-1.jsonl");
        write_lines(&transcript, &[r#"{"type":"user","message":{"content":"a"}}"#]);

        let mut config = test_config(dir.path());
        config.sessions.insert(
            "s-1".into(),
            SessionConfig {
                path: transcript.clone(),
                destinations: DestinationsConfig::default(),
            },
        );

        let (service, _rx) = Service::new(
            config,
            dir.path().join("tailcast.yaml"),
            CancellationToken::new(),
        )
        .unwrap();
        let session_id = SessionId::from_str("s-1");
        service.on_session_start(&session_id).await.unwrap();

        write_lines(
            &transcript,
            &[r#"{"type":"assistant","message":{"content":[{"type":"text","text":"reply"}]}}"#],
        );
        service.process_session(&session_id).await;

        let events = service.buffers.get_since(&session_id, None);
        assert_eq!(events.len(), 2);

        // The consumer rendered both blocks.
        let active = service.active.lock().unwrap();
        let session = active.get(&session_id).unwrap();
        assert_eq!(session.consumer.render(), "❯ a\n\n● reply");
    }

    #[tokio::test]
    async fn attach_without_bot_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("s-1.jsonl");
        write_lines(&transcript, &[r#"{"type":"user","message":{"content":"a"}}"#]);

        let config = test_config(dir.path());
        let (service, _rx) = Service::new(
            config,
            dir.path().join("tailcast.yaml"),
            CancellationToken::new(),
        )
        .unwrap();

        let err = service
            .attach(AttachRequest {
                session_id: SessionId::from_str("s-1"),
                path: Some(transcript),
                destination: Destination::Telegram {
                    chat_id: 1,
                    thread_id: None,
                },
                replay_count: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TailcastError::BotNotConfigured(_)));
    }

    #[tokio::test]
    async fn preview_renders_transcript_head() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("s-1.jsonl");
        write_lines(
            &transcript,
            &[
                r#"{"type":"user","message":{"content":"question"}}"#,
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"answer"}]}}"#,
            ],
        );

        let mut config = test_config(dir.path());
        config.sessions.insert(
            "s-1".into(),
            SessionConfig {
                path: transcript,
                destinations: DestinationsConfig::default(),
            },
        );

        let (service, _rx) = Service::new(
            config,
            dir.path().join("tailcast.yaml"),
            CancellationToken::new(),
        )
        .unwrap();

        let preview = service
            .preview(&SessionId::from_str("s-1"), 10)
            .await
            .unwrap();
        assert_eq!(preview, "❯ question\n\n● answer");

        let err = service
            .preview(&SessionId::from_str("missing"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, TailcastError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn file_deletion_ends_streams_but_keeps_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("s-1.jsonl");
        write_lines(&transcript, &[r#"{"type":"user","message":{"content":"a"}}"#]);

        let mut config = test_config(dir.path());
        config.sessions.insert(
            "s-1".into(),
            SessionConfig {
                path: transcript.clone(),
                destinations: DestinationsConfig::default(),
            },
        );

        let (service, _rx) = Service::new(
            config,
            dir.path().join("tailcast.yaml"),
            CancellationToken::new(),
        )
        .unwrap();
        let session_id = SessionId::from_str("s-1");
        service.on_session_start(&session_id).await.unwrap();

        service.handle_file_deleted(&session_id);
        assert!(!service.is_watched(&session_id));
    }
}
