use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tailcast_core::types::SessionId;
use tailcast_core::{Result, TailcastError};

/// Change notification for one watched session. The watcher only signals;
/// reading and parsing happen in the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed(SessionId),
    Deleted(SessionId),
}

/// Watches transcript files for appends and deletion.
///
/// Parent directories are watched (non-recursively) rather than the files
/// themselves, so re-creation after rotation is still observed; on platforms
/// without native file events notify falls back to polling.
pub struct SessionWatcher {
    files: Arc<Mutex<HashMap<PathBuf, SessionId>>>,
    dirs: Mutex<HashMap<PathBuf, usize>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl SessionWatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                files: Arc::new(Mutex::new(HashMap::new())),
                dirs: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
                tx,
            },
            rx,
        )
    }

    /// Begin delivering notifications. Directories registered before the
    /// start are picked up here.
    pub fn start(&self) -> Result<()> {
        let files = self.files.clone();
        let tx = self.tx.clone();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "File watcher error");
                    return;
                }
            };
            let deleted = matches!(event.kind, EventKind::Remove(_));
            let files = files.lock().unwrap_or_else(|e| e.into_inner());
            for path in &event.paths {
                if let Some(session_id) = files.get(path) {
                    let signal = if deleted {
                        WatchEvent::Deleted(session_id.clone())
                    } else {
                        WatchEvent::Changed(session_id.clone())
                    };
                    let _ = tx.send(signal);
                }
            }
        })
        .map_err(|e| TailcastError::Watch(e.to_string()))?;

        let mut guard = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(watcher);

        let dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(watcher) = guard.as_mut() {
            for dir in dirs.keys() {
                watcher
                    .watch(dir, RecursiveMode::NonRecursive)
                    .map_err(|e| TailcastError::Watch(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Watch a session's transcript file.
    pub fn add(&self, session_id: SessionId, path: &Path) -> Result<()> {
        let path = normalize(path)?;
        let parent = path
            .parent()
            .ok_or_else(|| TailcastError::Watch(format!("no parent dir: {}", path.display())))?
            .to_path_buf();

        {
            let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            files.insert(path.clone(), session_id.clone());
        }

        let mut dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        let count = dirs.entry(parent.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            let mut guard = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(watcher) = guard.as_mut() {
                watcher
                    .watch(&parent, RecursiveMode::NonRecursive)
                    .map_err(|e| TailcastError::Watch(e.to_string()))?;
            }
        }
        debug!(session = %session_id, path = %path.display(), "Watch added");
        Ok(())
    }

    /// Stop watching a session. Unknown sessions are a no-op.
    pub fn remove(&self, session_id: &SessionId) {
        let removed: Vec<PathBuf> = {
            let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            let paths: Vec<PathBuf> = files
                .iter()
                .filter(|(_, sid)| *sid == session_id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                files.remove(path);
            }
            paths
        };

        let mut dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        for path in removed {
            let Some(parent) = path.parent().map(Path::to_path_buf) else {
                continue;
            };
            if let Some(count) = dirs.get_mut(&parent) {
                *count -= 1;
                if *count == 0 {
                    dirs.remove(&parent);
                    let mut guard = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(watcher) = guard.as_mut() {
                        if let Err(e) = watcher.unwatch(&parent) {
                            debug!(dir = %parent.display(), error = %e, "Unwatch failed");
                        }
                    }
                }
            }
        }
        debug!(session = %session_id, "Watch removed");
    }

    pub fn watched_count(&self) -> usize {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop the underlying watcher; registered entries survive a restart.
    pub fn stop(&self) {
        let mut guard = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

/// Canonicalize through the parent so a not-yet-created file can still be
/// registered, and notify's event paths match our keys.
fn normalize(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let parent = path
        .parent()
        .ok_or_else(|| TailcastError::Watch(format!("no parent dir: {}", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| TailcastError::Watch(format!("no file name: {}", path.display())))?;
    let parent = parent
        .canonicalize()
        .map_err(|e| TailcastError::Watch(format!("{}: {e}", parent.display())))?;
    Ok(parent.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[tokio::test]
    async fn change_and_delete_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s-1.jsonl");
        std::fs::write(&path, "{}\n").unwrap();

        let (watcher, mut rx) = SessionWatcher::new();
        watcher.add(SessionId::from_str("s-1"), &path).unwrap();
        watcher.start().unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"type\":\"user\"}\n").unwrap();
        file.sync_all().unwrap();
        drop(file);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change notification")
            .unwrap();
        assert_eq!(event, WatchEvent::Changed(SessionId::from_str("s-1")));

        std::fs::remove_file(&path).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("delete notification")
                .unwrap();
            if event == WatchEvent::Deleted(SessionId::from_str("s-1")) {
                break;
            }
        }
    }

    #[test]
    fn bookkeeping_refcounts_directories() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        std::fs::write(&a, "").unwrap();
        std::fs::write(&b, "").unwrap();

        let (watcher, _rx) = SessionWatcher::new();
        watcher.add(SessionId::from_str("a"), &a).unwrap();
        watcher.add(SessionId::from_str("b"), &b).unwrap();
        assert_eq!(watcher.watched_count(), 2);

        watcher.remove(&SessionId::from_str("a"));
        assert_eq!(watcher.watched_count(), 1);
        watcher.remove(&SessionId::from_str("a"));
        assert_eq!(watcher.watched_count(), 1);
        watcher.remove(&SessionId::from_str("b"));
        assert_eq!(watcher.watched_count(), 0);
    }

    #[test]
    fn missing_file_can_be_registered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.jsonl");
        let (watcher, _rx) = SessionWatcher::new();
        watcher.add(SessionId::from_str("later"), &path).unwrap();
        assert_eq!(watcher.watched_count(), 1);
    }
}
