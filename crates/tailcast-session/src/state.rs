use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tailcast_core::types::SessionId;
use tailcast_core::{Result, TailcastError};

use crate::processor::ProcessingContext;

/// Persisted per-session resume point, rewritten after every successful
/// batch and deleted on unwatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Byte offset of the next unread line.
    pub file_position: u64,
    /// Lines consumed so far (diagnostic only).
    pub line_number: u64,
    pub processing_context: ProcessingContext,
    pub last_modified: DateTime<Utc>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            file_position: 0,
            line_number: 0,
            processing_context: ProcessingContext::default(),
            last_modified: Utc::now(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace filesystem-unsafe characters, collapse runs of underscores, and
/// strip leading dots so a session id is always a safe file stem.
pub fn sanitize_session_id(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    let mut last_underscore = false;
    for c in session_id.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// JSON-file-per-session state store with atomic writes.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_session_id(session_id.as_str())))
    }

    /// Load a session's state. Missing or corrupt files yield `None`; the
    /// caller resumes from a fresh context.
    pub fn load(&self, session_id: &SessionId) -> Option<SessionState> {
        let path = self.path_for(session_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    session = %session_id,
                    path = %path.display(),
                    error = %e,
                    "Corrupt state file, starting fresh"
                );
                None
            }
        }
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, session_id: &SessionId, state: &SessionState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| TailcastError::State(format!("create state dir: {e}")))?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, json).map_err(|e| TailcastError::State(format!("write state: {e}")))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| TailcastError::State(format!("rename state: {e}")))?;
        Ok(())
    }

    pub fn delete(&self, session_id: &SessionId) -> Result<()> {
        let path = self.path_for(session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TailcastError::State(format!("delete state: {e}"))),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
