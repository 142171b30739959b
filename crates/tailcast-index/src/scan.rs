use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use tailcast_core::config::IndexConfig;
use tailcast_core::Result;

use crate::store::{IndexedSession, SearchIndex};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Incremental refresh: walk the configured directories, index new or
/// changed `.jsonl` transcripts (by mtime), and drop rows whose files are
/// gone.
pub fn refresh(index: &SearchIndex, config: &IndexConfig) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    for root in &config.paths {
        if !root.exists() {
            debug!(root = %root.display(), "Index path missing, skipping");
            continue;
        }
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().map(|e| e != "jsonl").unwrap_or(true)
            {
                continue;
            }
            let is_subagent = path
                .components()
                .any(|c| c.as_os_str() == "subagents");
            if is_subagent && !config.include_subagents {
                continue;
            }

            stats.scanned += 1;
            let path_str = path.to_string_lossy().to_string();

            let mtime = match file_mtime(path) {
                Some(mtime) => mtime,
                None => continue,
            };
            if index.stored_mtime(&path_str)? == Some(mtime) {
                stats.skipped += 1;
                continue;
            }

            match extract_session(path, is_subagent) {
                Ok(session) => {
                    index.upsert_session(&session)?;
                    index.set_mtime(&path_str, mtime)?;
                    stats.indexed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to index transcript");
                }
            }
        }
    }

    // Drop rows whose transcript files no longer exist.
    for stored in index.all_file_paths()? {
        if !Path::new(&stored).exists() {
            index.remove_by_file_path(&stored)?;
            stats.removed += 1;
        }
    }

    if config.max_sessions_per_project > 0 {
        index.prune_project_overflow(config.max_sessions_per_project)?;
    }

    index.set_metadata("last_refresh", &Utc::now().to_rfc3339())?;
    info!(
        scanned = stats.scanned,
        indexed = stats.indexed,
        skipped = stats.skipped,
        removed = stats.removed,
        "Index refresh complete"
    );
    Ok(stats)
}

fn file_mtime(path: &Path) -> Option<i64> {
    let modified = path.metadata().ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64)
}

/// Parse just enough of a transcript to index it: the summary line, line
/// count, and the summed turn durations.
pub fn extract_session(path: &Path, is_subagent: bool) -> Result<IndexedSession> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut summary = None;
    let mut session_id = None;
    let mut line_count = 0u64;
    let mut duration_ms = 0u64;
    let mut saw_duration = false;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        line_count += 1;
        let Ok(record) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        match record["type"].as_str() {
            Some("summary") => {
                if summary.is_none() {
                    summary = record["summary"].as_str().map(str::to_string);
                }
            }
            Some("system") if record["subtype"].as_str() == Some("turn_duration") => {
                if let Some(ms) = record["durationMs"].as_u64() {
                    duration_ms += ms;
                    saw_duration = true;
                }
            }
            _ => {}
        }
        if session_id.is_none() {
            session_id = record["sessionId"].as_str().map(str::to_string);
        }
    }

    let metadata = path.metadata()?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    let created: DateTime<Utc> = metadata
        .created()
        .map(DateTime::from)
        .unwrap_or(modified);

    let session_id = session_id.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    let (project_encoded, project_display_name, project_path) = project_of(path);
    let has_subagents = path
        .parent()
        .map(|p| p.join("subagents").is_dir())
        .unwrap_or(false);

    Ok(IndexedSession {
        session_id,
        project_encoded,
        project_display_name,
        project_path,
        summary,
        file_path: path.to_string_lossy().to_string(),
        file_created_at: created,
        file_modified_at: modified,
        indexed_at: Utc::now(),
        size_bytes: metadata.len(),
        line_count,
        duration_ms: saw_duration.then_some(duration_ms),
        has_subagents,
        is_subagent,
    })
}

/// Project identity from the transcript's directory. Dash-encoded project
/// directories (`-home-dev-app`) decode lossily back to a path; anything
/// else uses the directory itself.
fn project_of(path: &Path) -> (String, String, String) {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let dir_name = parent
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if dir_name.starts_with('-') {
        let decoded = dir_name.replace('-', "/");
        let display = decoded
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_string();
        (dir_name, display, decoded)
    } else {
        let display = if dir_name.is_empty() {
            "unknown".to_string()
        } else {
            dir_name.clone()
        };
        (dir_name, display, parent.to_string_lossy().to_string())
    }
}
