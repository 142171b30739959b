use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use tracing::{debug, error, info, warn};

use tailcast_core::{Result, TailcastError};

const BUSY_TIMEOUT_MS: u64 = 5000;
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 50;

/// One indexed session transcript. Rows are immutable except via full
/// replace.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedSession {
    pub session_id: String,
    pub project_encoded: String,
    pub project_display_name: String,
    pub project_path: String,
    pub summary: Option<String>,
    pub file_path: String,
    pub file_created_at: DateTime<Utc>,
    pub file_modified_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub line_count: u64,
    pub duration_ms: Option<u64>,
    pub has_subagents: bool,
    pub is_subagent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchSort {
    #[default]
    Relevance,
    Modified,
    Created,
}

impl SearchSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relevance" => Some(Self::Relevance),
            "modified" => Some(Self::Modified),
            "created" => Some(Self::Created),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query: String,
    pub project: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub sort: SearchSort,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct ScoredSession {
    pub session: IndexedSession,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ProjectStat {
    pub project_display_name: String,
    pub project_path: String,
    pub session_count: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// SQLite-backed search index over discovered session transcripts.
///
/// WAL journaling with a busy timeout; writers go through a bounded retry.
/// FTS5 is probed at initialization and search degrades to substring
/// matching when it is unavailable.
pub struct SearchIndex {
    conn: Mutex<Connection>,
    fts_enabled: bool,
}

impl SearchIndex {
    /// Open or create the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TailcastError::Database(format!("create db directory: {e}")))?;
        }
        let conn =
            Connection::open(path).map_err(|e| TailcastError::Database(e.to_string()))?;
        Self::init(conn)
    }

    /// In-memory index for tests.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TailcastError::Database(e.to_string()))?;
        Self::init(conn)
    }

    /// Open with corruption recovery: an existing database that fails the
    /// integrity check is renamed with a `.corrupt` suffix (WAL/SHM
    /// removed) and a fresh one is initialized in its place.
    pub fn safe_initialize(path: &Path) -> Result<Self> {
        if path.exists() {
            let healthy = match Self::open(path) {
                Ok(index) => match index.verify_integrity() {
                    Ok(ok) => ok,
                    Err(_) => false,
                },
                Err(_) => false,
            };
            if !healthy {
                error!(path = %path.display(), "Search database corrupt, rebuilding");
                let corrupt = path.with_extension("db.corrupt");
                std::fs::rename(path, &corrupt)
                    .map_err(|e| TailcastError::Database(format!("quarantine db: {e}")))?;
                for suffix in ["-wal", "-shm"] {
                    let side = PathBuf::from(format!("{}{}", path.display(), suffix));
                    if side.exists() {
                        let _ = std::fs::remove_file(side);
                    }
                }
            }
        }
        Self::open(path)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA auto_vacuum=INCREMENTAL;",
        )
        .map_err(|e| TailcastError::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(|e| TailcastError::Database(e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                project_encoded TEXT NOT NULL,
                project_display_name TEXT NOT NULL,
                project_path TEXT NOT NULL,
                summary TEXT,
                file_path TEXT NOT NULL UNIQUE,
                file_created_at TEXT NOT NULL,
                file_modified_at TEXT NOT NULL,
                indexed_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                line_count INTEGER NOT NULL,
                duration_ms INTEGER,
                has_subagents INTEGER NOT NULL DEFAULT 0,
                is_subagent INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_project
                ON sessions(project_display_name);
            CREATE INDEX IF NOT EXISTS idx_sessions_modified
                ON sessions(file_modified_at DESC);

            CREATE TABLE IF NOT EXISTS file_mtimes (
                file_path TEXT PRIMARY KEY,
                mtime INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS index_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| TailcastError::Database(e.to_string()))?;

        // FTS5 availability is probed, not assumed; without it search falls
        // back to substring queries.
        let fts_enabled = conn
            .execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS sessions_fts USING fts5(
                    summary,
                    project_display_name,
                    content='sessions',
                    content_rowid='rowid',
                    tokenize='unicode61'
                );

                CREATE TRIGGER IF NOT EXISTS sessions_ai AFTER INSERT ON sessions BEGIN
                    INSERT INTO sessions_fts(rowid, summary, project_display_name)
                    VALUES (new.rowid, new.summary, new.project_display_name);
                END;

                CREATE TRIGGER IF NOT EXISTS sessions_ad AFTER DELETE ON sessions BEGIN
                    INSERT INTO sessions_fts(sessions_fts, rowid, summary, project_display_name)
                    VALUES ('delete', old.rowid, old.summary, old.project_display_name);
                END;

                CREATE TRIGGER IF NOT EXISTS sessions_au AFTER UPDATE ON sessions BEGIN
                    INSERT INTO sessions_fts(sessions_fts, rowid, summary, project_display_name)
                    VALUES ('delete', old.rowid, old.summary, old.project_display_name);
                    INSERT INTO sessions_fts(rowid, summary, project_display_name)
                    VALUES (new.rowid, new.summary, new.project_display_name);
                END;",
            )
            .is_ok();

        let index = Self {
            conn: Mutex::new(conn),
            fts_enabled,
        };

        if !fts_enabled {
            warn!("FTS5 unavailable, search falls back to substring matching");
            index.set_metadata("fts_warning", "fts5 unavailable; substring fallback active")?;
        }

        debug!(fts_enabled, "Search index opened");
        Ok(index)
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    /// Run a write closure with bounded retries on busy/locked errors,
    /// backing off exponentially between attempts.
    pub fn execute_with_retry<T>(
        &self,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut attempt = 0u32;
        loop {
            match f(&conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    warn!(attempt, delay_ms = delay, "Database busy, retrying");
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(e) if is_busy(&e) => {
                    return Err(TailcastError::DatabaseBusy {
                        attempts: RETRY_ATTEMPTS,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(TailcastError::Database(e.to_string())),
            }
        }
    }

    /// Insert or fully replace one session row.
    pub fn upsert_session(&self, session: &IndexedSession) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (
                    session_id, project_encoded, project_display_name, project_path,
                    summary, file_path, file_created_at, file_modified_at, indexed_at,
                    size_bytes, line_count, duration_ms, has_subagents, is_subagent
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    session.session_id,
                    session.project_encoded,
                    session.project_display_name,
                    session.project_path,
                    session.summary,
                    session.file_path,
                    session.file_created_at.to_rfc3339(),
                    session.file_modified_at.to_rfc3339(),
                    session.indexed_at.to_rfc3339(),
                    session.size_bytes as i64,
                    session.line_count as i64,
                    session.duration_ms.map(|d| d as i64),
                    session.has_subagents as i64,
                    session.is_subagent as i64,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn remove_by_file_path(&self, file_path: &str) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute("DELETE FROM sessions WHERE file_path = ?1", params![file_path])?;
            conn.execute(
                "DELETE FROM file_mtimes WHERE file_path = ?1",
                params![file_path],
            )
            .map(|_| ())
        })
    }

    pub fn all_file_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT file_path FROM sessions")
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| TailcastError::Database(e.to_string()))
    }

    pub fn stored_mtime(&self, file_path: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT mtime FROM file_mtimes WHERE file_path = ?1",
            params![file_path],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(TailcastError::Database(other.to_string())),
        })
    }

    pub fn set_mtime(&self, file_path: &str, mtime: i64) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO file_mtimes (file_path, mtime) VALUES (?1, ?2)",
                params![file_path, mtime],
            )
            .map(|_| ())
        })
    }

    pub fn metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT value FROM index_metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(TailcastError::Database(other.to_string())),
        })
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO index_metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    pub fn session_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(|e| TailcastError::Database(e.to_string()))
    }

    /// Aggregate per-project counts for the projects listing.
    pub fn project_stats(&self) -> Result<Vec<ProjectStat>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT project_display_name, project_path, COUNT(*), MAX(file_modified_at)
                 FROM sessions
                 GROUP BY project_display_name, project_path
                 ORDER BY MAX(file_modified_at) DESC",
            )
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProjectStat {
                    project_display_name: row.get(0)?,
                    project_path: row.get(1)?,
                    session_count: row.get::<_, i64>(2)? as u64,
                    last_modified: parse_time(row.get::<_, String>(3)?),
                })
            })
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| TailcastError::Database(e.to_string()))
    }

    /// Keep only the newest `max` sessions per project.
    pub fn prune_project_overflow(&self, max: usize) -> Result<usize> {
        if max == 0 {
            return Ok(0);
        }
        self.execute_with_retry(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE session_id IN (
                     SELECT session_id FROM (
                         SELECT session_id,
                                ROW_NUMBER() OVER (
                                    PARTITION BY project_encoded
                                    ORDER BY file_modified_at DESC
                                ) AS rn
                         FROM sessions
                     ) WHERE rn > ?1
                 )",
                params![max as i64],
            )
        })
    }

    /// Search with the deterministic ranking formula. Candidate retrieval
    /// uses FTS5 when available and substring matching otherwise; scoring
    /// is always done here so both paths rank identically.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredSession>> {
        let phrase = query.query.trim().to_lowercase();
        let terms = query_terms(&phrase);
        let recent_cap = if query.limit == 0 {
            usize::MAX
        } else {
            query.offset.saturating_add(query.limit)
        };
        let candidates = self.candidates(&terms, recent_cap)?;
        let now = Utc::now();

        let mut scored: Vec<ScoredSession> = candidates
            .into_iter()
            .filter(|s| {
                if let Some(project) = &query.project {
                    let p = project.to_lowercase();
                    if !s.project_display_name.to_lowercase().contains(&p)
                        && !s.project_encoded.to_lowercase().contains(&p)
                    {
                        return false;
                    }
                }
                if let Some(since) = query.since {
                    if s.file_modified_at < since {
                        return false;
                    }
                }
                if let Some(until) = query.until {
                    if s.file_modified_at > until {
                        return false;
                    }
                }
                true
            })
            .map(|session| {
                let score = score_session(
                    session.summary.as_deref(),
                    &session.project_display_name,
                    &terms,
                    &phrase,
                    session.file_modified_at,
                    now,
                );
                ScoredSession { session, score }
            })
            .collect();

        match query.sort {
            SearchSort::Relevance => scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.session.file_modified_at.cmp(&a.session.file_modified_at))
            }),
            SearchSort::Modified => {
                scored.sort_by(|a, b| b.session.file_modified_at.cmp(&a.session.file_modified_at))
            }
            SearchSort::Created => {
                scored.sort_by(|a, b| b.session.file_created_at.cmp(&a.session.file_created_at))
            }
        }

        let limited = scored
            .into_iter()
            .skip(query.offset)
            .take(if query.limit == 0 { usize::MAX } else { query.limit })
            .collect();
        Ok(limited)
    }

    /// Candidate rows for scoring: term matches (FTS5 or substring
    /// fallback) unioned with the most recent sessions, since recency alone
    /// earns score. `recent_cap` bounds the recency slice.
    fn candidates(&self, terms: &[String], recent_cap: usize) -> Result<Vec<IndexedSession>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let recent_limit: i64 = if terms.is_empty() || recent_cap == usize::MAX {
            -1
        } else {
            recent_cap as i64
        };
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             ORDER BY file_modified_at DESC LIMIT ?1"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![recent_limit], row_to_session)
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        let mut candidates = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| TailcastError::Database(e.to_string()))?;

        if terms.is_empty() {
            return Ok(candidates);
        }

        let matched = if self.fts_enabled {
            let match_expr = terms
                .iter()
                .map(|t| format!("\"{}\"", t.replace('"', "")))
                .collect::<Vec<_>>()
                .join(" OR ");
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE rowid IN (SELECT rowid FROM sessions_fts WHERE sessions_fts MATCH ?1)"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| TailcastError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![match_expr], row_to_session)
                .map_err(|e| TailcastError::Database(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| TailcastError::Database(e.to_string()))?
        } else {
            // Substring fallback: any term in summary or project name.
            let mut clauses = Vec::new();
            let mut bound: Vec<String> = Vec::new();
            for term in terms {
                let i = bound.len() + 1;
                clauses.push(format!(
                    "LOWER(IFNULL(summary, '')) LIKE ?{i} OR LOWER(project_display_name) LIKE ?{}",
                    i + 1
                ));
                bound.push(format!("%{term}%"));
                bound.push(format!("%{term}%"));
            }
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE {}",
                clauses.join(" OR ")
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| TailcastError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(bound.iter()), row_to_session)
                .map_err(|e| TailcastError::Database(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| TailcastError::Database(e.to_string()))?
        };

        let seen: std::collections::HashSet<String> =
            candidates.iter().map(|s| s.session_id.clone()).collect();
        for session in matched {
            if !seen.contains(&session.session_id) {
                candidates.push(session);
            }
        }
        Ok(candidates)
    }

    /// Online backup to `destination`.
    pub fn backup(&self, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TailcastError::Database(format!("create backup dir: {e}")))?;
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut dst = Connection::open(destination)
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dst)
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        backup
            .run_to_completion(64, Duration::from_millis(10), None)
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        info!(destination = %destination.display(), "Search index backed up");
        Ok(())
    }

    /// Reclaim free pages.
    pub fn vacuum(&self) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute_batch("PRAGMA incremental_vacuum;")
        })
    }

    /// Truncate the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        })
    }

    /// `PRAGMA integrity_check` reduced to a boolean.
    pub fn verify_integrity(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(|e| TailcastError::Database(e.to_string()))?;
        Ok(result == "ok")
    }
}

const SESSION_COLUMNS: &str = "session_id, project_encoded, project_display_name, project_path, \
     summary, file_path, file_created_at, file_modified_at, indexed_at, \
     size_bytes, line_count, duration_ms, has_subagents, is_subagent";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedSession> {
    Ok(IndexedSession {
        session_id: row.get(0)?,
        project_encoded: row.get(1)?,
        project_display_name: row.get(2)?,
        project_path: row.get(3)?,
        summary: row.get(4)?,
        file_path: row.get(5)?,
        file_created_at: parse_time(row.get::<_, String>(6)?).unwrap_or_else(Utc::now),
        file_modified_at: parse_time(row.get::<_, String>(7)?).unwrap_or_else(Utc::now),
        indexed_at: parse_time(row.get::<_, String>(8)?).unwrap_or_else(Utc::now),
        size_bytes: row.get::<_, i64>(9)? as u64,
        line_count: row.get::<_, i64>(10)? as u64,
        duration_ms: row.get::<_, Option<i64>>(11)?.map(|d| d as u64),
        has_subagents: row.get::<_, i64>(12)? != 0,
        is_subagent: row.get::<_, i64>(13)? != 0,
    })
}

fn parse_time(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}

/// Query terms: lowercase whitespace split, terms shorter than two
/// characters dropped.
pub fn query_terms(phrase: &str) -> Vec<String> {
    phrase
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// The deterministic ranking formula. All matches are case-insensitive.
pub fn score_session(
    summary: Option<&str>,
    project_display_name: &str,
    terms: &[String],
    phrase: &str,
    modified_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let summary = summary.unwrap_or("").to_lowercase();
    let project = project_display_name.to_lowercase();

    let summary_hits = terms.iter().filter(|t| summary.contains(t.as_str())).count() as f64;
    let phrase_hit = if !phrase.is_empty() && summary.contains(phrase) {
        1.0
    } else {
        0.0
    };
    let project_hits = terms.iter().filter(|t| project.contains(t.as_str())).count() as f64;

    let days_old = (now - modified_at).num_seconds() as f64 / 86_400.0;
    let recency = (1.0 - days_old / 30.0).max(0.0);

    2.0 * summary_hits + phrase_hit + project_hits + recency
}

/// Delete older backup generations, keeping the newest `keep`.
pub fn rotate_backups(dir: &Path, prefix: &str, keep: usize) -> Result<usize> {
    let mut backups: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(TailcastError::Database(format!("read backup dir: {e}"))),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(prefix) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                backups.push((modified, entry.path()));
            }
        }
    }
    backups.sort_by(|a, b| b.0.cmp(&a.0));
    let mut removed = 0;
    for (_, path) in backups.into_iter().skip(keep) {
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
