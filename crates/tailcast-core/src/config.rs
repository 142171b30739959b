use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{Result, TailcastError};
use crate::types::Destination;

/// Top-level tailcast configuration.
///
/// The writer always emits this shape; the reader additionally accepts the
/// legacy list-of-sessions form and migrates it in memory (see
/// `deserialize_sessions`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bots: BotsConfig,
    #[serde(default, deserialize_with = "deserialize_sessions")]
    pub sessions: BTreeMap<String, SessionConfig>,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramBotConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackBotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramBotConfig {
    pub token: String,
    #[serde(default)]
    pub mode: TelegramMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelegramMode {
    #[default]
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackBotConfig {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

/// One watched session: its transcript path and attached destinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub destinations: DestinationsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub telegram: Vec<TelegramDestination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slack: Vec<SlackDestination>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramDestination {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackDestination {
    pub channel: String,
}

impl DestinationsConfig {
    pub fn is_empty(&self) -> bool {
        self.telegram.is_empty() && self.slack.is_empty()
    }

    pub fn to_destinations(&self) -> Vec<Destination> {
        let mut out = Vec::with_capacity(self.telegram.len() + self.slack.len());
        for t in &self.telegram {
            out.push(Destination::Telegram {
                chat_id: t.chat_id,
                thread_id: t.thread_id,
            });
        }
        for s in &self.slack {
            out.push(Destination::Slack {
                channel: s.channel.clone(),
            });
        }
        out
    }

    pub fn insert(&mut self, destination: &Destination) -> bool {
        match destination {
            Destination::Telegram { chat_id, thread_id } => {
                let entry = TelegramDestination {
                    chat_id: *chat_id,
                    thread_id: *thread_id,
                };
                if self.telegram.contains(&entry) {
                    return false;
                }
                self.telegram.push(entry);
                true
            }
            Destination::Slack { channel } => {
                let entry = SlackDestination {
                    channel: channel.clone(),
                };
                if self.slack.contains(&entry) {
                    return false;
                }
                self.slack.push(entry);
                true
            }
        }
    }

    pub fn remove(&mut self, destination: &Destination) -> bool {
        match destination {
            Destination::Telegram { chat_id, thread_id } => {
                let before = self.telegram.len();
                self.telegram
                    .retain(|t| !(t.chat_id == *chat_id && t.thread_id == *thread_id));
                self.telegram.len() != before
            }
            Destination::Slack { channel } => {
                let before = self.slack.len();
                self.slack.retain(|s| s.channel != *channel);
                self.slack.len() != before
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Directories scanned for `.jsonl` session transcripts.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Seconds between incremental refreshes (0 disables the periodic task).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_max_sessions_per_project")]
    pub max_sessions_per_project: usize,
    /// Include transcripts under `subagents/` directories.
    #[serde(default)]
    pub include_subagents: bool,
    /// Persist the index to disk (false keeps it in memory).
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            refresh_interval: default_refresh_interval(),
            max_sessions_per_project: default_max_sessions_per_project(),
            include_subagents: false,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
    #[serde(default = "default_search_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_sort")]
    pub default_sort: String,
    /// Seconds a bot's paging cursor stays valid.
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            max_limit: default_search_max_limit(),
            default_sort: default_sort(),
            state_ttl_seconds: default_state_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory for per-session state files and the search database.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Seconds between WAL checkpoints (0 disables).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default)]
    pub vacuum_on_startup: bool,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            checkpoint_interval: default_checkpoint_interval(),
            vacuum_on_startup: false,
            backup: BackupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Newest N backup generations are kept; older ones are deleted.
    #[serde(default = "default_backup_keep")]
    pub keep_count: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            keep_count: default_backup_keep(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    300
}
fn default_max_sessions_per_project() -> usize {
    500
}
fn default_true() -> bool {
    true
}
fn default_search_limit() -> usize {
    10
}
fn default_search_max_limit() -> usize {
    50
}
fn default_sort() -> String {
    "relevance".to_string()
}
fn default_state_ttl() -> u64 {
    600
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".tailcast/state")
}
fn default_checkpoint_interval() -> u64 {
    300
}
fn default_backup_keep() -> usize {
    3
}

/// Accept the current map form or the legacy list form for `sessions`.
///
/// Legacy entries look like `- {session_id: ..., path: ..., destinations: ...}`;
/// they are folded into the map keyed by their `session_id`.
fn deserialize_sessions<'de, D>(de: D) -> std::result::Result<BTreeMap<String, SessionConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct LegacySession {
        session_id: String,
        path: PathBuf,
        #[serde(default)]
        destinations: DestinationsConfig,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SessionsShape {
        Map(BTreeMap<String, SessionConfig>),
        List(Vec<LegacySession>),
    }

    match SessionsShape::deserialize(de)? {
        SessionsShape::Map(map) => Ok(map),
        SessionsShape::List(list) => {
            let mut map = BTreeMap::new();
            for entry in list {
                map.insert(
                    entry.session_id,
                    SessionConfig {
                        path: entry.path,
                        destinations: entry.destinations,
                    },
                );
            }
            Ok(map)
        }
    }
}

impl AppConfig {
    /// Load a YAML config file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TailcastError::ConfigNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load if present, otherwise defaults with env overrides applied.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Persist in the current format. Writes are atomic (temp + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Environment variables override specific fields.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(paths) = std::env::var("TAILCAST_INDEX_PATHS") {
            self.index.paths = paths
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(interval) = std::env::var("TAILCAST_REFRESH_INTERVAL") {
            match interval.parse() {
                Ok(v) => self.index.refresh_interval = v,
                Err(_) => warn!(value = %interval, "Ignoring invalid TAILCAST_REFRESH_INTERVAL"),
            }
        }
        if let Ok(dir) = std::env::var("TAILCAST_STATE_DIR") {
            self.database.state_dir = PathBuf::from(dir);
        }
        if let Ok(interval) = std::env::var("TAILCAST_CHECKPOINT_INTERVAL") {
            match interval.parse() {
                Ok(v) => self.database.checkpoint_interval = v,
                Err(_) => {
                    warn!(value = %interval, "Ignoring invalid TAILCAST_CHECKPOINT_INTERVAL")
                }
            }
        }
        if let Ok(url) = std::env::var("TAILCAST_WEBHOOK_URL") {
            if let Some(ref mut telegram) = self.bots.telegram {
                telegram.webhook_url = Some(url);
            }
        }
        if self.bots.telegram.is_none() {
            if let Ok(token) = std::env::var("TAILCAST_TELEGRAM_TOKEN") {
                self.bots.telegram = Some(TelegramBotConfig {
                    token,
                    mode: TelegramMode::default(),
                    webhook_url: None,
                });
            }
        }
        if self.bots.slack.is_none() {
            if let Ok(token) = std::env::var("TAILCAST_SLACK_TOKEN") {
                self.bots.slack = Some(SlackBotConfig {
                    token,
                    signing_secret: None,
                });
            }
        }
    }

    /// The search database path under the configured state directory.
    pub fn search_db_path(&self) -> PathBuf {
        self.database.state_dir.join("search.db")
    }
}
