use thiserror::Error;

#[derive(Debug, Error)]
pub enum TailcastError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Session pipeline errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session file not found: {0}")]
    SessionFileNotFound(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Watcher error: {0}")]
    Watch(String),

    // Destination errors
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Destination not attached: {0}")]
    DestinationNotAttached(String),

    // Publisher errors
    #[error("Publisher error: {platform}: {message}")]
    Publish { platform: String, message: String },

    #[error("Bot not configured: {0}")]
    BotNotConfigured(String),

    #[error("Bot credentials rejected: {platform}: {message}")]
    BadCredentials { platform: String, message: String },

    // Search index errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database busy after {attempts} attempts: {message}")]
    DatabaseBusy { attempts: u32, message: String },

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, TailcastError>;
