use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TailcastError};

/// Unique session identifier (the transcript file's session id).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque block identity, stable across updates for the block's lifetime.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockId(Uuid);

impl BlockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block type discriminant as it appears on the SSE wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    User,
    Assistant,
    ToolCall,
    Question,
    Thinking,
    Duration,
    System,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolCall => "tool_call",
            Self::Question => "question",
            Self::Thinking => "thinking",
            Self::Duration => "duration",
            Self::System => "system",
        }
    }
}

/// One option a question offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// A single question inside an `AskUserQuestion` tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub header: String,
    pub question: String,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Content of a `Question` block. `answers` maps a question header to the
/// selected label(s); `None` while the question is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionContent {
    pub tool_use_id: String,
    pub questions: Vec<QuestionItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers: Option<BTreeMap<String, Vec<String>>>,
}

/// Content of a `ToolCall` block. `result` is terminal: once
/// `result_is_final` is set, progress updates no longer apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallContent {
    pub tool_name: String,
    pub tool_use_id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub result_is_final: bool,
}

/// Type-tagged content variant of a block. The set is closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BlockContent {
    User {
        text: String,
    },
    Assistant {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    ToolCall(ToolCallContent),
    Thinking {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Duration {
        duration_ms: u64,
    },
    System {
        text: String,
    },
    Question(QuestionContent),
}

impl BlockContent {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::User { .. } => BlockKind::User,
            Self::Assistant { .. } => BlockKind::Assistant,
            Self::ToolCall(_) => BlockKind::ToolCall,
            Self::Thinking { .. } => BlockKind::Thinking,
            Self::Duration { .. } => BlockKind::Duration,
            Self::System { .. } => BlockKind::System,
            Self::Question(_) => BlockKind::Question,
        }
    }

    /// The request-id grouping key, when this content carries one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Assistant { request_id, .. } => request_id.as_deref(),
            Self::ToolCall(tc) => tc.request_id.as_deref(),
            Self::Thinking { request_id } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// An ordered, identity-bearing unit of UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: BlockId,
    pub content: BlockContent,
}

impl Block {
    pub fn new(content: BlockContent) -> Self {
        Self {
            id: BlockId::new(),
            content,
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.content.kind()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.content.request_id()
    }
}

/// The closed event algebra produced by the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AddBlock(Block),
    UpdateBlock {
        block_id: BlockId,
        content: BlockContent,
    },
    ClearAll,
}

impl SessionEvent {
    /// Event-type name as used on the SSE wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::AddBlock(_) => "add_block",
            Self::UpdateBlock { .. } => "update_block",
            Self::ClearAll => "clear_all",
        }
    }

    /// SSE `data:` payload, one JSON object per event.
    pub fn wire_data(&self) -> serde_json::Value {
        match self {
            Self::AddBlock(block) => serde_json::json!({
                "block_id": block.id.to_string(),
                "type": block.kind().as_str(),
                "content": block.content,
                "request_id": block.request_id(),
            }),
            Self::UpdateBlock { block_id, content } => serde_json::json!({
                "block_id": block_id.to_string(),
                "content": content,
            }),
            Self::ClearAll => serde_json::json!({}),
        }
    }
}

/// A messaging target a session fans out to.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    Telegram {
        chat_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<i64>,
    },
    Slack {
        channel: String,
    },
}

impl Destination {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Telegram { .. } => "telegram",
            Self::Slack { .. } => "slack",
        }
    }

    /// Platform-specific identifier: `chat_id[:thread_id]` for Telegram,
    /// channel for Slack.
    pub fn identifier(&self) -> String {
        match self {
            Self::Telegram { chat_id, thread_id } => match thread_id {
                Some(t) => format!("{}:{}", chat_id, t),
                None => chat_id.to_string(),
            },
            Self::Slack { channel } => channel.clone(),
        }
    }

    /// Reject identifiers the platforms reserve. Telegram thread id 1 is
    /// the "General" topic, addressed via a null thread instead.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Telegram {
                thread_id: Some(1), ..
            } => Err(TailcastError::InvalidDestination(
                "telegram thread_id 1 is reserved for the General topic; omit thread_id".into(),
            )),
            Self::Slack { channel } if channel.is_empty() => Err(
                TailcastError::InvalidDestination("slack channel must not be empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.identifier())
    }
}

/// A destination attached to a session, with attach time for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedDestination {
    #[serde(flatten)]
    pub destination: Destination,
    pub attached_at: DateTime<Utc>,
}

impl AttachedDestination {
    pub fn now(destination: Destination) -> Self {
        Self {
            destination,
            attached_at: Utc::now(),
        }
    }
}
