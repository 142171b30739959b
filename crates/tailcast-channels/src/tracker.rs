use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tailcast_core::types::{
    BlockContent, Destination, QuestionContent, SessionEvent, SessionId, ToolCallContent,
};

use crate::format;

/// Finalized turns kept for routing late tool results.
const TURN_HISTORY: usize = 20;
/// Rendered messages kept per session for attach-with-replay.
const REPLAY_HISTORY: usize = 50;

/// Identifies a logical message the tracker may update later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Turn(u64),
    Question(String),
    /// User/system/compaction notices: sent once, never edited.
    Standalone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    New,
    Update,
}

/// Snapshot of one turn: the assistant text, its tool calls in order, and
/// the closing duration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnSnapshot {
    pub assistant_text: Option<String>,
    pub tools: Vec<ToolCallContent>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Turn(TurnSnapshot),
    User(String),
    System(String),
    Question(QuestionContent),
    Compaction,
}

/// What the pipeline should do with a destination's messaging surface.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageAction {
    pub send_kind: SendKind,
    pub key: MessageKey,
    pub payload: MessagePayload,
    pub remove_keyboard: bool,
}

#[derive(Debug, Default)]
struct Turn {
    assistant_text: Option<String>,
    tool_order: Vec<String>,
    tools: HashMap<String, ToolCallContent>,
    duration_ms: Option<u64>,
    message_ids: HashMap<Destination, String>,
}

impl Turn {
    fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot {
            assistant_text: self.assistant_text.clone(),
            tools: self
                .tool_order
                .iter()
                .filter_map(|id| self.tools.get(id).cloned())
                .collect(),
            duration_ms: self.duration_ms,
        }
    }
}

#[derive(Debug)]
struct QuestionState {
    content: QuestionContent,
    message_ids: HashMap<Destination, String>,
}

#[derive(Debug, Default)]
struct SessionTracker {
    next_turn_id: u64,
    current_turn: Option<u64>,
    turns: HashMap<u64, Turn>,
    turn_order: VecDeque<u64>,
    /// tool_use_id → owning turn, for routing `UpdateBlock`s.
    tool_turns: HashMap<String, u64>,
    questions: HashMap<String, QuestionState>,
    replay: VecDeque<String>,
}

impl SessionTracker {
    fn open_turn(&mut self) -> u64 {
        self.next_turn_id += 1;
        let id = self.next_turn_id;
        self.turns.insert(id, Turn::default());
        self.turn_order.push_back(id);
        if self.turn_order.len() > TURN_HISTORY {
            if let Some(old) = self.turn_order.pop_front() {
                if let Some(turn) = self.turns.remove(&old) {
                    for tool_id in turn.tool_order {
                        self.tool_turns.remove(&tool_id);
                    }
                }
            }
        }
        self.current_turn = Some(id);
        id
    }

    fn push_replay(&mut self, text: String) {
        self.replay.push_back(text);
        if self.replay.len() > REPLAY_HISTORY {
            self.replay.pop_front();
        }
    }
}

/// Groups events into turn-based messages per session and decides whether a
/// destination needs a new message or an edit of an existing one.
#[derive(Debug, Default)]
pub struct MessageStateTracker {
    sessions: Mutex<HashMap<SessionId, SessionTracker>>,
}

impl MessageStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one pipeline event. Returns the messaging action, if any
    /// (thinking indicators are SSE-only).
    pub fn handle_event(
        &self,
        session_id: &SessionId,
        event: &SessionEvent,
    ) -> Option<MessageAction> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let tracker = sessions.entry(session_id.clone()).or_default();

        let action = match event {
            SessionEvent::AddBlock(block) => match &block.content {
                BlockContent::User { text } => {
                    tracker.current_turn = None;
                    Some(MessageAction {
                        send_kind: SendKind::New,
                        key: MessageKey::Standalone,
                        payload: MessagePayload::User(text.clone()),
                        remove_keyboard: false,
                    })
                }
                BlockContent::Assistant { text, .. } => {
                    let (send_kind, id) = match tracker.current_turn {
                        Some(id) => (SendKind::Update, id),
                        None => (SendKind::New, tracker.open_turn()),
                    };
                    let turn = tracker.turns.get_mut(&id)?;
                    turn.assistant_text = Some(match turn.assistant_text.take() {
                        Some(existing) => format!("{existing}\n\n{text}"),
                        None => text.clone(),
                    });
                    Some(MessageAction {
                        send_kind,
                        key: MessageKey::Turn(id),
                        payload: MessagePayload::Turn(turn.snapshot()),
                        remove_keyboard: false,
                    })
                }
                BlockContent::ToolCall(tc) => {
                    let (send_kind, id) = match tracker.current_turn {
                        Some(id) => (SendKind::Update, id),
                        None => (SendKind::New, tracker.open_turn()),
                    };
                    tracker.tool_turns.insert(tc.tool_use_id.clone(), id);
                    let turn = tracker.turns.get_mut(&id)?;
                    turn.tool_order.push(tc.tool_use_id.clone());
                    turn.tools.insert(tc.tool_use_id.clone(), tc.clone());
                    Some(MessageAction {
                        send_kind,
                        key: MessageKey::Turn(id),
                        payload: MessagePayload::Turn(turn.snapshot()),
                        remove_keyboard: false,
                    })
                }
                BlockContent::Duration { duration_ms } => {
                    let id = tracker.current_turn.take()?;
                    let turn = tracker.turns.get_mut(&id)?;
                    turn.duration_ms = Some(*duration_ms);
                    Some(MessageAction {
                        send_kind: SendKind::Update,
                        key: MessageKey::Turn(id),
                        payload: MessagePayload::Turn(turn.snapshot()),
                        remove_keyboard: false,
                    })
                }
                BlockContent::System { text } => Some(MessageAction {
                    send_kind: SendKind::New,
                    key: MessageKey::Standalone,
                    payload: MessagePayload::System(text.clone()),
                    remove_keyboard: false,
                }),
                BlockContent::Question(q) => {
                    tracker.questions.insert(
                        q.tool_use_id.clone(),
                        QuestionState {
                            content: q.clone(),
                            message_ids: HashMap::new(),
                        },
                    );
                    Some(MessageAction {
                        send_kind: SendKind::New,
                        key: MessageKey::Question(q.tool_use_id.clone()),
                        payload: MessagePayload::Question(q.clone()),
                        remove_keyboard: false,
                    })
                }
                BlockContent::Thinking { .. } => None,
            },
            SessionEvent::UpdateBlock { content, .. } => match content {
                BlockContent::ToolCall(tc) => {
                    let id = *tracker.tool_turns.get(&tc.tool_use_id)?;
                    let turn = tracker.turns.get_mut(&id)?;
                    turn.tools.insert(tc.tool_use_id.clone(), tc.clone());
                    Some(MessageAction {
                        send_kind: SendKind::Update,
                        key: MessageKey::Turn(id),
                        payload: MessagePayload::Turn(turn.snapshot()),
                        remove_keyboard: false,
                    })
                }
                BlockContent::Question(q) => {
                    let state = tracker.questions.get_mut(&q.tool_use_id)?;
                    state.content = q.clone();
                    let send_kind = if state.message_ids.is_empty() {
                        SendKind::New
                    } else {
                        SendKind::Update
                    };
                    Some(MessageAction {
                        send_kind,
                        key: MessageKey::Question(q.tool_use_id.clone()),
                        payload: MessagePayload::Question(q.clone()),
                        remove_keyboard: send_kind == SendKind::Update,
                    })
                }
                _ => None,
            },
            SessionEvent::ClearAll => {
                let replay = std::mem::take(&mut tracker.replay);
                *tracker = SessionTracker {
                    replay,
                    ..Default::default()
                };
                Some(MessageAction {
                    send_kind: SendKind::New,
                    key: MessageKey::Standalone,
                    payload: MessagePayload::Compaction,
                    remove_keyboard: false,
                })
            }
        };

        if let Some(action) = &action {
            if action.send_kind == SendKind::New {
                tracker.push_replay(format::payload_text(&action.payload));
            }
        }

        action
    }

    /// Record the platform id a publisher returned, enabling future edits.
    pub fn record_message_id(
        &self,
        session_id: &SessionId,
        key: &MessageKey,
        destination: &Destination,
        platform_id: String,
    ) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tracker) = sessions.get_mut(session_id) else {
            return;
        };
        match key {
            MessageKey::Turn(id) => {
                if let Some(turn) = tracker.turns.get_mut(id) {
                    turn.message_ids.insert(destination.clone(), platform_id);
                }
            }
            MessageKey::Question(tool_use_id) => {
                if let Some(state) = tracker.questions.get_mut(tool_use_id) {
                    state.message_ids.insert(destination.clone(), platform_id);
                }
            }
            MessageKey::Standalone => {}
        }
    }

    /// The latest content of a tracked question, for re-rendering on
    /// callback acknowledgements.
    pub fn question(
        &self,
        session_id: &SessionId,
        tool_use_id: &str,
    ) -> Option<QuestionContent> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)?
            .questions
            .get(tool_use_id)
            .map(|state| state.content.clone())
    }

    /// The platform message id previously recorded for this key at this
    /// destination, if any.
    pub fn message_id_for(
        &self,
        session_id: &SessionId,
        key: &MessageKey,
        destination: &Destination,
    ) -> Option<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let tracker = sessions.get(session_id)?;
        match key {
            MessageKey::Turn(id) => tracker
                .turns
                .get(id)
                .and_then(|t| t.message_ids.get(destination).cloned()),
            MessageKey::Question(tool_use_id) => tracker
                .questions
                .get(tool_use_id)
                .and_then(|q| q.message_ids.get(destination).cloned()),
            MessageKey::Standalone => None,
        }
    }

    /// Forget a stale id (the platform reported "message not found").
    pub fn forget_message_id(
        &self,
        session_id: &SessionId,
        key: &MessageKey,
        destination: &Destination,
    ) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tracker) = sessions.get_mut(session_id) else {
            return;
        };
        match key {
            MessageKey::Turn(id) => {
                if let Some(turn) = tracker.turns.get_mut(id) {
                    turn.message_ids.remove(destination);
                }
            }
            MessageKey::Question(tool_use_id) => {
                if let Some(state) = tracker.questions.get_mut(tool_use_id) {
                    state.message_ids.remove(destination);
                }
            }
            MessageKey::Standalone => {}
        }
    }

    /// The last `n` rendered messages this session produced, oldest first.
    pub fn replay_messages(&self, session_id: &SessionId, n: usize) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tracker) = sessions.get(session_id) else {
            return Vec::new();
        };
        let skip = tracker.replay.len().saturating_sub(n);
        tracker.replay.iter().skip(skip).cloned().collect()
    }

    /// Batched catch-up body: the last `n` messages joined for one send.
    pub fn render_replay(&self, session_id: &SessionId, n: usize) -> String {
        self.replay_messages(session_id, n).join("\n\n")
    }

    /// Drop all state for a session (unwatch).
    pub fn remove_session(&self, session_id: &SessionId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailcast_core::types::{Block, QuestionItem, QuestionOption};

    fn session() -> SessionId {
        SessionId::from_str("s-1")
    }

    fn user(text: &str) -> SessionEvent {
        SessionEvent::AddBlock(Block::new(BlockContent::User { text: text.into() }))
    }

    fn assistant(text: &str) -> SessionEvent {
        SessionEvent::AddBlock(Block::new(BlockContent::Assistant {
            text: text.into(),
            request_id: None,
        }))
    }

    fn tool(id: &str) -> ToolCallContent {
        ToolCallContent {
            tool_name: "Bash".into(),
            tool_use_id: id.into(),
            label: "ls".into(),
            result: None,
            is_error: false,
            progress_text: None,
            request_id: None,
            result_is_final: false,
        }
    }

    fn dest() -> Destination {
        Destination::Telegram {
            chat_id: 42,
            thread_id: None,
        }
    }

    #[test]
    fn user_message_is_standalone_new() {
        let tracker = MessageStateTracker::new();
        let action = tracker.handle_event(&session(), &user("hello")).unwrap();
        assert_eq!(action.send_kind, SendKind::New);
        assert_eq!(action.key, MessageKey::Standalone);
        assert_eq!(action.payload, MessagePayload::User("hello".into()));
    }

    #[test]
    fn assistant_starts_then_continues_turn() {
        let tracker = MessageStateTracker::new();
        let first = tracker.handle_event(&session(), &assistant("part one")).unwrap();
        assert_eq!(first.send_kind, SendKind::New);
        let key = first.key.clone();

        let second = tracker.handle_event(&session(), &assistant("part two")).unwrap();
        assert_eq!(second.send_kind, SendKind::Update);
        assert_eq!(second.key, key);
        match second.payload {
            MessagePayload::Turn(turn) => {
                assert_eq!(turn.assistant_text.as_deref(), Some("part one\n\npart two"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn user_input_finalizes_turn() {
        let tracker = MessageStateTracker::new();
        let first = tracker.handle_event(&session(), &assistant("turn one")).unwrap();
        tracker.handle_event(&session(), &user("next")).unwrap();
        let second = tracker.handle_event(&session(), &assistant("turn two")).unwrap();
        assert_eq!(second.send_kind, SendKind::New);
        assert_ne!(first.key, second.key);
    }

    #[test]
    fn tool_updates_route_to_owning_turn() {
        let tracker = MessageStateTracker::new();
        tracker.handle_event(&session(), &assistant("working")).unwrap();
        let add = tracker
            .handle_event(
                &session(),
                &SessionEvent::AddBlock(Block::new(BlockContent::ToolCall(tool("T")))),
            )
            .unwrap();
        assert_eq!(add.send_kind, SendKind::Update);

        let mut done = tool("T");
        done.result = Some("ok".into());
        done.result_is_final = true;
        let update = tracker
            .handle_event(
                &session(),
                &SessionEvent::UpdateBlock {
                    block_id: tailcast_core::types::BlockId::new(),
                    content: BlockContent::ToolCall(done),
                },
            )
            .unwrap();
        assert_eq!(update.send_kind, SendKind::Update);
        assert_eq!(update.key, add.key);
        match update.payload {
            MessagePayload::Turn(turn) => {
                assert_eq!(turn.tools[0].result.as_deref(), Some("ok"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn duration_closes_the_turn() {
        let tracker = MessageStateTracker::new();
        tracker.handle_event(&session(), &assistant("working")).unwrap();
        let action = tracker
            .handle_event(
                &session(),
                &SessionEvent::AddBlock(Block::new(BlockContent::Duration { duration_ms: 900 })),
            )
            .unwrap();
        assert_eq!(action.send_kind, SendKind::Update);

        // Next assistant text is a fresh turn.
        let next = tracker.handle_event(&session(), &assistant("again")).unwrap();
        assert_eq!(next.send_kind, SendKind::New);
    }

    #[test]
    fn thinking_is_ignored() {
        let tracker = MessageStateTracker::new();
        let action = tracker.handle_event(
            &session(),
            &SessionEvent::AddBlock(Block::new(BlockContent::Thinking { request_id: None })),
        );
        assert!(action.is_none());
    }

    #[test]
    fn question_lifecycle_with_keyboard_removal() {
        let tracker = MessageStateTracker::new();
        let q = QuestionContent {
            tool_use_id: "Q".into(),
            questions: vec![QuestionItem {
                header: "Pick".into(),
                question: "Which?".into(),
                options: vec![QuestionOption {
                    label: "a".into(),
                    description: String::new(),
                }],
                multi_select: false,
            }],
            answers: None,
        };
        let add = tracker
            .handle_event(
                &session(),
                &SessionEvent::AddBlock(Block::new(BlockContent::Question(q.clone()))),
            )
            .unwrap();
        assert_eq!(add.send_kind, SendKind::New);
        assert_eq!(add.key, MessageKey::Question("Q".into()));

        tracker.record_message_id(&session(), &add.key, &dest(), "m_9".into());
        assert_eq!(
            tracker.message_id_for(&session(), &add.key, &dest()),
            Some("m_9".into())
        );

        let mut answered = q;
        answered.answers = Some(std::collections::BTreeMap::from([(
            "Pick".to_string(),
            vec!["a".to_string()],
        )]));
        let update = tracker
            .handle_event(
                &session(),
                &SessionEvent::UpdateBlock {
                    block_id: tailcast_core::types::BlockId::new(),
                    content: BlockContent::Question(answered),
                },
            )
            .unwrap();
        assert_eq!(update.send_kind, SendKind::Update);
        assert!(update.remove_keyboard);
    }

    #[test]
    fn answered_question_without_sent_message_is_new() {
        let tracker = MessageStateTracker::new();
        let q = QuestionContent {
            tool_use_id: "Q".into(),
            questions: Vec::new(),
            answers: None,
        };
        tracker
            .handle_event(
                &session(),
                &SessionEvent::AddBlock(Block::new(BlockContent::Question(q.clone()))),
            )
            .unwrap();
        // No record_message_id: nothing was ever delivered.
        let update = tracker
            .handle_event(
                &session(),
                &SessionEvent::UpdateBlock {
                    block_id: tailcast_core::types::BlockId::new(),
                    content: BlockContent::Question(q),
                },
            )
            .unwrap();
        assert_eq!(update.send_kind, SendKind::New);
        assert!(!update.remove_keyboard);
    }

    #[test]
    fn clear_all_resets_and_notifies() {
        let tracker = MessageStateTracker::new();
        tracker.handle_event(&session(), &assistant("before")).unwrap();
        let action = tracker.handle_event(&session(), &SessionEvent::ClearAll).unwrap();
        assert_eq!(action.payload, MessagePayload::Compaction);

        let after = tracker.handle_event(&session(), &assistant("after")).unwrap();
        assert_eq!(after.send_kind, SendKind::New);
    }

    #[test]
    fn forgotten_ids_are_gone() {
        let tracker = MessageStateTracker::new();
        let action = tracker.handle_event(&session(), &assistant("x")).unwrap();
        tracker.record_message_id(&session(), &action.key, &dest(), "m_1".into());
        tracker.forget_message_id(&session(), &action.key, &dest());
        assert!(tracker
            .message_id_for(&session(), &action.key, &dest())
            .is_none());
    }

    #[test]
    fn replay_returns_recent_messages() {
        let tracker = MessageStateTracker::new();
        tracker.handle_event(&session(), &user("one")).unwrap();
        tracker.handle_event(&session(), &user("two")).unwrap();
        tracker.handle_event(&session(), &user("three")).unwrap();

        let replay = tracker.render_replay(&session(), 2);
        assert_eq!(replay, "❯ two\n\n❯ three");
        assert_eq!(tracker.render_replay(&session(), 0), "");
    }
}
