use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tailcast_core::types::{
    Block, BlockContent, BlockId, QuestionContent, QuestionItem, QuestionOption, SessionEvent,
    ToolCallContent,
};

use crate::classifier::{classify, content_text, LineType};

const LABEL_MAX: usize = 60;
const PROGRESS_MAX: usize = 76;
const TASK_RESULT_MAX: usize = 80;
const RESULT_MAX_LINES: usize = 5;

/// Per-session processor state. Fully serializable so it can be persisted
/// alongside the file offset and restored after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingContext {
    /// tool_use_id → block id, for tool calls and questions alike.
    #[serde(default)]
    pub blocks: HashMap<String, BlockId>,
    /// tool_use_id → last known tool-call content, to rebuild complete
    /// update payloads when progress or results arrive.
    #[serde(default)]
    pub tool_cache: HashMap<String, ToolCallContent>,
    /// tool_use_id → question content awaiting answers.
    #[serde(default)]
    pub question_cache: HashMap<String, QuestionContent>,
    #[serde(default)]
    pub current_request_id: Option<String>,
}

impl ProcessingContext {
    fn reset(&mut self) {
        self.blocks.clear();
        self.tool_cache.clear();
        self.question_cache.clear();
        self.current_request_id = None;
    }
}

/// Turn one classified line into events. The caller's context is never
/// mutated; the returned context replaces it.
pub fn process(ctx: &ProcessingContext, line: &Value) -> (Vec<SessionEvent>, ProcessingContext) {
    let mut ctx = ctx.clone();
    let mut events = Vec::new();

    match classify(line) {
        LineType::UserInput => {
            if let Some(text) = content_text(&line["message"]["content"]) {
                ctx.current_request_id = None;
                events.push(SessionEvent::AddBlock(Block::new(BlockContent::User {
                    text: text.trim_end().to_string(),
                })));
            }
        }
        LineType::LocalCommandOutput => {
            if let Some(raw) = content_text(&line["message"]["content"]) {
                let text = extract_local_stdout(&raw);
                if !text.is_empty() {
                    events.push(SessionEvent::AddBlock(Block::new(BlockContent::System {
                        text,
                    })));
                }
            }
        }
        LineType::AssistantText => {
            if let Some(text) = content_text(&line["message"]["content"]) {
                let request_id = line_request_id(line).or(ctx.current_request_id.clone());
                ctx.current_request_id = request_id.clone();
                events.push(SessionEvent::AddBlock(Block::new(BlockContent::Assistant {
                    text: text.trim_end().to_string(),
                    request_id,
                })));
            }
        }
        LineType::ToolUse => {
            let request_id = line_request_id(line).or(ctx.current_request_id.clone());
            for block in tool_use_blocks(line) {
                let id = block["id"].as_str().unwrap_or_default().to_string();
                if id.is_empty() {
                    continue;
                }
                let name = block["name"].as_str().unwrap_or_default();
                if name == "AskUserQuestion" {
                    let content = QuestionContent {
                        tool_use_id: id.clone(),
                        questions: parse_questions(&block["input"]),
                        answers: None,
                    };
                    let ui = Block::new(BlockContent::Question(content.clone()));
                    ctx.blocks.insert(id.clone(), ui.id);
                    ctx.question_cache.insert(id, content);
                    events.push(SessionEvent::AddBlock(ui));
                } else {
                    let content = ToolCallContent {
                        tool_name: name.to_string(),
                        tool_use_id: id.clone(),
                        label: abbreviate_label(name, &block["input"]),
                        result: None,
                        is_error: false,
                        progress_text: None,
                        request_id: request_id.clone(),
                        result_is_final: false,
                    };
                    let ui = Block::new(BlockContent::ToolCall(content.clone()));
                    ctx.blocks.insert(id.clone(), ui.id);
                    ctx.tool_cache.insert(id, content);
                    events.push(SessionEvent::AddBlock(ui));
                }
            }
        }
        LineType::Thinking => {
            let request_id = line_request_id(line).or(ctx.current_request_id.clone());
            events.push(SessionEvent::AddBlock(Block::new(BlockContent::Thinking {
                request_id,
            })));
        }
        LineType::TurnDuration => {
            let duration_ms = line["durationMs"]
                .as_u64()
                .or_else(|| line["duration_ms"].as_u64())
                .unwrap_or(0);
            ctx.current_request_id = None;
            events.push(SessionEvent::AddBlock(Block::new(BlockContent::Duration {
                duration_ms,
            })));
        }
        LineType::ToolResult => {
            for block in tool_result_blocks(line) {
                let tool_use_id = block["tool_use_id"].as_str().unwrap_or_default();
                if tool_use_id.is_empty() {
                    continue;
                }
                handle_tool_result(&mut ctx, &mut events, line, block, tool_use_id);
            }
        }
        LineType::BashProgress => {
            let text = bash_progress_text(line);
            apply_progress(&mut ctx, &mut events, line, text);
        }
        LineType::HookProgress => {
            let hook = line["data"]["hookName"].as_str().unwrap_or("unknown");
            apply_progress(&mut ctx, &mut events, line, format!("Hook: {hook}"));
        }
        LineType::AgentProgress => {
            apply_progress(&mut ctx, &mut events, line, "Agent: working…".to_string());
        }
        LineType::QueryUpdate => {
            let query = line["data"]["query"].as_str().unwrap_or_default();
            apply_progress(&mut ctx, &mut events, line, format!("Searching: {query}"));
        }
        LineType::SearchResults => {
            let count = line["data"]["resultCount"].as_u64().unwrap_or(0);
            apply_progress(&mut ctx, &mut events, line, format!("{count} results"));
        }
        LineType::WaitingForTask => {
            let task = line["data"]["taskDescription"].as_str().unwrap_or_default();
            let text = format!("Waiting: {task}");
            if parent_tool_use_id(line)
                .map(|id| ctx.tool_cache.contains_key(id))
                .unwrap_or(false)
            {
                apply_progress(&mut ctx, &mut events, line, text);
            } else {
                events.push(SessionEvent::AddBlock(Block::new(BlockContent::System {
                    text,
                })));
            }
        }
        LineType::CompactBoundary => {
            ctx.reset();
            events.push(SessionEvent::ClearAll);
        }
        LineType::Invisible => {}
    }

    (events, ctx)
}

fn handle_tool_result(
    ctx: &mut ProcessingContext,
    events: &mut Vec<SessionEvent>,
    line: &Value,
    block: &Value,
    tool_use_id: &str,
) {
    // Questions get their answers filled in.
    if let Some(mut question) = ctx.question_cache.get(tool_use_id).cloned() {
        if let Some(&block_id) = ctx.blocks.get(tool_use_id) {
            question.answers = parse_answers(&line["toolUseResult"]["answers"]);
            ctx.question_cache
                .insert(tool_use_id.to_string(), question.clone());
            events.push(SessionEvent::UpdateBlock {
                block_id,
                content: BlockContent::Question(question),
            });
            return;
        }
    }

    let result_text = tool_result_text(block);
    let is_error = block["is_error"].as_bool().unwrap_or(false);

    if let Some(mut tool) = ctx.tool_cache.get(tool_use_id).cloned() {
        if let Some(&block_id) = ctx.blocks.get(tool_use_id) {
            tool.result = Some(if tool.tool_name == "Task" {
                task_result_text(line).unwrap_or_else(|| truncate_result(&result_text))
            } else {
                truncate_result(&result_text)
            });
            tool.is_error = is_error;
            tool.result_is_final = true;
            tool.progress_text = None;
            ctx.tool_cache.insert(tool_use_id.to_string(), tool.clone());
            events.push(SessionEvent::UpdateBlock {
                block_id,
                content: BlockContent::ToolCall(tool),
            });
            return;
        }
    }

    // Orphan result, e.g. the tool call predates a compaction.
    events.push(SessionEvent::AddBlock(Block::new(BlockContent::System {
        text: truncate_result(&result_text),
    })));
}

/// Route a progress line to its tool call. Once a result is final, later
/// progress is dropped (post-result hook noise).
fn apply_progress(
    ctx: &mut ProcessingContext,
    events: &mut Vec<SessionEvent>,
    line: &Value,
    text: String,
) {
    let Some(parent) = parent_tool_use_id(line) else {
        return;
    };
    let Some(tool) = ctx.tool_cache.get(parent) else {
        return;
    };
    if tool.result_is_final {
        return;
    }
    let Some(&block_id) = ctx.blocks.get(parent) else {
        return;
    };
    let mut tool = tool.clone();
    tool.progress_text = Some(text);
    ctx.tool_cache.insert(parent.to_string(), tool.clone());
    events.push(SessionEvent::UpdateBlock {
        block_id,
        content: BlockContent::ToolCall(tool),
    });
}

fn line_request_id(line: &Value) -> Option<String> {
    line["requestId"].as_str().map(str::to_string)
}

fn parent_tool_use_id(line: &Value) -> Option<&str> {
    line["parentToolUseID"]
        .as_str()
        .or_else(|| line["toolUseID"].as_str())
}

fn tool_use_blocks(line: &Value) -> impl Iterator<Item = &Value> {
    line["message"]["content"]
        .as_array()
        .map(|blocks| blocks.iter())
        .into_iter()
        .flatten()
        .filter(|b| b["type"].as_str() == Some("tool_use"))
}

fn tool_result_blocks(line: &Value) -> impl Iterator<Item = &Value> {
    line["message"]["content"]
        .as_array()
        .map(|blocks| blocks.iter())
        .into_iter()
        .flatten()
        .filter(|b| b["type"].as_str() == Some("tool_result"))
}

/// Text of a tool_result content, which may be a string or a block list.
fn tool_result_text(block: &Value) -> String {
    match &block["content"] {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| p["type"].as_str() == Some("text"))
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Task results come from the structured `toolUseResult` payload instead of
/// the (verbose) tool_result content.
fn task_result_text(line: &Value) -> Option<String> {
    let text = line["toolUseResult"]["content"][0]["text"].as_str()?;
    Some(truncate_chars(text, TASK_RESULT_MAX))
}

fn extract_local_stdout(raw: &str) -> String {
    let start = match raw.find("<local-command-stdout>") {
        Some(pos) => pos + "<local-command-stdout>".len(),
        None => return raw.trim().to_string(),
    };
    let end = raw.find("</local-command-stdout>").unwrap_or(raw.len());
    raw[start..end.max(start)].trim().to_string()
}

/// Table-driven tool label abbreviation.
pub fn abbreviate_label(tool_name: &str, input: &Value) -> String {
    let field = |name: &str| input[name].as_str();
    match tool_name {
        "Bash" => field("description")
            .or_else(|| field("command"))
            .map(|s| truncate_chars(s, LABEL_MAX))
            .unwrap_or_else(|| "…".to_string()),
        "Read" | "Write" | "Edit" | "NotebookEdit" => field("file_path")
            .map(basename)
            .unwrap_or_else(|| "…".to_string()),
        "Glob" | "Grep" => field("pattern")
            .map(|s| truncate_chars(s, LABEL_MAX))
            .unwrap_or_else(|| "…".to_string()),
        "Task" => field("description")
            .map(|s| truncate_chars(s, LABEL_MAX))
            .unwrap_or_else(|| "…".to_string()),
        "WebSearch" => field("query")
            .map(|s| truncate_chars(s, LABEL_MAX))
            .unwrap_or_else(|| "…".to_string()),
        "WebFetch" => field("url")
            .map(|s| truncate_chars(s, LABEL_MAX))
            .unwrap_or_else(|| "…".to_string()),
        "TodoWrite" => "todos".to_string(),
        _ => "…".to_string(),
    }
}

fn basename(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

/// Truncate to `max` characters, appending an ellipsis when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

fn bash_progress_text(line: &Value) -> String {
    line["data"]["fullOutput"]
        .as_str()
        .and_then(|out| out.lines().rev().find(|l| !l.trim().is_empty()))
        .map(|l| truncate_chars(l.trim(), PROGRESS_MAX))
        .unwrap_or_else(|| "running…".to_string())
}

/// Result truncation for display: empty becomes "(no output)"; up to five
/// lines pass through; longer output keeps the first four plus an ellipsis.
pub fn truncate_result(content: &str) -> String {
    let trimmed = content.trim_end();
    if trimmed.trim().is_empty() {
        return "(no output)".to_string();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() <= RESULT_MAX_LINES {
        return trimmed.to_string();
    }
    let mut kept: Vec<&str> = lines[..RESULT_MAX_LINES - 1].to_vec();
    kept.push("…");
    kept.join("\n")
}

fn parse_questions(input: &Value) -> Vec<QuestionItem> {
    let Some(items) = input["questions"].as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .map(|q| QuestionItem {
            header: q["header"].as_str().unwrap_or_default().to_string(),
            question: q["question"].as_str().unwrap_or_default().to_string(),
            options: parse_options(&q["options"]),
            multi_select: q["multiSelect"]
                .as_bool()
                .or_else(|| q["multi_select"].as_bool())
                .unwrap_or(false),
        })
        .collect()
}

fn parse_options(options: &Value) -> Vec<QuestionOption> {
    let Some(items) = options.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|o| match o {
            Value::String(label) => Some(QuestionOption {
                label: label.clone(),
                description: String::new(),
            }),
            Value::Object(_) => Some(QuestionOption {
                label: o["label"].as_str().unwrap_or_default().to_string(),
                description: o["description"].as_str().unwrap_or_default().to_string(),
            }),
            _ => None,
        })
        .collect()
}

/// Answers arrive as `{header: label}` or `{header: [labels]}`; both forms
/// are accepted.
fn parse_answers(answers: &Value) -> Option<BTreeMap<String, Vec<String>>> {
    let obj = answers.as_object()?;
    let mut out = BTreeMap::new();
    for (header, selected) in obj {
        let labels = match selected {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => continue,
        };
        out.insert(header.clone(), labels);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tailcast_core::types::BlockKind;

    fn tool_use_line(id: &str, name: &str, input: Value) -> Value {
        json!({
            "type": "assistant",
            "requestId": "req_1",
            "message": {"content": [
                {"type": "tool_use", "id": id, "name": name, "input": input}
            ]}
        })
    }

    fn tool_result_line(id: &str, content: &str, is_error: bool) -> Value {
        json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": id, "content": content, "is_error": is_error}
            ]}
        })
    }

    #[test]
    fn caller_context_is_not_mutated() {
        let ctx = ProcessingContext::default();
        let snapshot = ctx.clone();
        let line = tool_use_line("tu_1", "Bash", json!({"command": "ls"}));
        let (_, next) = process(&ctx, &line);
        assert_eq!(ctx, snapshot);
        assert_ne!(next, snapshot);
    }

    #[test]
    fn user_input_clears_request_grouping() {
        let ctx = ProcessingContext {
            current_request_id: Some("req_9".into()),
            ..Default::default()
        };
        let line = json!({"type": "user", "message": {"content": "hi"}});
        let (events, next) = process(&ctx, &line);
        assert_eq!(events.len(), 1);
        assert!(next.current_request_id.is_none());
    }

    #[test]
    fn assistant_text_sets_request_id() {
        let ctx = ProcessingContext::default();
        let line = json!({
            "type": "assistant",
            "requestId": "req_7",
            "message": {"content": [{"type": "text", "text": "working on it"}]}
        });
        let (events, next) = process(&ctx, &line);
        assert_eq!(next.current_request_id.as_deref(), Some("req_7"));
        match &events[0] {
            SessionEvent::AddBlock(block) => {
                assert_eq!(block.request_id(), Some("req_7"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn tool_call_result_lifecycle() {
        let ctx = ProcessingContext::default();
        let (events, ctx) = process(
            &ctx,
            &tool_use_line("tu_1", "Bash", json!({"description": "run tests"})),
        );
        let block_id = match &events[0] {
            SessionEvent::AddBlock(block) => {
                assert_eq!(block.kind(), BlockKind::ToolCall);
                block.id
            }
            other => panic!("unexpected event {other:?}"),
        };

        // Progress arrives.
        let progress = json!({
            "type": "progress",
            "parentToolUseID": "tu_1",
            "data": {"type": "bash_progress", "fullOutput": "running 10 cases\n"}
        });
        let (events, ctx) = process(&ctx, &progress);
        match &events[0] {
            SessionEvent::UpdateBlock { block_id: id, content } => {
                assert_eq!(*id, block_id);
                match content {
                    BlockContent::ToolCall(tc) => {
                        assert_eq!(tc.progress_text.as_deref(), Some("running 10 cases"));
                        assert!(!tc.result_is_final);
                    }
                    other => panic!("unexpected content {other:?}"),
                }
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Result lands and is final.
        let (events, ctx) = process(&ctx, &tool_result_line("tu_1", "ok: 10 passed", false));
        match &events[0] {
            SessionEvent::UpdateBlock { content, .. } => match content {
                BlockContent::ToolCall(tc) => {
                    assert_eq!(tc.result.as_deref(), Some("ok: 10 passed"));
                    assert!(tc.result_is_final);
                    assert!(tc.progress_text.is_none());
                }
                other => panic!("unexpected content {other:?}"),
            },
            other => panic!("unexpected event {other:?}"),
        }

        // Post-result hook progress is a no-op.
        let late = json!({
            "type": "progress",
            "parentToolUseID": "tu_1",
            "data": {"type": "hook_progress", "hookName": "PostToolUse"}
        });
        let (events, _) = process(&ctx, &late);
        assert!(events.is_empty());
    }

    #[test]
    fn orphan_tool_result_becomes_system_block() {
        let ctx = ProcessingContext::default();
        let (events, _) = process(&ctx, &tool_result_line("tu_gone", "stale output", false));
        match &events[0] {
            SessionEvent::AddBlock(block) => {
                assert_eq!(block.kind(), BlockKind::System);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn compact_boundary_resets_everything() {
        let ctx = ProcessingContext::default();
        let (_, ctx) = process(
            &ctx,
            &tool_use_line("tu_1", "Bash", json!({"command": "ls"})),
        );
        assert!(!ctx.tool_cache.is_empty());

        let (events, ctx) = process(&ctx, &json!({"type": "system", "subtype": "compact_boundary"}));
        assert_eq!(events, vec![SessionEvent::ClearAll]);
        assert!(ctx.blocks.is_empty());
        assert!(ctx.tool_cache.is_empty());
        assert!(ctx.question_cache.is_empty());
    }

    #[test]
    fn question_flow() {
        let ctx = ProcessingContext::default();
        let line = tool_use_line(
            "tu_q",
            "AskUserQuestion",
            json!({"questions": [{
                "header": "Deploy",
                "question": "Deploy to which environment?",
                "options": [
                    {"label": "staging", "description": "safe"},
                    {"label": "production", "description": "scary"}
                ],
                "multiSelect": false
            }]}),
        );
        let (events, ctx) = process(&ctx, &line);
        let block_id = match &events[0] {
            SessionEvent::AddBlock(block) => {
                assert_eq!(block.kind(), BlockKind::Question);
                block.id
            }
            other => panic!("unexpected event {other:?}"),
        };

        let answer = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "tu_q", "content": "answered"}
            ]},
            "toolUseResult": {"answers": {"Deploy": "staging"}}
        });
        let (events, _) = process(&ctx, &answer);
        match &events[0] {
            SessionEvent::UpdateBlock { block_id: id, content } => {
                assert_eq!(*id, block_id);
                match content {
                    BlockContent::Question(q) => {
                        let answers = q.answers.as_ref().unwrap();
                        assert_eq!(answers["Deploy"], vec!["staging".to_string()]);
                    }
                    other => panic!("unexpected content {other:?}"),
                }
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn task_result_from_structured_payload() {
        let ctx = ProcessingContext::default();
        let (_, ctx) = process(
            &ctx,
            &tool_use_line("tu_t", "Task", json!({"description": "explore the repo"})),
        );
        let long = "x".repeat(120);
        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "tu_t", "content": "done"}
            ]},
            "toolUseResult": {"content": [{"type": "text", "text": long}]}
        });
        let (events, _) = process(&ctx, &line);
        match &events[0] {
            SessionEvent::UpdateBlock { content, .. } => match content {
                BlockContent::ToolCall(tc) => {
                    let result = tc.result.as_deref().unwrap();
                    assert_eq!(result.chars().count(), 81); // 80 + ellipsis
                    assert!(result.ends_with('…'));
                }
                other => panic!("unexpected content {other:?}"),
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn waiting_without_parent_becomes_system() {
        let ctx = ProcessingContext::default();
        let line = json!({
            "type": "progress",
            "data": {"type": "waiting_for_task", "taskDescription": "review"}
        });
        let (events, _) = process(&ctx, &line);
        match &events[0] {
            SessionEvent::AddBlock(block) => match &block.content {
                BlockContent::System { text } => assert_eq!(text, "Waiting: review"),
                other => panic!("unexpected content {other:?}"),
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn label_abbreviation_table() {
        assert_eq!(
            abbreviate_label("Bash", &json!({"description": "run tests"})),
            "run tests"
        );
        assert_eq!(
            abbreviate_label("Bash", &json!({"command": "cargo test"})),
            "cargo test"
        );
        assert_eq!(
            abbreviate_label("Read", &json!({"file_path": "/a/b/main.rs"})),
            "main.rs"
        );
        assert_eq!(
            abbreviate_label("Grep", &json!({"pattern": "fn main"})),
            "fn main"
        );
        assert_eq!(abbreviate_label("TodoWrite", &json!({})), "todos");
        assert_eq!(abbreviate_label("Mystery", &json!({})), "…");
        assert_eq!(abbreviate_label("Bash", &json!({})), "…");

        let long = "y".repeat(80);
        let label = abbreviate_label("WebSearch", &json!({"query": long}));
        assert_eq!(label.chars().count(), 61);
        assert!(label.ends_with('…'));
    }

    #[test]
    fn result_truncation_rules() {
        assert_eq!(truncate_result(""), "(no output)");
        assert_eq!(truncate_result("   \n  "), "(no output)");
        assert_eq!(truncate_result("a\nb\nc\nd\ne"), "a\nb\nc\nd\ne");
        assert_eq!(truncate_result("l1\nl2\nl3\nl4\nl5\nl6"), "l1\nl2\nl3\nl4\n…");
    }

    #[test]
    fn processing_context_roundtrips_through_json() {
        let ctx = ProcessingContext::default();
        let (_, ctx) = process(
            &ctx,
            &tool_use_line("tu_1", "Bash", json!({"command": "ls"})),
        );
        let json = serde_json::to_string(&ctx).unwrap();
        let back: ProcessingContext = serde_json::from_str(&json).unwrap();
        assert_eq!(ctx, back);
    }
}
