use std::collections::HashMap;

use tailcast_core::types::{Block, BlockContent, BlockId, SessionEvent};

/// Applies events to an ordered block list and renders it as markdown.
///
/// One consumer per session, single-writer (the file-change handler).
#[derive(Debug, Default)]
pub struct Consumer {
    blocks: Vec<Block>,
    index: HashMap<BlockId, usize>,
}

impl Consumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Apply one event. Updates that reference an unknown id (e.g. from
    /// before a compaction) are ignored.
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::AddBlock(block) => {
                self.index.insert(block.id, self.blocks.len());
                self.blocks.push(block.clone());
            }
            SessionEvent::UpdateBlock { block_id, content } => {
                if let Some(&pos) = self.index.get(block_id) {
                    self.blocks[pos].content = content.clone();
                }
            }
            SessionEvent::ClearAll => {
                self.blocks.clear();
                self.index.clear();
            }
        }
    }

    /// Render all blocks. Blocks are separated by a blank line except when
    /// consecutive blocks share a non-null request id.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut prev_request: Option<&str> = None;
        for (i, block) in self.blocks.iter().enumerate() {
            let request = block.request_id();
            if i > 0 {
                let grouped = request.is_some() && request == prev_request;
                out.push('\n');
                if !grouped {
                    out.push('\n');
                }
            }
            out.push_str(&render_block(block));
            prev_request = request;
        }
        out
    }
}

/// Render one block in its text form.
pub fn render_block(block: &Block) -> String {
    match &block.content {
        BlockContent::User { text } => prefixed(text, "❯ ", "  "),
        BlockContent::Assistant { text, .. } => prefixed(text, "● ", "  "),
        BlockContent::ToolCall(tc) => {
            let mut out = format!("● {}({})", tc.tool_name, tc.label);
            if let Some(result) = &tc.result {
                let lead = if tc.is_error { "  ✗ " } else { "  └ " };
                for (i, line) in result.lines().enumerate() {
                    out.push('\n');
                    if i == 0 {
                        out.push_str(lead);
                    } else {
                        out.push_str("    ");
                    }
                    out.push_str(line);
                }
            } else if let Some(progress) = &tc.progress_text {
                out.push_str("\n  └ ");
                out.push_str(progress);
            }
            out
        }
        BlockContent::Thinking { .. } => "✱ Thinking…".to_string(),
        BlockContent::Duration { duration_ms } => {
            format!("✱ Crunched for {}", format_duration(*duration_ms))
        }
        BlockContent::System { text } => text.clone(),
        BlockContent::Question(q) => {
            let mut out = String::new();
            for (i, item) in q.questions.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                out.push_str(&item.header);
                out.push_str(": ");
                out.push_str(&item.question);
                match q
                    .answers
                    .as_ref()
                    .and_then(|answers| answers.get(&item.header))
                {
                    Some(labels) => {
                        out.push('\n');
                        out.push_str("✓ ");
                        out.push_str(&labels.join(", "));
                    }
                    None => {
                        for option in &item.options {
                            out.push('\n');
                            out.push_str("○ ");
                            out.push_str(&option.label);
                            if !option.description.is_empty() {
                                out.push_str(" (");
                                out.push_str(&option.description);
                                out.push(')');
                            }
                        }
                        out.push_str("\n(awaiting response)");
                    }
                }
            }
            out
        }
    }
}

fn prefixed(text: &str, first: &str, rest: &str) -> String {
    let mut out = String::new();
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(if i == 0 { first } else { rest });
        out.push_str(line);
    }
    if text.is_empty() {
        out.push_str(first);
    }
    out
}

fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    if total_secs >= 60 {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    } else {
        format!("{}s", total_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::processor::{process, ProcessingContext};

    fn feed(lines: &[serde_json::Value]) -> Consumer {
        let mut consumer = Consumer::new();
        let mut ctx = ProcessingContext::default();
        for line in lines {
            let (events, next) = process(&ctx, line);
            for event in &events {
                consumer.apply(event);
            }
            ctx = next;
        }
        consumer
    }

    #[test]
    fn tool_call_with_progress_then_result() {
        // The result line displaces progress and survives late hooks.
        let consumer = feed(&[
            json!({
                "type": "assistant",
                "message": {"content": [{
                    "type": "tool_use", "id": "T", "name": "Bash",
                    "input": {"description": "run tests"}
                }]}
            }),
            json!({
                "type": "progress",
                "parentToolUseID": "T",
                "data": {"type": "bash_progress", "fullOutput": "running 10 cases"}
            }),
            json!({
                "type": "user",
                "message": {"content": [{
                    "type": "tool_result", "tool_use_id": "T",
                    "content": "ok: 10 passed", "is_error": false
                }]}
            }),
            json!({
                "type": "progress",
                "parentToolUseID": "T",
                "data": {"type": "hook_progress", "hookName": "PostToolUse"}
            }),
        ]);
        assert_eq!(consumer.render(), "● Bash(run tests)\n  └ ok: 10 passed");
    }

    #[test]
    fn long_result_truncation() {
        // Six lines render as four plus ellipsis.
        let consumer = feed(&[
            json!({
                "type": "assistant",
                "message": {"content": [{
                    "type": "tool_use", "id": "T", "name": "Bash",
                    "input": {"command": "make"}
                }]}
            }),
            json!({
                "type": "user",
                "message": {"content": [{
                    "type": "tool_result", "tool_use_id": "T",
                    "content": "l1\nl2\nl3\nl4\nl5\nl6"
                }]}
            }),
        ]);
        assert_eq!(
            consumer.render(),
            "● Bash(make)\n  └ l1\n    l2\n    l3\n    l4\n    …"
        );
    }

    #[test]
    fn request_grouping_suppresses_separators() {
        // Same-request blocks join with a single newline; the next user
        // input reintroduces the blank line.
        let consumer = feed(&[
            json!({
                "type": "assistant", "requestId": "R",
                "message": {"content": [{"type": "text", "text": "first"}]}
            }),
            json!({
                "type": "assistant", "requestId": "R",
                "message": {"content": [{
                    "type": "tool_use", "id": "T", "name": "Read",
                    "input": {"file_path": "/src/lib.rs"}
                }]}
            }),
            json!({
                "type": "assistant", "requestId": "R",
                "message": {"content": [{"type": "text", "text": "second"}]}
            }),
            json!({"type": "user", "message": {"content": "thanks"}}),
        ]);
        assert_eq!(
            consumer.render(),
            "● first\n● Read(lib.rs)\n● second\n\n❯ thanks"
        );
    }

    #[test]
    fn compaction_clears_and_orphans_render_as_system() {
        // After a compact boundary the list is empty and a stale
        // tool_result comes back as a System block.
        let mut ctx = ProcessingContext::default();
        let mut consumer = Consumer::new();

        let lines = [
            json!({
                "type": "assistant",
                "message": {"content": [{
                    "type": "tool_use", "id": "T", "name": "Bash",
                    "input": {"command": "ls"}
                }]}
            }),
            json!({"type": "system", "subtype": "compact_boundary"}),
        ];
        for line in &lines {
            let (events, next) = process(&ctx, line);
            for event in &events {
                consumer.apply(event);
            }
            ctx = next;
        }
        assert!(consumer.is_empty());

        let stale = json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result", "tool_use_id": "T", "content": "old output"
            }]}
        });
        let (events, _) = process(&ctx, &stale);
        for event in &events {
            consumer.apply(event);
        }
        assert_eq!(consumer.render(), "old output");
    }

    #[test]
    fn update_for_unknown_id_is_ignored() {
        let mut consumer = Consumer::new();
        consumer.apply(&SessionEvent::UpdateBlock {
            block_id: tailcast_core::types::BlockId::new(),
            content: tailcast_core::types::BlockContent::System {
                text: "ghost".into(),
            },
        });
        assert!(consumer.is_empty());
    }

    #[test]
    fn multiline_user_and_assistant_indentation() {
        let consumer = feed(&[
            json!({"type": "user", "message": {"content": "line one\nline two"}}),
            json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "answer\ncontinued"}]}
            }),
        ]);
        assert_eq!(
            consumer.render(),
            "❯ line one\n  line two\n\n● answer\n  continued"
        );
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(4_000), "4s");
        assert_eq!(format_duration(59_999), "59s");
        assert_eq!(format_duration(60_000), "1m 0s");
        assert_eq!(format_duration(135_000), "2m 15s");
    }

    #[test]
    fn question_pending_and_answered() {
        let tool_use = json!({
            "type": "assistant",
            "message": {"content": [{
                "type": "tool_use", "id": "Q", "name": "AskUserQuestion",
                "input": {"questions": [{
                    "header": "Deploy",
                    "question": "Where to?",
                    "options": [{"label": "staging", "description": "safe"},
                                {"label": "production", "description": ""}],
                    "multiSelect": false
                }]}
            }]}
        });
        let consumer = feed(std::slice::from_ref(&tool_use));
        assert_eq!(
            consumer.render(),
            "Deploy: Where to?\n○ staging (safe)\n○ production\n(awaiting response)"
        );

        let answered = feed(&[
            tool_use,
            json!({
                "type": "user",
                "message": {"content": [{
                    "type": "tool_result", "tool_use_id": "Q", "content": "done"
                }]},
                "toolUseResult": {"answers": {"Deploy": "staging"}}
            }),
        ]);
        assert_eq!(answered.render(), "Deploy: Where to?\n✓ staging");
    }

    #[test]
    fn identical_input_renders_identically_across_sessions() {
        let lines = vec![
            json!({"type": "user", "message": {"content": "do the thing"}}),
            json!({
                "type": "assistant", "requestId": "R",
                "message": {"content": [{"type": "text", "text": "on it"}]}
            }),
            json!({"type": "system", "subtype": "turn_duration", "durationMs": 61_000}),
        ];
        let a = feed(&lines);
        let b = feed(&lines);
        assert_eq!(a.render(), b.render());
    }
}
