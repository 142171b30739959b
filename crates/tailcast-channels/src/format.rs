use tailcast_core::types::{QuestionContent, ToolCallContent};

use crate::tracker::{MessagePayload, TurnSnapshot};

pub const TELEGRAM_MAX_LEN: usize = 4096;
pub const SLACK_MAX_BLOCKS: usize = 50;
/// Slack caps a section block's text at 3000 characters.
pub const SLACK_SECTION_MAX: usize = 3000;

/// At most this many answer buttons are shown; the rest collapse into an
/// overflow row.
pub const QUESTION_BUTTON_CAP: usize = 5;
pub const BUTTON_LABEL_MAX: usize = 30;

/// Render a message payload to its neutral text form. Platform escaping is
/// applied afterwards, per platform.
pub fn payload_text(payload: &MessagePayload) -> String {
    match payload {
        MessagePayload::User(text) => prefixed(text, "❯ ", "  "),
        MessagePayload::System(text) => text.clone(),
        MessagePayload::Compaction => "✱ Context compacted".to_string(),
        MessagePayload::Turn(turn) => turn_text(turn),
        MessagePayload::Question(q) => question_text(q),
    }
}

fn turn_text(turn: &TurnSnapshot) -> String {
    let mut parts = Vec::new();
    if let Some(text) = &turn.assistant_text {
        parts.push(prefixed(text, "● ", "  "));
    }
    for tool in &turn.tools {
        parts.push(tool_text(tool));
    }
    if let Some(ms) = turn.duration_ms {
        parts.push(format!("✱ Crunched for {}", duration_text(ms)));
    }
    parts.join("\n")
}

fn tool_text(tool: &ToolCallContent) -> String {
    let mut out = format!("● {}({})", tool.tool_name, tool.label);
    if let Some(result) = &tool.result {
        let lead = if tool.is_error { "  ✗ " } else { "  └ " };
        for (i, line) in result.lines().enumerate() {
            out.push('\n');
            out.push_str(if i == 0 { lead } else { "    " });
            out.push_str(line);
        }
    } else if let Some(progress) = &tool.progress_text {
        out.push_str("\n  └ ");
        out.push_str(progress);
    }
    out
}

fn question_text(q: &QuestionContent) -> String {
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
                out.push_str("\n✓ ");
                out.push_str(&labels.join(", "));
            }
            None => {
                for option in &item.options {
                    out.push_str("\n○ ");
                    out.push_str(&option.label);
                }
                out.push_str("\n(awaiting response)");
            }
        }
    }
    out
}

fn duration_text(ms: u64) -> String {
    let total_secs = ms / 1000;
    if total_secs >= 60 {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    } else {
        format!("{}s", total_secs)
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

/// Escaping for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escaping for Slack mrkdwn text.
pub fn escape_slack(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Visible question buttons plus an optional overflow label.
///
/// Returns `(buttons, overflow)`: at most `QUESTION_BUTTON_CAP` labels, each
/// truncated to `BUTTON_LABEL_MAX` characters, and the "N more in CLI" text
/// when options were cut.
pub fn question_buttons(q: &QuestionContent) -> (Vec<String>, Option<String>) {
    let all: Vec<&str> = q
        .questions
        .iter()
        .flat_map(|item| item.options.iter().map(|o| o.label.as_str()))
        .collect();
    let visible = all
        .iter()
        .take(QUESTION_BUTTON_CAP)
        .map(|label| truncate_label(label))
        .collect();
    let overflow = if all.len() > QUESTION_BUTTON_CAP {
        Some(format!("{} more in CLI", all.len() - QUESTION_BUTTON_CAP))
    } else {
        None
    };
    (visible, overflow)
}

fn truncate_label(label: &str) -> String {
    if label.chars().count() <= BUTTON_LABEL_MAX {
        return label.to_string();
    }
    let mut out: String = label.chars().take(BUTTON_LABEL_MAX).collect();
    out.push('…');
    out
}

/// Slack Block Kit rendering of an outbound message: mrkdwn sections plus
/// an actions block with answer buttons. Never exceeds `SLACK_MAX_BLOCKS`.
pub fn slack_blocks(message: &crate::publisher::OutboundMessage) -> Vec<serde_json::Value> {
    let mut blocks = Vec::new();
    let escaped = escape_slack(&message.text);
    for chunk in split_text(&escaped, SLACK_SECTION_MAX) {
        blocks.push(serde_json::json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": chunk }
        }));
        if blocks.len() == SLACK_MAX_BLOCKS - 1 {
            break;
        }
    }

    if let Some(q) = &message.question {
        if !message.remove_keyboard && q.answers.is_none() {
            let (labels, overflow) = question_buttons(q);
            let mut elements: Vec<serde_json::Value> = labels
                .iter()
                .enumerate()
                .map(|(i, label)| {
                    serde_json::json!({
                        "type": "button",
                        "text": { "type": "plain_text", "text": label },
                        "action_id": format!("answer:{}:{}", q.tool_use_id, i)
                    })
                })
                .collect();
            if let Some(more) = overflow {
                elements.push(serde_json::json!({
                    "type": "button",
                    "text": { "type": "plain_text", "text": more },
                    "action_id": format!("overflow:{}", q.tool_use_id)
                }));
            }
            if !elements.is_empty() && blocks.len() < SLACK_MAX_BLOCKS {
                blocks.push(serde_json::json!({
                    "type": "actions",
                    "elements": elements
                }));
            }
        }
    }

    blocks
}

/// Split text into chunks of at most `max_len` characters.
///
/// Splits on newline boundaries when possible, falling back to hard splits
/// when a single line exceeds the limit.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };

        if needed > max_len {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if line_len > max_len {
                let mut rest: Vec<char> = line.chars().collect();
                while rest.len() > max_len {
                    chunks.push(rest[..max_len].iter().collect());
                    rest.drain(..max_len);
                }
                if !rest.is_empty() {
                    current = rest.into_iter().collect();
                    current_len = current.chars().count();
                }
            } else {
                current = line.to_string();
                current_len = line_len;
            }
        } else if current.is_empty() {
            current = line.to_string();
            current_len = line_len;
        } else {
            current.push('\n');
            current.push_str(line);
            current_len = needed;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
