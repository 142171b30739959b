use serde_json::Value;

/// Semantic class of one transcript line. The fifteen types partition the
/// record universe; anything unrecognized resolves to `Invisible`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineType {
    UserInput,
    ToolResult,
    LocalCommandOutput,
    AssistantText,
    ToolUse,
    Thinking,
    TurnDuration,
    CompactBoundary,
    BashProgress,
    HookProgress,
    AgentProgress,
    QueryUpdate,
    SearchResults,
    WaitingForTask,
    Invisible,
}

/// Classify a parsed transcript record.
///
/// Defensive by design: missing fields, unknown types, and malformed
/// substructure all map to `Invisible` rather than erroring.
pub fn classify(line: &Value) -> LineType {
    let Some(obj) = line.as_object() else {
        return LineType::Invisible;
    };

    // Sub-agent noise and skill expansions are never rendered.
    if obj.get("isSidechain").and_then(Value::as_bool) == Some(true) {
        return LineType::Invisible;
    }
    if obj.get("isMeta").and_then(Value::as_bool) == Some(true) {
        return LineType::Invisible;
    }

    match obj.get("type").and_then(Value::as_str) {
        Some("user") => classify_user(line),
        Some("assistant") => classify_assistant(line),
        Some("system") => classify_system(line),
        Some("progress") => classify_progress(line),
        _ => LineType::Invisible,
    }
}

fn classify_user(line: &Value) -> LineType {
    let content = &line["message"]["content"];

    if content_text(content)
        .map(|t| t.contains("<local-command-stdout>"))
        .unwrap_or(false)
    {
        return LineType::LocalCommandOutput;
    }

    if let Some(blocks) = content.as_array() {
        if blocks
            .iter()
            .any(|b| b["type"].as_str() == Some("tool_result"))
        {
            return LineType::ToolResult;
        }
    }

    match content_text(content) {
        Some(text) if !text.trim().is_empty() => LineType::UserInput,
        _ => LineType::Invisible,
    }
}

fn classify_assistant(line: &Value) -> LineType {
    let Some(blocks) = line["message"]["content"].as_array() else {
        return LineType::Invisible;
    };
    if blocks.is_empty() {
        return LineType::Invisible;
    }

    if blocks.iter().any(|b| b["type"].as_str() == Some("tool_use")) {
        return LineType::ToolUse;
    }

    let text = blocks
        .iter()
        .filter(|b| b["type"].as_str() == Some("text"))
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    if !text.trim().is_empty() && text != "(no content)" {
        return LineType::AssistantText;
    }

    if blocks.iter().any(|b| b["type"].as_str() == Some("thinking")) {
        return LineType::Thinking;
    }

    LineType::Invisible
}

fn classify_system(line: &Value) -> LineType {
    match line["subtype"].as_str() {
        Some("turn_duration") => LineType::TurnDuration,
        Some("compact_boundary") => LineType::CompactBoundary,
        _ => LineType::Invisible,
    }
}

fn classify_progress(line: &Value) -> LineType {
    let subtype = line["data"]["type"]
        .as_str()
        .or_else(|| line["subtype"].as_str());
    match subtype {
        Some("bash_progress") => LineType::BashProgress,
        Some("hook_progress") => LineType::HookProgress,
        Some("agent_progress") => LineType::AgentProgress,
        Some("query_update") => LineType::QueryUpdate,
        Some("search_results_received") => LineType::SearchResults,
        Some("waiting_for_task") => LineType::WaitingForTask,
        _ => LineType::Invisible,
    }
}

/// Extract the visible text of a `message.content` that is either a plain
/// string or a list of content blocks.
pub(crate) fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let text = blocks
                .iter()
                .filter(|b| b["type"].as_str() == Some("text"))
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("");
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}
