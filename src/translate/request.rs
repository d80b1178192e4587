//! Request translation between the Messages API and the Responses API.
//!
//! Claude -> Codex flattens the message list into `input` items: text and
//! images become `message` items, `tool_use` blocks become `function_call`
//! items and `tool_result` blocks become `function_call_output` items, in the
//! order they appear. Codex -> Claude folds them back into alternating
//! messages. Tool names longer than the upstream limit are shortened
//! deterministically so responses can be mapped back.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use super::claude_types::{
    ContentBlock, ImageSource, Message, MessagesRequest, Role, ToolChoice, ToolResultContent,
};
use super::codex_types::{
    CodexTool, CodexToolChoice, CodexToolChoiceFunction, InputContent, InputItem, Reasoning,
    ResponsesRequest,
};
use crate::models::{budget_for_effort, effort_for_budget};

pub const MAX_TOOL_NAME_LEN: usize = 64;
pub const DEFAULT_CLAUDE_MAX_TOKENS: u64 = 32_000;
const DEFAULT_EFFORT: &str = "medium";
const MCP_PREFIX: &str = "mcp__";

/// Translate a Messages API request into a Codex Responses request.
/// Pure function: `model` is written as-is; alias resolution happens later.
pub fn claude_to_codex(req: &MessagesRequest, model: &str, stream: bool) -> ResponsesRequest {
    let declared: Vec<String> = req
        .tools
        .iter()
        .flatten()
        .map(|t| t.name.clone())
        .collect();
    let short_names = build_short_name_map(&declared);
    let shorten = |name: &str| {
        short_names
            .get(name)
            .cloned()
            .unwrap_or_else(|| short_name_candidate(name))
    };

    let mut input = Vec::new();
    for msg in &req.messages {
        translate_message(msg, &shorten, &mut input);
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| {
                if t.tool_type.as_deref().is_some_and(|ty| ty.starts_with("web_search")) {
                    return CodexTool::WebSearch;
                }
                CodexTool::Function {
                    name: shorten(&t.name),
                    description: t.description.clone(),
                    parameters: t
                        .input_schema
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    strict: false,
                }
            })
            .collect()
    });

    let tool_choice = req
        .tool_choice
        .as_ref()
        .map(|tc| translate_tool_choice(tc, &shorten));

    let effort = match &req.thinking {
        Some(t) if t.thinking_type == "enabled" => {
            effort_for_budget(t.budget_tokens.unwrap_or(0)).to_string()
        }
        _ => DEFAULT_EFFORT.to_string(),
    };

    ResponsesRequest {
        model: model.to_string(),
        instructions: req.system.as_ref().map(|s| s.as_text()).unwrap_or_default(),
        input,
        tools,
        tool_choice,
        parallel_tool_calls: true,
        reasoning: Reasoning {
            effort,
            summary: "auto".to_string(),
        },
        store: false,
        stream,
        include: vec!["reasoning.encrypted_content".to_string()],
        max_output_tokens: req.max_tokens,
    }
}

fn translate_message(msg: &Message, shorten: &dyn Fn(&str) -> String, out: &mut Vec<InputItem>) {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let mut parts: Vec<InputContent> = Vec::new();

    for block in msg.content.blocks() {
        match block {
            ContentBlock::Text { text } => {
                parts.push(match msg.role {
                    Role::User => InputContent::InputText { text },
                    Role::Assistant => InputContent::OutputText { text },
                });
            }
            ContentBlock::Image { source } => {
                if let Some(image_url) = image_url(&source) {
                    parts.push(InputContent::InputImage { image_url });
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                flush_message(role, &mut parts, out);
                out.push(InputItem::FunctionCall {
                    call_id: id,
                    name: shorten(&name),
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                flush_message(role, &mut parts, out);
                out.push(InputItem::FunctionCallOutput {
                    call_id: tool_use_id,
                    output: tool_result_to_string(content.as_ref(), is_error),
                });
            }
            ContentBlock::Thinking { .. } | ContentBlock::Unsupported => {}
        }
    }

    flush_message(role, &mut parts, out);
}

fn flush_message(role: &str, parts: &mut Vec<InputContent>, out: &mut Vec<InputItem>) {
    if parts.is_empty() {
        return;
    }
    out.push(InputItem::Message {
        role: role.to_string(),
        content: std::mem::take(parts),
    });
}

fn image_url(source: &ImageSource) -> Option<String> {
    match source.source_type.as_str() {
        "base64" => {
            let data = source.data.as_deref()?;
            let media_type = source.media_type.as_deref().unwrap_or("image/png");
            Some(format!("data:{media_type};base64,{data}"))
        }
        "url" => source.url.clone(),
        _ => None,
    }
}

fn tool_result_to_string(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) { "Error: " } else { "" };

    match content {
        Some(ToolResultContent::Text(t)) => format!("{prefix}{t}"),
        Some(ToolResultContent::Blocks(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{prefix}{text}")
        }
        None => prefix.trim_end().to_string(),
    }
}

fn translate_tool_choice(tc: &ToolChoice, shorten: &dyn Fn(&str) -> String) -> CodexToolChoice {
    match tc.choice_type.as_str() {
        "any" => CodexToolChoice::Mode("required".to_string()),
        "none" => CodexToolChoice::Mode("none".to_string()),
        "tool" => match tc.name.as_deref() {
            Some(name) => CodexToolChoice::Function(CodexToolChoiceFunction {
                choice_type: "function".to_string(),
                name: shorten(name),
            }),
            None => CodexToolChoice::Mode("required".to_string()),
        },
        _ => CodexToolChoice::Mode("auto".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tool name shortening
// ---------------------------------------------------------------------------

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn short_name_candidate(name: &str) -> String {
    if name.chars().count() <= MAX_TOOL_NAME_LEN {
        return name.to_string();
    }
    if name.starts_with(MCP_PREFIX) {
        if let Some(idx) = name.rfind("__") {
            if idx > 0 {
                let candidate = format!("{MCP_PREFIX}{}", &name[idx + 2..]);
                return truncate_chars(&candidate, MAX_TOOL_NAME_LEN).to_string();
            }
        }
    }
    truncate_chars(name, MAX_TOOL_NAME_LEN).to_string()
}

/// Map each declared tool name to a unique name within the upstream limit.
/// Collisions get `_1`, `_2`, ... suffixes.
pub fn build_short_name_map(names: &[String]) -> HashMap<String, String> {
    let mut used: HashSet<String> = HashSet::new();
    let mut map = HashMap::new();

    for name in names {
        if map.contains_key(name) {
            continue;
        }
        let candidate = short_name_candidate(name);
        let unique = if used.contains(&candidate) {
            let mut i = 1usize;
            loop {
                let suffix = format!("_{i}");
                let allowed = MAX_TOOL_NAME_LEN.saturating_sub(suffix.len());
                let attempt = format!("{}{suffix}", truncate_chars(&candidate, allowed));
                if !used.contains(&attempt) {
                    break attempt;
                }
                i += 1;
            }
        } else {
            candidate
        };
        used.insert(unique.clone());
        map.insert(name.clone(), unique);
    }

    map
}

/// Short name -> original name, from the tools of the client's original
/// Messages request. Empty when nothing was shortened.
pub fn reverse_name_map(original_request: &[u8]) -> HashMap<String, String> {
    let Ok(value) = serde_json::from_slice::<Value>(original_request) else {
        return HashMap::new();
    };
    let names: Vec<String> = value
        .get("tools")
        .and_then(|t| t.as_array())
        .into_iter()
        .flatten()
        .filter_map(|t| t.get("name").and_then(|n| n.as_str()).map(str::to_string))
        .collect();

    build_short_name_map(&names)
        .into_iter()
        .filter(|(original, short)| original != short)
        .map(|(original, short)| (short, original))
        .collect()
}

// ---------------------------------------------------------------------------
// Codex -> Claude
// ---------------------------------------------------------------------------

/// Translate a Responses API request into a Messages API request.
pub fn codex_to_claude(req: &Value, model: &str, stream: bool) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(instructions) = req.get("instructions").and_then(|v| v.as_str()) {
        if !instructions.trim().is_empty() {
            system_parts.push(instructions.to_string());
        }
    }

    let mut messages: Vec<Value> = Vec::new();
    match req.get("input") {
        Some(Value::String(text)) => {
            push_blocks(&mut messages, "user", vec![json!({"type": "text", "text": text})]);
        }
        Some(Value::Array(items)) => {
            for item in items {
                translate_input_item(item, &mut system_parts, &mut messages);
            }
        }
        _ => {}
    }

    let mut out = json!({
        "model": model,
        "max_tokens": req
            .get("max_output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_CLAUDE_MAX_TOKENS),
        "messages": messages,
        "stream": stream,
    });

    if !system_parts.is_empty() {
        out["system"] = Value::String(system_parts.join("\n\n"));
    }

    if let Some(tools) = req.get("tools").and_then(|v| v.as_array()) {
        let tools: Vec<Value> = tools.iter().filter_map(translate_codex_tool).collect();
        if !tools.is_empty() {
            out["tools"] = Value::Array(tools);
        }
    }

    if let Some(choice) = req.get("tool_choice").and_then(translate_codex_tool_choice) {
        out["tool_choice"] = choice;
    }

    if let Some(budget) = req
        .pointer("/reasoning/effort")
        .and_then(|v| v.as_str())
        .and_then(budget_for_effort)
    {
        out["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }

    for key in ["temperature", "top_p"] {
        if let Some(v) = req.get(key) {
            out[key] = v.clone();
        }
    }

    out
}

fn translate_input_item(item: &Value, system_parts: &mut Vec<String>, messages: &mut Vec<Value>) {
    let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("message");
    match item_type {
        "message" => {
            let role = item.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let blocks = message_blocks(item.get("content"));
            match role {
                "system" | "developer" => {
                    let text: Vec<&str> = blocks
                        .iter()
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect();
                    if !text.is_empty() {
                        system_parts.push(text.join("\n"));
                    }
                }
                "assistant" => push_blocks(messages, "assistant", blocks),
                _ => push_blocks(messages, "user", blocks),
            }
        }
        "function_call" => {
            let arguments = item.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
            let input: Value =
                serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
            let block = json!({
                "type": "tool_use",
                "id": item.get("call_id").and_then(|v| v.as_str()).unwrap_or_default(),
                "name": item.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
                "input": input,
            });
            push_blocks(messages, "assistant", vec![block]);
        }
        "function_call_output" => {
            let output = match item.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let block = json!({
                "type": "tool_result",
                "tool_use_id": item.get("call_id").and_then(|v| v.as_str()).unwrap_or_default(),
                "content": output,
            });
            push_tool_result(messages, block);
        }
        _ => {}
    }
}

fn message_blocks(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::String(text)) => vec![json!({"type": "text", "text": text})],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                let part_type = part.get("type").and_then(|v| v.as_str()).unwrap_or_default();
                match part_type {
                    "input_text" | "output_text" | "text" => {
                        let text = part.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                        Some(json!({"type": "text", "text": text}))
                    }
                    "input_image" => part
                        .get("image_url")
                        .and_then(|v| v.as_str())
                        .map(image_block_from_url),
                    _ => None,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn image_block_from_url(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            });
        }
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

/// Append blocks to the last message when it has the same role, otherwise
/// start a new message.
fn push_blocks(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if role == "assistant" {
        if let Some(last) = messages.last_mut() {
            if last["role"] == role {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                    return;
                }
            }
        }
    }
    messages.push(json!({"role": role, "content": blocks}));
}

/// Tool results share a user message only with other tool results.
fn push_tool_result(messages: &mut Vec<Value>, block: Value) {
    if let Some(last) = messages.last_mut() {
        if last["role"] == "user" {
            if let Some(content) = last["content"].as_array_mut() {
                if content.last().is_some_and(|b| b["type"] == "tool_result") {
                    content.push(block);
                    return;
                }
            }
        }
    }
    messages.push(json!({"role": "user", "content": [block]}));
}

fn translate_codex_tool(tool: &Value) -> Option<Value> {
    match tool.get("type").and_then(|v| v.as_str()).unwrap_or("function") {
        "function" => {
            let name = tool.get("name").and_then(|v| v.as_str())?;
            let mut out = json!({
                "name": name,
                "input_schema": tool
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            });
            if let Some(desc) = tool.get("description").and_then(|v| v.as_str()) {
                out["description"] = Value::String(desc.to_string());
            }
            Some(out)
        }
        "web_search" | "web_search_preview" => {
            Some(json!({"type": "web_search_20250305", "name": "web_search"}))
        }
        _ => None,
    }
}

fn translate_codex_tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" => Some(json!({"type": "any"})),
            "none" => Some(json!({"type": "none"})),
            _ => None,
        },
        Value::Object(_) => {
            let name = choice.get("name").and_then(|v| v.as_str())?;
            Some(json!({"type": "tool", "name": name}))
        }
        _ => None,
    }
}
