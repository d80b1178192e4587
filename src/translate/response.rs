use std::collections::HashMap;

use serde_json::Value;

use super::claude_types::{ErrorPayload, MessagesResponse, ResponseContentBlock, Usage};
use super::codex_types::{CodexEvent, CodexResponse, OutputContent, OutputItem};
use super::request::reverse_name_map;

pub const DISCONNECTED_MESSAGE: &str = "stream disconnected before completion";

/// Translate one complete upstream JSON object into a Messages API body.
///
/// `body` is normally the payload of the terminal `response.completed`
/// event. Error-shaped or non-terminal bodies become
/// `{"type":"error","message":...}`.
pub fn translate_non_stream(model: &str, original_request: &[u8], body: &[u8]) -> Vec<u8> {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => {
            let text = String::from_utf8_lossy(body).trim().to_string();
            let message = if text.is_empty() {
                DISCONNECTED_MESSAGE.to_string()
            } else {
                text
            };
            return ErrorPayload::new(message).to_bytes();
        }
    };

    if let Some(message) = error_in_value(&value) {
        return ErrorPayload::new(message).to_bytes();
    }

    match value.get("type").and_then(|t| t.as_str()) {
        Some("response.completed") | Some("response.incomplete") => {}
        _ => return ErrorPayload::new(DISCONNECTED_MESSAGE).to_bytes(),
    }

    let event: CodexEvent = match serde_json::from_value(value) {
        Ok(e) => e,
        Err(_) => return ErrorPayload::new(DISCONNECTED_MESSAGE).to_bytes(),
    };
    let Some(response) = event.response else {
        return ErrorPayload::new(DISCONNECTED_MESSAGE).to_bytes();
    };

    let reverse = reverse_name_map(original_request);
    let message = codex_to_claude(&response, model, &reverse);
    serde_json::to_vec(&message)
        .unwrap_or_else(|_| ErrorPayload::new(DISCONNECTED_MESSAGE).to_bytes())
}

/// Translate a finished Responses API object into a Messages API response.
/// `original_model` is what the client asked for.
pub fn codex_to_claude(
    resp: &CodexResponse,
    original_model: &str,
    reverse_names: &HashMap<String, String>,
) -> MessagesResponse {
    let mut content: Vec<ResponseContentBlock> = Vec::new();
    let mut saw_tool_use = false;

    for item in &resp.output {
        match item {
            OutputItem::Reasoning {
                summary,
                encrypted_content,
                ..
            } => {
                let thinking = summary
                    .iter()
                    .map(|s| s.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                if !thinking.is_empty() {
                    content.push(ResponseContentBlock::Thinking {
                        thinking,
                        signature: encrypted_content.clone().unwrap_or_default(),
                    });
                }
            }
            OutputItem::Message { content: parts, .. } => {
                for part in parts {
                    let text = match part {
                        OutputContent::OutputText { text } => text,
                        OutputContent::Refusal { refusal } => refusal,
                        OutputContent::Other => continue,
                    };
                    content.push(ResponseContentBlock::Text { text: text.clone() });
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                let input: Value = serde_json::from_str(arguments)
                    .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
                content.push(ResponseContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: reverse_names.get(name).cloned().unwrap_or_else(|| name.clone()),
                    input,
                });
                saw_tool_use = true;
            }
            OutputItem::Other => {}
        }
    }

    // Clients expect at least one block
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.input_tokens,
        output_tokens: u.output_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: u.cached_tokens(),
    });

    MessagesResponse {
        id: message_id(resp.id.as_deref()),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: original_model.to_string(),
        stop_reason: Some(stop_reason(Some(resp), saw_tool_use).to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Map the end state of a response to a Messages API `stop_reason`.
pub fn stop_reason(resp: Option<&CodexResponse>, saw_tool_use: bool) -> &'static str {
    if saw_tool_use {
        return "tool_use";
    }
    let reason = resp
        .and_then(|r| r.incomplete_details.as_ref())
        .and_then(|d| d.reason.as_deref());
    match reason {
        Some("max_output_tokens") => "max_tokens",
        _ => "end_turn",
    }
}

/// The upstream response id, or a fresh `msg_` id when there is none.
pub fn message_id(upstream_id: Option<&str>) -> String {
    match upstream_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("msg_{}", uuid::Uuid::new_v4().simple()),
    }
}

/// Extract a human readable message from an error-shaped upstream body.
/// Falls back to the trimmed raw text for non-JSON bodies; `None` for empty
/// bodies.
pub fn upstream_error_message(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(message) = error_in_value(&value) {
            return Some(message);
        }
        if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
            return Some(detail.to_string());
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn error_in_value(value: &Value) -> Option<String> {
    let non_empty = |v: Option<&Value>| {
        v.and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("error") => {
            return non_empty(value.get("message"))
                .or_else(|| non_empty(value.pointer("/error/message")))
                .or_else(|| Some("upstream error".to_string()));
        }
        Some("response.failed") => {
            return non_empty(value.pointer("/response/error/message"))
                .or_else(|| non_empty(value.pointer("/response/error/code")))
                .or_else(|| Some("response failed".to_string()));
        }
        _ => {}
    }

    if value.get("error").is_some_and(|e| e.is_object()) {
        return non_empty(value.pointer("/error/message"))
            .or_else(|| non_empty(value.pointer("/error/code")))
            .or_else(|| non_empty(value.pointer("/error/type")));
    }
    None
}
