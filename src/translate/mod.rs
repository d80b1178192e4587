//! Wire translation between the Claude Messages API and the OpenAI Responses
//! (Codex) API.
//!
//! Requests, complete responses and streaming events are converted here. All
//! translation functions are pure (no I/O); streaming translation carries a
//! per-request [`TranslationState`].

pub mod claude_types;
pub mod codex_types;
pub mod request;
pub mod response;
pub mod streaming;

use std::fmt;

use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};
use crate::sse::data_payload;
use claude_types::{ErrorPayload, MessagesRequest, StreamEvent};
pub use streaming::TranslationState;

/// A wire schema spoken by one side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Claude,
    Codex,
}

impl Format {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(Format::Claude),
            "codex" | "openai-response" | "openai_response" | "openai-responses"
            | "openai_responses" => Some(Format::Codex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Claude => "claude",
            Format::Codex => "codex",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Translate a request body from `from` to `to`. Same-format translation
/// returns the payload untouched.
pub fn translate_request(
    from: Format,
    to: Format,
    model: &str,
    payload: &[u8],
    stream: bool,
) -> Result<Vec<u8>> {
    match (from, to) {
        (Format::Claude, Format::Codex) => {
            let req: MessagesRequest = serde_json::from_slice(payload)
                .map_err(|e| BridgeError::translation(format!("invalid Messages request: {e}")))?;
            Ok(serde_json::to_vec(&request::claude_to_codex(&req, model, stream))?)
        }
        (Format::Codex, Format::Claude) => {
            let req: Value = serde_json::from_slice(payload)
                .map_err(|e| BridgeError::translation(format!("invalid Responses request: {e}")))?;
            Ok(serde_json::to_vec(&request::codex_to_claude(&req, model, stream))?)
        }
        _ => Ok(payload.to_vec()),
    }
}

/// Translate the terminal upstream event of a non-streaming call into the
/// client's wire format. `client` is the format the caller speaks.
pub fn translate_non_stream(
    upstream: Format,
    client: Format,
    model: &str,
    original_request: &[u8],
    body: &[u8],
) -> Vec<u8> {
    match (upstream, client) {
        (Format::Codex, Format::Claude) => {
            response::translate_non_stream(model, original_request, body)
        }
        _ => codex_passthrough_body(body),
    }
}

/// Translate one upstream SSE line into zero or more client SSE records.
pub fn translate_stream(
    upstream: Format,
    client: Format,
    model: &str,
    original_request: &[u8],
    line: &[u8],
    state: &mut TranslationState,
) -> Vec<Bytes> {
    match (upstream, client) {
        (Format::Codex, Format::Claude) => state
            .translate_line(model, original_request, line)
            .iter()
            .filter_map(StreamEvent::to_sse)
            .map(Bytes::from)
            .collect(),
        _ => {
            let mut record = Vec::with_capacity(line.len() + 1);
            record.extend_from_slice(line);
            record.push(b'\n');
            vec![Bytes::from(record)]
        }
    }
}

/// One-shot error body in the client's format.
pub fn error_body(client: Format, message: &str) -> Vec<u8> {
    match client {
        Format::Claude => ErrorPayload::new(message).to_bytes(),
        Format::Codex => codex_error_body(message),
    }
}

/// A complete SSE error record. Both formats use the same
/// `event: error` framing.
pub fn error_event(message: &str) -> Bytes {
    let data = ErrorPayload::new(message).to_bytes();
    let mut record = b"event: error\ndata: ".to_vec();
    record.extend_from_slice(&data);
    record.extend_from_slice(b"\n\n");
    Bytes::from(record)
}

/// `count_tokens` response body in the client's format.
pub fn token_count_body(count: i64) -> Vec<u8> {
    json!({ "input_tokens": count }).to_string().into_bytes()
}

fn codex_error_body(message: &str) -> Vec<u8> {
    json!({"error": {"type": "upstream_error", "message": message}})
        .to_string()
        .into_bytes()
}

/// Codex callers get the `response` object of the terminal event back.
fn codex_passthrough_body(body: &[u8]) -> Vec<u8> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        let text = String::from_utf8_lossy(body).trim().to_string();
        return codex_error_body(if text.is_empty() {
            response::DISCONNECTED_MESSAGE
        } else {
            &text
        });
    };
    if let Some(message) = response::upstream_error_message(body).filter(|_| is_error_shape(&value))
    {
        return codex_error_body(&message);
    }
    match value.get("response") {
        Some(resp) if resp.is_object() => resp.to_string().into_bytes(),
        _ => codex_error_body(response::DISCONNECTED_MESSAGE),
    }
}

fn is_error_shape(value: &Value) -> bool {
    matches!(
        value.get("type").and_then(|t| t.as_str()),
        Some("error") | Some("response.failed")
    ) || value.get("error").is_some_and(|e| e.is_object())
}

/// The JSON payload of a terminal upstream line (`response.completed` or
/// `response.incomplete`), if `line` is one.
pub fn terminal_payload(line: &[u8]) -> Option<&[u8]> {
    let payload = data_payload(line)?;
    let value: Value = serde_json::from_slice(payload).ok()?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some("response.completed") | Some("response.incomplete") => Some(payload),
        _ => None,
    }
}
