//! Type definitions for the OpenAI Responses API as spoken by the Codex
//! backend: the request body we send and the SSE events it streams back.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub instructions: String,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<CodexTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<CodexToolChoice>,
    pub parallel_tool_calls: bool,
    pub reasoning: Reasoning,
    pub store: bool,
    pub stream: bool,
    pub include: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: String,
        content: Vec<InputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputContent {
    InputText { text: String },
    OutputText { text: String },
    InputImage { image_url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodexTool {
    Function {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        parameters: serde_json::Value,
        strict: bool,
    },
    WebSearch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodexToolChoice {
    Mode(String), // "auto", "required", "none"
    Function(CodexToolChoiceFunction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexToolChoiceFunction {
    #[serde(rename = "type")]
    pub choice_type: String, // "function"
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reasoning {
    pub effort: String,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Response / stream types
// ---------------------------------------------------------------------------

/// One upstream SSE payload. Only the fields the translator reads are
/// modelled; everything is optional so unfamiliar events still parse.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub response: Option<CodexResponse>,
    #[serde(default)]
    pub item: Option<OutputItem>,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub output_index: Option<i64>,
    #[serde(default)]
    pub part: Option<EventPart>,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<CodexError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPart {
    #[serde(rename = "type", default)]
    pub part_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default)]
    pub usage: Option<ResponseUsage>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub error: Option<CodexError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: String,
    },
    Reasoning {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        summary: Vec<SummaryPart>,
        #[serde(default)]
        encrypted_content: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
    OutputText {
        #[serde(default)]
        text: String,
    },
    Refusal {
        #[serde(default)]
        refusal: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryPart {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub input_tokens_details: Option<InputTokensDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ResponseUsage {
    pub fn cached_tokens(&self) -> Option<u64> {
        self.input_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .filter(|n| *n > 0)
    }
}

impl CodexError {
    pub fn describe(&self) -> Option<String> {
        self.message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.code.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = ResponsesRequest {
            model: "gpt-5".into(),
            instructions: String::new(),
            input: vec![
                InputItem::Message {
                    role: "user".into(),
                    content: vec![InputContent::InputText { text: "hi".into() }],
                },
                InputItem::FunctionCallOutput {
                    call_id: "call_1".into(),
                    output: "ok".into(),
                },
            ],
            tools: Some(vec![CodexTool::WebSearch]),
            tool_choice: Some(CodexToolChoice::Mode("auto".into())),
            parallel_tool_calls: true,
            reasoning: Reasoning {
                effort: "medium".into(),
                summary: "auto".into(),
            },
            store: false,
            stream: true,
            include: vec!["reasoning.encrypted_content".into()],
            max_output_tokens: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["input"][0]["type"], "message");
        assert_eq!(json["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(json["input"][1]["type"], "function_call_output");
        assert_eq!(json["tools"][0], serde_json::json!({"type": "web_search"}));
        assert_eq!(json["tool_choice"], "auto");
        assert!(json.get("max_output_tokens").is_none());
    }

    #[test]
    fn test_unknown_output_items_parse() {
        let event: CodexEvent = serde_json::from_str(
            r#"{"type":"response.output_item.added","output_index":2,
                "item":{"type":"web_search_call","id":"ws_1","status":"in_progress"}}"#,
        )
        .unwrap();
        assert!(matches!(event.item, Some(OutputItem::Other)));
    }
}
