//! State machine for translating Codex Responses SSE events into Messages API
//! SSE events.
//!
//! One [`TranslationState`] is owned by each streaming request. Every upstream
//! line goes through [`TranslationState::translate_line`], which returns the
//! zero or more client events that line produces, in upstream order. Lines
//! that are not `data:` records, or whose `type` is unknown, produce nothing.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use super::claude_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StreamEvent, Usage,
};
use super::codex_types::{CodexEvent, CodexResponse, OutputItem};
use super::request::reverse_name_map;
use super::response::{message_id, stop_reason};
use crate::sse::data_payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

/// A function call whose arguments are still arriving.
#[derive(Debug, Clone)]
struct PendingCall {
    item_id: String,
    call_id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct TranslationState {
    reverse_names: Option<HashMap<String, String>>,
    started: bool,
    finished: bool,
    block_index: usize,
    open_block: Option<BlockKind>,
    pending_calls: Vec<PendingCall>,
    completed_calls: HashSet<String>,
    emitted_tool_use: bool,
    sequence: u64,
}

impl TranslationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of client events emitted so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Translate one raw upstream line. `model` is the model name the client
    /// asked for; `original_request` is the client's untranslated body, used
    /// to restore shortened tool names.
    pub fn translate_line(
        &mut self,
        model: &str,
        original_request: &[u8],
        line: &[u8],
    ) -> Vec<StreamEvent> {
        let Some(payload) = data_payload(line) else {
            return Vec::new();
        };
        if payload.is_empty() || payload == b"[DONE]" {
            return Vec::new();
        }
        let Ok(event) = serde_json::from_slice::<CodexEvent>(payload) else {
            return Vec::new();
        };
        if self.reverse_names.is_none() {
            self.reverse_names = Some(reverse_name_map(original_request));
        }
        self.process_event(model, &event)
    }

    pub fn process_event(&mut self, model: &str, event: &CodexEvent) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        match event.event_type.as_str() {
            "response.created" => {
                if !self.started {
                    self.started = true;
                    events.push(message_start(model, event.response.as_ref()));
                }
            }
            "response.content_part.added" => {
                self.close_block(&mut events);
                self.open_block(BlockKind::Text, &mut events);
            }
            "response.output_text.delta" | "response.refusal.delta" => {
                let text = event.delta.clone().unwrap_or_default();
                self.ensure_block(BlockKind::Text, &mut events);
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: Delta::TextDelta { text },
                });
            }
            "response.content_part.done" => {
                if self.open_block == Some(BlockKind::Text) {
                    self.close_block(&mut events);
                }
            }
            "response.reasoning_summary_part.added" => {
                self.close_block(&mut events);
                self.open_block(BlockKind::Thinking, &mut events);
            }
            "response.reasoning_summary_text.delta" => {
                let thinking = event.delta.clone().unwrap_or_default();
                self.ensure_block(BlockKind::Thinking, &mut events);
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: Delta::ThinkingDelta { thinking },
                });
            }
            "response.reasoning_summary_part.done" => {
                if self.open_block == Some(BlockKind::Thinking) {
                    self.close_block(&mut events);
                }
            }
            "response.output_item.added" => {
                if let Some(OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                }) = &event.item
                {
                    let item_id = id
                        .clone()
                        .or_else(|| event.item_id.clone())
                        .unwrap_or_else(|| call_id.clone());
                    self.register_call(item_id, call_id, name, arguments);
                }
            }
            "response.function_call_arguments.delta" => {
                let delta = event.delta.as_deref().unwrap_or_default();
                if let Some(call) = self.find_call_mut(event.item_id.as_deref()) {
                    call.arguments.push_str(delta);
                }
            }
            "response.function_call_arguments.done" => {
                if let Some(call) = self.find_call_mut(event.item_id.as_deref()) {
                    if let Some(arguments) = &event.arguments {
                        call.arguments = arguments.clone();
                    }
                    let item_id = call.item_id.clone();
                    self.complete_call(&item_id, &mut events);
                }
            }
            "response.output_item.done" => match &event.item {
                Some(OutputItem::Reasoning {
                    encrypted_content, ..
                }) => {
                    if self.open_block == Some(BlockKind::Thinking) {
                        if let Some(signature) = encrypted_content.clone().filter(|s| !s.is_empty()) {
                            events.push(StreamEvent::ContentBlockDelta {
                                index: self.block_index,
                                delta: Delta::SignatureDelta { signature },
                            });
                        }
                        self.close_block(&mut events);
                    }
                }
                Some(OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                }) => {
                    let item_id = id
                        .clone()
                        .or_else(|| event.item_id.clone())
                        .unwrap_or_else(|| call_id.clone());
                    if !self.completed_calls.contains(&item_id) {
                        match self.pending_calls.iter_mut().find(|c| c.item_id == item_id) {
                            Some(call) if !arguments.is_empty() => {
                                call.arguments = arguments.clone();
                            }
                            Some(_) => {}
                            None => self.register_call(item_id.clone(), call_id, name, arguments),
                        }
                        self.complete_call(&item_id, &mut events);
                    }
                }
                _ => {}
            },
            "response.completed" | "response.incomplete" => {
                self.flush_calls(&mut events);
                // Upstream closes its own parts; the state only forgets them.
                self.open_block = None;
                events.extend(self.finish(event.response.as_ref()));
            }
            "response.failed" => {
                let message = event
                    .response
                    .as_ref()
                    .and_then(|r| r.error.as_ref())
                    .and_then(|e| e.describe())
                    .unwrap_or_else(|| "response failed".to_string());
                self.finished = true;
                events.push(StreamEvent::Error { message });
            }
            "error" => {
                let message = event
                    .message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .or_else(|| event.error.as_ref().and_then(|e| e.describe()))
                    .or_else(|| event.code.clone())
                    .unwrap_or_else(|| "upstream error".to_string());
                self.finished = true;
                events.push(StreamEvent::Error { message });
            }
            _ => {}
        }

        self.sequence += events.len() as u64;
        events
    }

    fn open_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) {
        let content_block = match kind {
            BlockKind::Text => ResponseContentBlock::Text {
                text: String::new(),
            },
            BlockKind::Thinking => ResponseContentBlock::Thinking {
                thinking: String::new(),
                signature: String::new(),
            },
        };
        events.push(StreamEvent::ContentBlockStart {
            index: self.block_index,
            content_block,
        });
        self.open_block = Some(kind);
    }

    fn ensure_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) {
        if self.open_block != Some(kind) {
            self.close_block(events);
            self.open_block(kind, events);
        }
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open_block.take().is_some() {
            events.push(StreamEvent::ContentBlockStop {
                index: self.block_index,
            });
            self.block_index += 1;
        }
    }

    fn register_call(&mut self, item_id: String, call_id: &str, name: &str, arguments: &str) {
        if self.completed_calls.contains(&item_id)
            || self.pending_calls.iter().any(|c| c.item_id == item_id)
        {
            return;
        }
        let name = self
            .reverse_names
            .as_ref()
            .and_then(|m| m.get(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.pending_calls.push(PendingCall {
            item_id,
            call_id: call_id.to_string(),
            name,
            arguments: arguments.to_string(),
        });
    }

    fn find_call_mut(&mut self, item_id: Option<&str>) -> Option<&mut PendingCall> {
        let position = item_id
            .and_then(|id| self.pending_calls.iter().position(|c| c.item_id == id))
            .or_else(|| self.pending_calls.len().checked_sub(1))?;
        self.pending_calls.get_mut(position)
    }

    fn complete_call(&mut self, item_id: &str, events: &mut Vec<StreamEvent>) {
        let Some(position) = self.pending_calls.iter().position(|c| c.item_id == item_id) else {
            return;
        };
        let call = self.pending_calls.remove(position);
        self.emit_tool_use(call, events);
    }

    fn flush_calls(&mut self, events: &mut Vec<StreamEvent>) {
        for call in std::mem::take(&mut self.pending_calls) {
            self.emit_tool_use(call, events);
        }
    }

    fn emit_tool_use(&mut self, call: PendingCall, events: &mut Vec<StreamEvent>) {
        if !self.completed_calls.insert(call.item_id.clone()) {
            return;
        }
        self.close_block(events);
        let index = self.block_index;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::ToolUse {
                id: call.call_id,
                name: call.name,
                input: Value::Object(Map::new()),
            },
        });
        if !call.arguments.is_empty() {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta {
                    partial_json: call.arguments,
                },
            });
        }
        events.push(StreamEvent::ContentBlockStop { index });
        self.block_index += 1;
        self.emitted_tool_use = true;
    }

    fn finish(&mut self, response: Option<&CodexResponse>) -> Vec<StreamEvent> {
        self.finished = true;
        let usage = response.and_then(|r| r.usage.as_ref());
        vec![
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(stop_reason(response, self.emitted_tool_use).to_string()),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    input_tokens: usage.map_or(0, |u| u.input_tokens),
                    output_tokens: usage.map_or(0, |u| u.output_tokens),
                    cache_read_input_tokens: usage.and_then(|u| u.cached_tokens()),
                },
            },
            StreamEvent::MessageStop,
        ]
    }
}

fn message_start(model: &str, response: Option<&CodexResponse>) -> StreamEvent {
    StreamEvent::MessageStart {
        message: MessagesResponse {
            id: message_id(response.and_then(|r| r.id.as_deref())),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model: model.to_string(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(value: Value) -> Vec<u8> {
        format!("data: {value}").into_bytes()
    }

    fn run(state: &mut TranslationState, original: &[u8], values: Vec<Value>) -> Vec<StreamEvent> {
        values
            .into_iter()
            .flat_map(|v| state.translate_line("claude-sonnet-4-5", original, &line(v)))
            .collect()
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_name()).collect()
    }

    fn completed(usage: Value) -> Value {
        json!({"type": "response.completed", "response": {"id": "resp_1", "status": "completed", "usage": usage}})
    }

    #[test]
    fn test_simple_text_stream_order() {
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            b"{}",
            vec![
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
                json!({"type": "response.content_part.added", "part": {"type": "output_text"}}),
                json!({"type": "response.output_text.delta", "delta": "Hello"}),
                completed(json!({"input_tokens": 7, "output_tokens": 1})),
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "message_delta",
                "message_stop"
            ]
        );
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.id, "resp_1");
                assert_eq!(message.model, "claude-sonnet-4-5");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[2] {
            StreamEvent::ContentBlockDelta { index, delta } => {
                assert_eq!(*index, 0);
                assert_eq!(delta, &Delta::TextDelta { text: "Hello".into() });
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[3] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.output_tokens, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.sequence(), 5);
        assert!(state.is_finished());
    }

    #[test]
    fn test_thinking_then_text() {
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            b"{}",
            vec![
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
                json!({"type": "response.reasoning_summary_part.added"}),
                json!({"type": "response.reasoning_summary_text.delta", "delta": "Let me think"}),
                json!({"type": "response.reasoning_summary_part.done"}),
                json!({"type": "response.content_part.added", "part": {"type": "output_text"}}),
                json!({"type": "response.output_text.delta", "delta": "Answer"}),
                json!({"type": "response.content_part.done"}),
                completed(json!({"input_tokens": 1, "output_tokens": 2})),
            ],
        );
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(matches!(
            &events[2],
            StreamEvent::ContentBlockDelta { index: 0, delta: Delta::ThinkingDelta { thinking } } if thinking == "Let me think"
        ));
        assert!(matches!(&events[5], StreamEvent::ContentBlockDelta { index: 1, .. }));
    }

    #[test]
    fn test_reasoning_signature_attached_to_open_thinking_block() {
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            b"{}",
            vec![
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
                json!({"type": "response.output_item.added", "item": {"type": "reasoning", "id": "rs_1"}}),
                json!({"type": "response.reasoning_summary_part.added", "item_id": "rs_1"}),
                json!({"type": "response.reasoning_summary_text.delta", "item_id": "rs_1", "delta": "Hmm"}),
                json!({"type": "response.output_item.done", "item": {"type": "reasoning", "id": "rs_1",
                       "summary": [{"type": "summary_text", "text": "Hmm"}], "encrypted_content": "enc-sig"}}),
                json!({"type": "response.content_part.added", "part": {"type": "output_text"}}),
                json!({"type": "response.output_text.delta", "delta": "Answer"}),
                completed(json!({"input_tokens": 1, "output_tokens": 2})),
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(matches!(
            &events[3],
            StreamEvent::ContentBlockDelta { index: 0, delta: Delta::SignatureDelta { signature } } if signature == "enc-sig"
        ));
        assert!(matches!(&events[6], StreamEvent::ContentBlockDelta { index: 1, .. }));
    }

    #[test]
    fn test_reasoning_item_done_after_part_done_adds_nothing() {
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            b"{}",
            vec![
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
                json!({"type": "response.reasoning_summary_part.added", "item_id": "rs_1"}),
                json!({"type": "response.reasoning_summary_text.delta", "item_id": "rs_1", "delta": "Hmm"}),
                json!({"type": "response.reasoning_summary_part.done", "item_id": "rs_1"}),
                json!({"type": "response.output_item.done", "item": {"type": "reasoning", "id": "rs_1",
                       "encrypted_content": "enc-sig"}}),
            ],
        );
        assert_eq!(
            names(&events),
            vec!["message_start", "content_block_start", "content_block_delta", "content_block_stop"]
        );
    }

    #[test]
    fn test_tool_call_accumulates_arguments() {
        let long = format!("mcp__filesystem_{}__read_file", "z".repeat(60));
        let original = json!({"tools": [{"name": long}]}).to_string();
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            original.as_bytes(),
            vec![
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
                json!({"type": "response.output_item.added", "output_index": 0,
                       "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1",
                                "name": "mcp__read_file", "arguments": ""}}),
                json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"path\":"}),
                json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "\"/tmp\"}"}),
                json!({"type": "response.function_call_arguments.done", "item_id": "fc_1"}),
                json!({"type": "response.output_item.done", "output_index": 0,
                       "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1",
                                "name": "mcp__read_file", "arguments": "{\"path\":\"/tmp\"}"}}),
                completed(json!({"input_tokens": 3, "output_tokens": 4})),
            ],
        );
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        match &events[1] {
            StreamEvent::ContentBlockStart {
                content_block: ResponseContentBlock::ToolUse { id, name, .. },
                ..
            } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, &long);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            &events[2],
            StreamEvent::ContentBlockDelta { delta: Delta::InputJsonDelta { partial_json }, .. }
                if partial_json == "{\"path\":\"/tmp\"}"
        ));
        assert!(matches!(
            &events[4],
            StreamEvent::MessageDelta { delta, .. } if delta.stop_reason.as_deref() == Some("tool_use")
        ));
    }

    #[test]
    fn test_pending_call_flushed_on_completion() {
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            b"{}",
            vec![
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
                json!({"type": "response.output_item.added",
                       "item": {"type": "function_call", "id": "fc_9", "call_id": "call_9", "name": "ls"}}),
                json!({"type": "response.function_call_arguments.delta", "delta": "{}"}),
                completed(json!({"input_tokens": 1, "output_tokens": 1})),
            ],
        );
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }

    #[test]
    fn test_unknown_and_non_data_lines_are_dropped() {
        let mut state = TranslationState::new();
        assert!(state.translate_line("m", b"", b"event: response.created").is_empty());
        assert!(state.translate_line("m", b"", b"").is_empty());
        assert!(state.translate_line("m", b"", b"data: not json").is_empty());
        assert!(state
            .translate_line("m", b"", &line(json!({"type": "response.in_progress"})))
            .is_empty());
        assert_eq!(state.sequence(), 0);
    }

    #[test]
    fn test_error_event() {
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            b"{}",
            vec![
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
                json!({"type": "error", "code": "rate_limit_exceeded", "message": "Slow down"}),
                json!({"type": "response.output_text.delta", "delta": "late"}),
            ],
        );
        assert_eq!(names(&events), vec!["message_start", "error"]);
        assert!(matches!(&events[1], StreamEvent::Error { message } if message == "Slow down"));
    }

    #[test]
    fn test_incomplete_maps_to_max_tokens() {
        let mut state = TranslationState::new();
        let events = run(
            &mut state,
            b"{}",
            vec![json!({"type": "response.incomplete", "response": {
                "id": "resp_1",
                "incomplete_details": {"reason": "max_output_tokens"},
                "usage": {"input_tokens": 5, "output_tokens": 9, "input_tokens_details": {"cached_tokens": 2}}
            }})],
        );
        match &events[0] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("max_tokens"));
                assert_eq!(usage.cache_read_input_tokens, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
