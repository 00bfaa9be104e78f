//! OpenAI Responses streaming transcode.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::protocol::canonical::{ChatRole, StopReason, StreamEvent, Usage};
use crate::stream::sse::{named_frame, DONE_FRAME};
use crate::stream::SseEvent;

// ---------------------------------------------------------------------------
// Decode: provider events -> canonical events
// ---------------------------------------------------------------------------

/// Incremental decoder for an OpenAI Responses provider stream.
#[derive(Debug, Default)]
pub struct ResponsesStreamDecoder {
    message_started: bool,
    saw_tool_calls: bool,
    finished: bool,
}

impl ResponsesStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one SSE frame into zero or more canonical events.
    pub fn decode(&mut self, frame: &SseEvent, out: &mut Vec<StreamEvent>) {
        if frame.is_done() {
            if !self.finished {
                self.finished = true;
                out.push(StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndOfTurn,
                });
            }
            out.push(StreamEvent::Done);
            return;
        }

        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            return;
        };
        let event_name = frame
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default();

        match event_name {
            "response.created" => {
                if !self.message_started {
                    self.message_started = true;
                    let model = data
                        .get("response")
                        .and_then(|r| r.get("model"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    out.push(StreamEvent::MessageStart {
                        role: ChatRole::Assistant,
                        model,
                    });
                }
            }
            "response.output_text.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    out.push(StreamEvent::TextDelta(delta.to_string()));
                }
            }
            "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    out.push(StreamEvent::ReasoningDelta(delta.to_string()));
                }
            }
            "response.output_item.added" => {
                let Some(item) = data.get("item") else {
                    return;
                };
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    let index =
                        data.get("output_index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    self.saw_tool_calls = true;
                    out.push(StreamEvent::ToolCallStart {
                        index,
                        id: item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    let index =
                        data.get("output_index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    out.push(StreamEvent::ToolCallArgsDelta {
                        index,
                        delta: delta.to_string(),
                    });
                }
            }
            "response.output_item.done" => {
                if let Some(item) = data.get("item") {
                    if item.get("type").and_then(Value::as_str) == Some("function_call") {
                        let index =
                            data.get("output_index").and_then(Value::as_u64).unwrap_or(0) as usize;
                        out.push(StreamEvent::ToolCallEnd { index });
                    }
                }
            }
            "response.completed" | "response.incomplete" => {
                if let Some(usage) = data.get("response").and_then(|r| r.get("usage")) {
                    out.push(StreamEvent::Usage(Usage {
                        input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
                        output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
                        total_tokens: usage.get("total_tokens").and_then(Value::as_u64),
                    }));
                }
                self.finished = true;
                let stop_reason = if self.saw_tool_calls {
                    StopReason::ToolCalls
                } else if event_name == "response.incomplete" {
                    StopReason::MaxTokens
                } else {
                    StopReason::EndOfTurn
                };
                out.push(StreamEvent::MessageEnd { stop_reason });
                out.push(StreamEvent::Done);
            }
            "response.failed" | "error" => {
                let message = data
                    .get("response")
                    .and_then(|r| r.get("error"))
                    .or_else(|| data.get("error"))
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("provider stream error")
                    .to_string();
                out.push(StreamEvent::Error {
                    status: 502,
                    message,
                });
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Encode: canonical events -> client SSE frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenItem {
    None,
    Message,
    Reasoning,
}

/// Stateful encoder producing the Responses client event sequence, ending in
/// a `response.completed` snapshot and the `[DONE]` sentinel.
#[derive(Debug)]
pub struct ResponsesStreamEncoder {
    response_id: String,
    model: String,
    next_output_index: usize,
    open_item: OpenItem,
    open_item_index: usize,
    text_accum: String,
    reasoning_accum: String,
    tool_output_indices: FxHashMap<usize, usize>,
    /// Canonical tool index -> position in `tool_calls`.
    tool_positions: FxHashMap<usize, usize>,
    tool_calls: Vec<(String, String, String)>,
    usage: Option<Usage>,
}

impl ResponsesStreamEncoder {
    #[must_use]
    pub fn new(response_id: String, model: String) -> Self {
        Self {
            response_id,
            model,
            next_output_index: 0,
            open_item: OpenItem::None,
            open_item_index: 0,
            text_accum: String::new(),
            reasoning_accum: String::new(),
            tool_output_indices: FxHashMap::default(),
            tool_positions: FxHashMap::default(),
            tool_calls: Vec::new(),
            usage: None,
        }
    }

    /// Encode one canonical event into zero or more SSE wire strings.
    pub fn encode(&mut self, event: &StreamEvent, out: &mut Vec<String>) {
        match event {
            StreamEvent::MessageStart { model, .. } => {
                if !model.is_empty() {
                    self.model.clone_from(model);
                }
                let body = serde_json::json!({
                    "type": "response.created",
                    "response": {
                        "id": self.response_id,
                        "object": "response",
                        "status": "in_progress",
                        "model": self.model,
                        "output": [],
                    },
                });
                out.push(named_frame("response.created", &body.to_string()));
            }
            StreamEvent::TextDelta(text) => {
                self.ensure_item(OpenItem::Message, out);
                self.text_accum.push_str(text);
                let body = serde_json::json!({
                    "type": "response.output_text.delta",
                    "item_id": format!("msg_{}", self.response_id),
                    "output_index": self.open_item_index,
                    "delta": text,
                });
                out.push(named_frame("response.output_text.delta", &body.to_string()));
            }
            StreamEvent::ReasoningDelta(text) => {
                self.ensure_item(OpenItem::Reasoning, out);
                self.reasoning_accum.push_str(text);
                let body = serde_json::json!({
                    "type": "response.reasoning_text.delta",
                    "item_id": format!("rs_{}", self.response_id),
                    "output_index": self.open_item_index,
                    "delta": text,
                });
                out.push(named_frame(
                    "response.reasoning_text.delta",
                    &body.to_string(),
                ));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.close_open_item(out);
                let output_index = self.next_output_index;
                self.next_output_index += 1;
                self.tool_output_indices.insert(*index, output_index);
                self.tool_positions.insert(*index, self.tool_calls.len());
                self.tool_calls
                    .push((id.clone(), name.clone(), String::new()));
                let body = serde_json::json!({
                    "type": "response.output_item.added",
                    "output_index": output_index,
                    "item": {
                        "type": "function_call",
                        "id": format!("fc_{id}"),
                        "call_id": id,
                        "name": name,
                        "arguments": "",
                        "status": "in_progress",
                    },
                });
                out.push(named_frame("response.output_item.added", &body.to_string()));
            }
            StreamEvent::ToolCallArgsDelta { index, delta } => {
                let Some(output_index) = self.tool_output_indices.get(index).copied() else {
                    return;
                };
                if let Some(position) = self.tool_positions.get(index).copied() {
                    if let Some(call) = self.tool_calls.get_mut(position) {
                        call.2.push_str(delta);
                    }
                }
                let body = serde_json::json!({
                    "type": "response.function_call_arguments.delta",
                    "output_index": output_index,
                    "delta": delta,
                });
                out.push(named_frame(
                    "response.function_call_arguments.delta",
                    &body.to_string(),
                ));
            }
            StreamEvent::ToolCallEnd { index } => {
                let Some(output_index) = self.tool_output_indices.get(index).copied() else {
                    return;
                };
                let (id, name, arguments) = self
                    .tool_positions
                    .get(index)
                    .and_then(|position| self.tool_calls.get(*position))
                    .cloned()
                    .unwrap_or_default();
                let body = serde_json::json!({
                    "type": "response.output_item.done",
                    "output_index": output_index,
                    "item": {
                        "type": "function_call",
                        "id": format!("fc_{id}"),
                        "call_id": id,
                        "name": name,
                        "arguments": arguments,
                        "status": "completed",
                    },
                });
                out.push(named_frame("response.output_item.done", &body.to_string()));
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(*usage);
            }
            StreamEvent::MessageEnd { stop_reason } => {
                self.close_open_item(out);
                let body = serde_json::json!({
                    "type": "response.completed",
                    "response": self.response_snapshot(*stop_reason),
                });
                out.push(named_frame("response.completed", &body.to_string()));
            }
            StreamEvent::Done => {
                out.push(DONE_FRAME.to_string());
            }
            StreamEvent::Error { status, message } => {
                let body = serde_json::json!({
                    "type": "error",
                    "error": {"code": "upstream_error", "message": message, "status": status},
                });
                out.push(named_frame("error", &body.to_string()));
                out.push(DONE_FRAME.to_string());
            }
        }
    }

    fn ensure_item(&mut self, kind: OpenItem, out: &mut Vec<String>) {
        if self.open_item == kind {
            return;
        }
        self.close_open_item(out);
        let output_index = self.next_output_index;
        self.next_output_index += 1;
        let item = match kind {
            OpenItem::Message => serde_json::json!({
                "type": "message",
                "id": format!("msg_{}", self.response_id),
                "role": "assistant",
                "status": "in_progress",
                "content": [],
            }),
            OpenItem::Reasoning => serde_json::json!({
                "type": "reasoning",
                "id": format!("rs_{}", self.response_id),
                "content": [],
            }),
            OpenItem::None => return,
        };
        let body = serde_json::json!({
            "type": "response.output_item.added",
            "output_index": output_index,
            "item": item,
        });
        out.push(named_frame("response.output_item.added", &body.to_string()));
        self.open_item = kind;
        self.open_item_index = output_index;
    }

    fn close_open_item(&mut self, out: &mut Vec<String>) {
        match self.open_item {
            OpenItem::None => {}
            OpenItem::Message => {
                let body = serde_json::json!({
                    "type": "response.output_text.done",
                    "item_id": format!("msg_{}", self.response_id),
                    "text": self.text_accum,
                });
                out.push(named_frame("response.output_text.done", &body.to_string()));
            }
            OpenItem::Reasoning => {}
        }
        self.open_item = OpenItem::None;
    }

    fn response_snapshot(&self, stop_reason: StopReason) -> Value {
        let mut output: Vec<Value> = Vec::new();
        if !self.reasoning_accum.is_empty() {
            output.push(serde_json::json!({
                "type": "reasoning",
                "id": format!("rs_{}", self.response_id),
                "content": [{"type": "reasoning_text", "text": self.reasoning_accum}],
            }));
        }
        for (id, name, arguments) in &self.tool_calls {
            output.push(serde_json::json!({
                "type": "function_call",
                "id": format!("fc_{id}"),
                "call_id": id,
                "name": name,
                "arguments": arguments,
                "status": "completed",
            }));
        }
        if !self.text_accum.is_empty() {
            output.push(serde_json::json!({
                "type": "message",
                "id": format!("msg_{}", self.response_id),
                "role": "assistant",
                "status": "completed",
                "content": [{"type": "output_text", "text": self.text_accum, "annotations": []}],
            }));
        }

        let status = match stop_reason {
            StopReason::ToolCalls => "requires_action",
            StopReason::MaxTokens => "incomplete",
            _ => "completed",
        };
        let mut response = serde_json::json!({
            "id": self.response_id,
            "object": "response",
            "status": status,
            "model": self.model,
            "output": output,
        });
        if let Some(usage) = &self.usage {
            response["usage"] = serde_json::json!({
                "input_tokens": usage.input_tokens.unwrap_or(0),
                "output_tokens": usage.output_tokens.unwrap_or(0),
                "total_tokens": usage.total_tokens.unwrap_or(
                    usage.input_tokens.unwrap_or(0) + usage.output_tokens.unwrap_or(0)
                ),
            });
        }
        response
    }
}
