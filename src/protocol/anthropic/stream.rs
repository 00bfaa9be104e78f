//! Anthropic Messages streaming transcode.
//!
//! The provider side decodes the named-event sequence (`message_start`,
//! `content_block_*`, `message_delta`, `message_stop`) into canonical
//! events; the client side re-emits that sequence with locally assigned
//! block indices.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::protocol::canonical::{ChatRole, StopReason, StreamEvent, Usage};
use crate::protocol::mapping::{anthropic_stop_to_reason, stop_reason_to_anthropic};
use crate::stream::sse::named_frame;
use crate::stream::SseEvent;

// ---------------------------------------------------------------------------
// Decode: provider events -> canonical events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Incremental decoder for an Anthropic provider stream.
#[derive(Debug, Default)]
pub struct MessagesStreamDecoder {
    block_kinds: FxHashMap<usize, BlockKind>,
    stop_reason: Option<StopReason>,
    input_tokens: Option<u64>,
}

impl MessagesStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one SSE frame into zero or more canonical events.
    pub fn decode(&mut self, frame: &SseEvent, out: &mut Vec<StreamEvent>) {
        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            return;
        };
        let event_name = frame
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default();

        match event_name {
            "message_start" => {
                let message = data.get("message");
                let model = message
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.input_tokens = message
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64);
                out.push(StreamEvent::MessageStart {
                    role: ChatRole::Assistant,
                    model,
                });
            }
            "content_block_start" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let block = data.get("content_block");
                match block.and_then(|b| b.get("type")).and_then(Value::as_str) {
                    Some("tool_use") => {
                        self.block_kinds.insert(index, BlockKind::ToolUse);
                        out.push(StreamEvent::ToolCallStart {
                            index,
                            id: block
                                .and_then(|b| b.get("id"))
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .and_then(|b| b.get("name"))
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                    Some("thinking") => {
                        self.block_kinds.insert(index, BlockKind::Thinking);
                    }
                    _ => {
                        self.block_kinds.insert(index, BlockKind::Text);
                    }
                }
            }
            "content_block_delta" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let Some(delta) = data.get("delta") else {
                    return;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            out.push(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            out.push(StreamEvent::ReasoningDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(json) = delta.get("partial_json").and_then(Value::as_str) {
                            out.push(StreamEvent::ToolCallArgsDelta {
                                index,
                                delta: json.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if self.block_kinds.remove(&index) == Some(BlockKind::ToolUse) {
                    out.push(StreamEvent::ToolCallEnd { index });
                }
            }
            "message_delta" => {
                if let Some(reason) = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(anthropic_stop_to_reason(reason));
                }
                if let Some(output) = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                {
                    out.push(StreamEvent::Usage(Usage {
                        input_tokens: self.input_tokens,
                        output_tokens: Some(output),
                        total_tokens: self.input_tokens.map(|i| i + output),
                    }));
                }
            }
            "message_stop" => {
                out.push(StreamEvent::MessageEnd {
                    stop_reason: self.stop_reason.take().unwrap_or(StopReason::EndOfTurn),
                });
                out.push(StreamEvent::Done);
            }
            "error" => {
                let message = data
                    .get("error")
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

/// Stateful encoder producing the Anthropic client event sequence.
#[derive(Debug)]
pub struct MessagesStreamEncoder {
    response_id: String,
    model: String,
    next_block_index: usize,
    open_block: Option<(usize, BlockKind)>,
    tool_block_indices: FxHashMap<usize, usize>,
    output_tokens: u64,
    input_tokens: u64,
    message_started: bool,
}

impl MessagesStreamEncoder {
    #[must_use]
    pub fn new(response_id: String, model: String) -> Self {
        Self {
            response_id,
            model,
            next_block_index: 0,
            open_block: None,
            tool_block_indices: FxHashMap::default(),
            output_tokens: 0,
            input_tokens: 0,
            message_started: false,
        }
    }

    /// Encode one canonical event into zero or more SSE wire strings.
    pub fn encode(&mut self, event: &StreamEvent, out: &mut Vec<String>) {
        match event {
            StreamEvent::MessageStart { model, .. } => {
                if !model.is_empty() {
                    self.model.clone_from(model);
                }
                self.message_started = true;
                let body = serde_json::json!({
                    "type": "message_start",
                    "message": {
                        "id": self.response_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    },
                });
                out.push(named_frame("message_start", &body.to_string()));
            }
            StreamEvent::TextDelta(text) => {
                let index = self.ensure_block(BlockKind::Text, None, out);
                let body = serde_json::json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": text},
                });
                out.push(named_frame("content_block_delta", &body.to_string()));
            }
            StreamEvent::ReasoningDelta(text) => {
                let index = self.ensure_block(BlockKind::Thinking, None, out);
                let body = serde_json::json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "thinking_delta", "thinking": text},
                });
                out.push(named_frame("content_block_delta", &body.to_string()));
            }
            StreamEvent::ToolCallStart {
                index: call_index,
                id,
                name,
            } => {
                self.close_open_block(out);
                let index = self.ensure_block(
                    BlockKind::ToolUse,
                    Some(serde_json::json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": {},
                    })),
                    out,
                );
                self.tool_block_indices.insert(*call_index, index);
            }
            StreamEvent::ToolCallArgsDelta { index, delta } => {
                let Some(block_index) = self.tool_block_indices.get(index).copied() else {
                    return;
                };
                let body = serde_json::json!({
                    "type": "content_block_delta",
                    "index": block_index,
                    "delta": {"type": "input_json_delta", "partial_json": delta},
                });
                out.push(named_frame("content_block_delta", &body.to_string()));
            }
            StreamEvent::ToolCallEnd { index } => {
                if let Some(block_index) = self.tool_block_indices.get(index).copied() {
                    if self.open_block.map(|(i, _)| i) == Some(block_index) {
                        self.open_block = None;
                    }
                    let body = serde_json::json!({
                        "type": "content_block_stop",
                        "index": block_index,
                    });
                    out.push(named_frame("content_block_stop", &body.to_string()));
                }
            }
            StreamEvent::Usage(usage) => {
                self.input_tokens = usage.input_tokens.unwrap_or(self.input_tokens);
                self.output_tokens = usage.output_tokens.unwrap_or(self.output_tokens);
            }
            StreamEvent::MessageEnd { stop_reason } => {
                self.close_open_block(out);
                let delta_body = serde_json::json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": stop_reason_to_anthropic(*stop_reason),
                        "stop_sequence": null,
                    },
                    "usage": {"output_tokens": self.output_tokens},
                });
                out.push(named_frame("message_delta", &delta_body.to_string()));
                let stop_body = serde_json::json!({"type": "message_stop"});
                out.push(named_frame("message_stop", &stop_body.to_string()));
            }
            // Anthropic streams have no [DONE] sentinel.
            StreamEvent::Done => {}
            StreamEvent::Error { status, message } => {
                let body = serde_json::json!({
                    "type": "error",
                    "error": {
                        "type": "api_error",
                        "message": message,
                        "status": status,
                    },
                });
                out.push(named_frame("error", &body.to_string()));
            }
        }
    }

    /// Open a block of `kind` if the current one differs, returning its index.
    fn ensure_block(
        &mut self,
        kind: BlockKind,
        content_block: Option<Value>,
        out: &mut Vec<String>,
    ) -> usize {
        if let Some((index, open_kind)) = self.open_block {
            if open_kind == kind && content_block.is_none() {
                return index;
            }
            self.close_open_block(out);
        }

        let index = self.next_block_index;
        self.next_block_index += 1;
        let block = content_block.unwrap_or_else(|| match kind {
            BlockKind::Text => serde_json::json!({"type": "text", "text": ""}),
            BlockKind::Thinking => serde_json::json!({"type": "thinking", "thinking": ""}),
            BlockKind::ToolUse => serde_json::json!({"type": "tool_use", "input": {}}),
        });
        let body = serde_json::json!({
            "type": "content_block_start",
            "index": index,
            "content_block": block,
        });
        out.push(named_frame("content_block_start", &body.to_string()));
        self.open_block = Some((index, kind));
        index
    }

    fn close_open_block(&mut self, out: &mut Vec<String>) {
        if let Some((index, _)) = self.open_block.take() {
            let body = serde_json::json!({
                "type": "content_block_stop",
                "index": index,
            });
            out.push(named_frame("content_block_stop", &body.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(frames: &[(&str, &str)]) -> Vec<StreamEvent> {
        let mut decoder = MessagesStreamDecoder::new();
        let mut out = Vec::new();
        for (event, data) in frames {
            decoder.decode(&SseEvent::named(*event, *data), &mut out);
        }
        out
    }

    #[test]
    fn provider_sequence_decodes_to_canonical() {
        let events = decode_all(&[
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_1","model":"claude","usage":{"input_tokens":9}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            ),
            (
                "content_block_stop",
                r#"{"type":"content_block_stop","index":0}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::MessageStart {
                    role: ChatRole::Assistant,
                    model: "claude".into()
                },
                StreamEvent::TextDelta("Hi".into()),
                StreamEvent::Usage(Usage {
                    input_tokens: Some(9),
                    output_tokens: Some(2),
                    total_tokens: Some(11),
                }),
                StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndOfTurn
                },
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn tool_use_blocks_decode_to_tool_events() {
        let events = decode_all(&[
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\""}}"#,
            ),
            (
                "content_block_stop",
                r#"{"type":"content_block_stop","index":1}"#,
            ),
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallStart {
                    index: 1,
                    id: "toolu_1".into(),
                    name: "get_weather".into()
                },
                StreamEvent::ToolCallArgsDelta {
                    index: 1,
                    delta: "{\"city\"".into()
                },
                StreamEvent::ToolCallEnd { index: 1 },
            ]
        );
    }

    #[test]
    fn encoder_emits_anthropic_event_sequence() {
        let mut encoder = MessagesStreamEncoder::new("msg_1".into(), "claude".into());
        let mut out = Vec::new();
        encoder.encode(
            &StreamEvent::MessageStart {
                role: ChatRole::Assistant,
                model: "claude".into(),
            },
            &mut out,
        );
        encoder.encode(&StreamEvent::TextDelta("Hi".into()), &mut out);
        encoder.encode(
            &StreamEvent::MessageEnd {
                stop_reason: StopReason::EndOfTurn,
            },
            &mut out,
        );

        let joined = out.join("");
        assert!(joined.starts_with("event: message_start\n"));
        assert!(joined.contains("event: content_block_start"));
        assert!(joined.contains("text_delta"));
        assert!(joined.contains("event: content_block_stop"));
        assert!(joined.contains("event: message_delta"));
        assert!(joined.contains("\"stop_reason\":\"end_turn\""));
        assert!(joined.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }

    #[test]
    fn encoder_switches_blocks_between_text_and_tool_use() {
        let mut encoder = MessagesStreamEncoder::new("msg_1".into(), "claude".into());
        let mut out = Vec::new();
        encoder.encode(&StreamEvent::TextDelta("a".into()), &mut out);
        encoder.encode(
            &StreamEvent::ToolCallStart {
                index: 0,
                id: "toolu_9".into(),
                name: "f".into(),
            },
            &mut out,
        );
        encoder.encode(
            &StreamEvent::ToolCallArgsDelta {
                index: 0,
                delta: "{}".into(),
            },
            &mut out,
        );
        encoder.encode(&StreamEvent::ToolCallEnd { index: 0 }, &mut out);

        let joined = out.join("");
        // Text block 0 opens and closes, tool block 1 opens with the call id.
        assert!(joined.contains("\"index\":0"));
        assert!(joined.contains("\"index\":1"));
        assert!(joined.contains("\"id\":\"toolu_9\""));
        assert!(joined.contains("input_json_delta"));
    }
}
