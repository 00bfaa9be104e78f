//! OpenAI Chat streaming transcode: provider chunks to canonical events and
//! canonical events back to client `chat.completion.chunk` SSE frames.

use rustc_hash::FxHashSet;

use crate::protocol::canonical::{ChatRole, StopReason, StreamEvent, Usage};
use crate::protocol::mapping::{openai_stop_to_reason, stop_reason_to_openai};
use crate::stream::sse::{data_frame, DONE_FRAME};
use crate::stream::SseEvent;

use super::{OpenAiStreamChunk, OpenAiUsage};

// ---------------------------------------------------------------------------
// Decode: provider chunk -> canonical events
// ---------------------------------------------------------------------------

/// Incremental decoder for an OpenAI-compatible provider stream.
#[derive(Debug, Default)]
pub struct ChatStreamDecoder {
    message_started: bool,
    open_tool_indices: FxHashSet<usize>,
    finished: bool,
}

impl ChatStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one SSE frame into zero or more canonical events. Unparseable
    /// frames are skipped; providers interleave keep-alives and vendor
    /// extensions freely.
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

        let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(&frame.data) else {
            return;
        };

        if !self.message_started {
            self.message_started = true;
            out.push(StreamEvent::MessageStart {
                role: ChatRole::Assistant,
                model: chunk.model.clone(),
            });
        }

        for choice in &chunk.choices {
            if let Some(reasoning) = choice
                .delta
                .reasoning_content
                .as_ref()
                .filter(|r| !r.is_empty())
            {
                out.push(StreamEvent::ReasoningDelta(reasoning.clone()));
            }
            if let Some(content) = choice.delta.content.as_ref().filter(|c| !c.is_empty()) {
                out.push(StreamEvent::TextDelta(content.clone()));
            }
            for call in choice.delta.tool_calls.iter().flatten() {
                let index = call.index as usize;
                if !self.open_tool_indices.contains(&index) {
                    if let (Some(id), Some(name)) = (
                        call.id.as_ref(),
                        call.function.as_ref().and_then(|f| f.name.as_ref()),
                    ) {
                        self.open_tool_indices.insert(index);
                        out.push(StreamEvent::ToolCallStart {
                            index,
                            id: id.clone(),
                            name: name.clone(),
                        });
                    }
                }
                if let Some(args) = call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_ref())
                    .filter(|a| !a.is_empty())
                {
                    out.push(StreamEvent::ToolCallArgsDelta {
                        index,
                        delta: args.clone(),
                    });
                }
            }
            if let Some(finish) = choice.finish_reason.as_deref() {
                let mut open: Vec<usize> = self.open_tool_indices.drain().collect();
                open.sort_unstable();
                for index in open {
                    out.push(StreamEvent::ToolCallEnd { index });
                }
                self.finished = true;
                out.push(StreamEvent::MessageEnd {
                    stop_reason: openai_stop_to_reason(finish),
                });
            }
        }

        if let Some(usage) = &chunk.usage {
            out.push(StreamEvent::Usage(Usage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
                total_tokens: Some(usage.total_tokens),
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// Encode: canonical events -> client SSE frames
// ---------------------------------------------------------------------------

/// Stateful encoder producing `chat.completion.chunk` frames for a client.
#[derive(Debug)]
pub struct ChatStreamEncoder {
    response_id: String,
    model: String,
    created: u64,
    usage: Option<OpenAiUsage>,
}

impl ChatStreamEncoder {
    #[must_use]
    pub fn new(response_id: String, model: String) -> Self {
        Self {
            response_id,
            model,
            created: crate::util::unix_now_secs(),
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
                out.push(self.chunk(serde_json::json!({"role": "assistant", "content": ""}), None));
            }
            StreamEvent::TextDelta(text) => {
                out.push(self.chunk(serde_json::json!({"content": text}), None));
            }
            StreamEvent::ReasoningDelta(text) => {
                out.push(self.chunk(serde_json::json!({"reasoning_content": text}), None));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                out.push(self.chunk(
                    serde_json::json!({"tool_calls": [{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]}),
                    None,
                ));
            }
            StreamEvent::ToolCallArgsDelta { index, delta } => {
                out.push(self.chunk(
                    serde_json::json!({"tool_calls": [{
                        "index": index,
                        "function": {"arguments": delta},
                    }]}),
                    None,
                ));
            }
            StreamEvent::ToolCallEnd { .. } => {}
            StreamEvent::Usage(usage) => {
                self.usage = Some(OpenAiUsage {
                    prompt_tokens: usage.input_tokens.unwrap_or(0),
                    completion_tokens: usage.output_tokens.unwrap_or(0),
                    total_tokens: usage
                        .total_tokens
                        .unwrap_or(usage.input_tokens.unwrap_or(0) + usage.output_tokens.unwrap_or(0)),
                });
            }
            StreamEvent::MessageEnd { stop_reason } => {
                out.push(self.finish_chunk(*stop_reason));
            }
            StreamEvent::Done => {
                out.push(DONE_FRAME.to_string());
            }
            StreamEvent::Error { status, message } => {
                let body = serde_json::json!({
                    "error": {"code": "upstream_error", "message": message, "status": status}
                });
                out.push(data_frame(&body.to_string()));
                out.push(DONE_FRAME.to_string());
            }
        }
    }

    fn chunk(&self, delta: serde_json::Value, finish_reason: Option<&str>) -> String {
        let body = serde_json::json!({
            "id": self.response_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        data_frame(&body.to_string())
    }

    fn finish_chunk(&mut self, stop_reason: StopReason) -> String {
        let mut body = serde_json::json!({
            "id": self.response_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": stop_reason_to_openai(stop_reason),
            }],
        });
        if let Some(usage) = self.usage.take() {
            body["usage"] = serde_json::to_value(usage).unwrap_or_default();
        }
        data_frame(&body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(frames: &[&str]) -> Vec<StreamEvent> {
        let mut decoder = ChatStreamDecoder::new();
        let mut out = Vec::new();
        for frame in frames {
            decoder.decode(&SseEvent::data(*frame), &mut out);
        }
        out
    }

    #[test]
    fn text_stream_decodes_to_canonical_events() {
        let events = decode_all(&[
            r#"{"id":"c1","object":"chat.completion.chunk","model":"gpt-4","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"}}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","model":"gpt-4","choices":[{"index":0,"delta":{"content":" there"}}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","model":"gpt-4","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::MessageStart {
                    role: ChatRole::Assistant,
                    model: "gpt-4".into()
                },
                StreamEvent::TextDelta("Hi".into()),
                StreamEvent::TextDelta(" there".into()),
                StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndOfTurn
                },
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn tool_call_stream_opens_and_closes_calls() {
        let events = decode_all(&[
            r#"{"id":"c1","object":"chat.completion.chunk","model":"m","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"f","arguments":""}}]}}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","model":"m","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"x\":1}"}}]}}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","model":"m","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]);
        assert!(matches!(
            events[1],
            StreamEvent::ToolCallStart { index: 0, .. }
        ));
        assert!(events.contains(&StreamEvent::ToolCallEnd { index: 0 }));
        assert!(events.contains(&StreamEvent::MessageEnd {
            stop_reason: StopReason::ToolCalls
        }));
    }

    #[test]
    fn bare_done_still_terminates_message() {
        let events = decode_all(&["[DONE]"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndOfTurn
                },
                StreamEvent::Done
            ]
        );
    }

    #[test]
    fn encoder_emits_chunks_and_done() {
        let mut encoder = ChatStreamEncoder::new("chatcmpl-1".into(), "gpt-4".into());
        let mut out = Vec::new();
        encoder.encode(
            &StreamEvent::MessageStart {
                role: ChatRole::Assistant,
                model: "gpt-4".into(),
            },
            &mut out,
        );
        encoder.encode(&StreamEvent::TextDelta("ok".into()), &mut out);
        encoder.encode(
            &StreamEvent::MessageEnd {
                stop_reason: StopReason::EndOfTurn,
            },
            &mut out,
        );
        encoder.encode(&StreamEvent::Done, &mut out);

        assert_eq!(out.len(), 4);
        assert!(out[0].starts_with("data: "));
        assert!(out[1].contains("\"content\":\"ok\""));
        assert!(out[2].contains("\"finish_reason\":\"stop\""));
        assert_eq!(out[3], DONE_FRAME);
    }

    #[test]
    fn usage_is_attached_to_finish_chunk() {
        let mut encoder = ChatStreamEncoder::new("c".into(), "m".into());
        let mut out = Vec::new();
        encoder.encode(
            &StreamEvent::Usage(Usage {
                input_tokens: Some(7),
                output_tokens: Some(2),
                total_tokens: None,
            }),
            &mut out,
        );
        assert!(out.is_empty());
        encoder.encode(
            &StreamEvent::MessageEnd {
                stop_reason: StopReason::EndOfTurn,
            },
            &mut out,
        );
        assert!(out[0].contains("\"total_tokens\":9"));
    }
}
