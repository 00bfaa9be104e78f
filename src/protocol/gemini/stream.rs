//! Gemini streaming decode (outbound-only protocol, so no client encoder).

use crate::protocol::canonical::{ChatRole, StopReason, StreamEvent, Usage};
use crate::protocol::mapping::gemini_finish_to_reason;
use crate::stream::SseEvent;

use super::response_decoder::decode_part;
use super::GeminiResponse;
use crate::protocol::canonical::MessagePart;

/// Incremental decoder for a Gemini / Cloud Code Assist provider stream.
///
/// Each SSE frame is a full `GeminiResponse`-shaped chunk (possibly wrapped
/// under `response`); function calls arrive whole in a single frame.
#[derive(Debug, Default)]
pub struct GeminiStreamDecoder {
    message_started: bool,
    saw_tool_calls: bool,
    next_tool_index: usize,
    finished: bool,
}

impl GeminiStreamDecoder {
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

        let Ok(value) = serde_json::from_str::<serde_json::Value>(&frame.data) else {
            return;
        };
        let Ok(chunk) = GeminiResponse::from_provider_value(value) else {
            return;
        };

        if !self.message_started {
            self.message_started = true;
            out.push(StreamEvent::MessageStart {
                role: ChatRole::Assistant,
                model: chunk.model_version.clone().unwrap_or_default(),
            });
        }

        for candidate in &chunk.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    let mut decoded: Vec<MessagePart> = Vec::new();
                    let mut has_call = false;
                    decode_part(part, &mut decoded, &mut has_call);
                    for piece in decoded {
                        match piece {
                            MessagePart::Text(text) => out.push(StreamEvent::TextDelta(text)),
                            MessagePart::Reasoning(text) => {
                                out.push(StreamEvent::ReasoningDelta(text));
                            }
                            MessagePart::ToolCall {
                                id,
                                name,
                                arguments,
                            } => {
                                let index = self.next_tool_index;
                                self.next_tool_index += 1;
                                self.saw_tool_calls = true;
                                out.push(StreamEvent::ToolCallStart {
                                    index,
                                    id,
                                    name,
                                });
                                out.push(StreamEvent::ToolCallArgsDelta {
                                    index,
                                    delta: arguments,
                                });
                                out.push(StreamEvent::ToolCallEnd { index });
                            }
                            MessagePart::ToolResult { .. } | MessagePart::ImageUrl { .. } => {}
                        }
                    }
                }
            }

            if let Some(reason) = candidate.finish_reason.as_deref() {
                if let Some(usage) = &chunk.usage_metadata {
                    out.push(StreamEvent::Usage(Usage {
                        input_tokens: Some(usage.prompt_token_count),
                        output_tokens: Some(usage.candidates_token_count),
                        total_tokens: Some(usage.total_token_count),
                    }));
                }
                self.finished = true;
                let stop_reason = if self.saw_tool_calls && reason == "STOP" {
                    StopReason::ToolCalls
                } else {
                    gemini_finish_to_reason(reason)
                };
                out.push(StreamEvent::MessageEnd { stop_reason });
                out.push(StreamEvent::Done);
            }
        }
    }
}
