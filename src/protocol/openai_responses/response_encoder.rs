use serde_json::Value;

use crate::protocol::canonical::{ChatResponse, MessagePart, StopReason};
use crate::util::unix_now_secs;

use super::{ResponsesResponse, ResponsesUsage};

/// Encode a canonical response into an OpenAI Responses client body.
///
/// Tool-call turns additionally surface `required_action.submit_tool_outputs`
/// so clients driving the tool loop through
/// `/v1/responses/:id/submit_tool_outputs` see the calls in one place.
#[must_use]
pub fn encode_responses_response(canonical: &ChatResponse) -> ResponsesResponse {
    let mut output: Vec<Value> = Vec::with_capacity(canonical.content.len());
    let mut required_calls: Vec<Value> = Vec::new();
    let mut text_blocks: Vec<Value> = Vec::new();
    let mut reasoning_blocks: Vec<Value> = Vec::new();

    for part in &canonical.content {
        match part {
            MessagePart::Text(text) => {
                text_blocks.push(serde_json::json!({
                    "type": "output_text",
                    "text": text,
                    "annotations": [],
                }));
            }
            MessagePart::Reasoning(text) => {
                reasoning_blocks.push(serde_json::json!({
                    "type": "reasoning_text",
                    "text": text,
                }));
            }
            MessagePart::ToolCall {
                id,
                name,
                arguments,
            } => {
                output.push(serde_json::json!({
                    "type": "function_call",
                    "id": format!("fc_{id}"),
                    "call_id": id,
                    "name": name,
                    "arguments": arguments,
                    "status": "completed",
                }));
                required_calls.push(serde_json::json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                }));
            }
            MessagePart::ToolResult { .. } | MessagePart::ImageUrl { .. } => {}
        }
    }

    if !reasoning_blocks.is_empty() {
        output.insert(
            0,
            serde_json::json!({
                "type": "reasoning",
                "id": format!("rs_{}", canonical.id),
                "content": reasoning_blocks,
            }),
        );
    }
    if !text_blocks.is_empty() {
        output.push(serde_json::json!({
            "type": "message",
            "id": format!("msg_{}", canonical.id),
            "role": "assistant",
            "status": "completed",
            "content": text_blocks,
        }));
    }

    let status = match canonical.stop_reason {
        StopReason::ToolCalls => "requires_action",
        StopReason::MaxTokens => "incomplete",
        _ => "completed",
    };

    ResponsesResponse {
        id: canonical.id.clone(),
        object: "response".to_string(),
        created_at: Some(unix_now_secs()),
        status: status.to_string(),
        model: canonical.model.clone(),
        output,
        required_action: (!required_calls.is_empty()).then(|| {
            serde_json::json!({
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {"tool_calls": required_calls},
            })
        }),
        usage: match (canonical.usage.input_tokens, canonical.usage.output_tokens) {
            (None, None) => None,
            (input, output_tokens) => Some(ResponsesUsage {
                input_tokens: input.unwrap_or(0),
                output_tokens: output_tokens.unwrap_or(0),
                total_tokens: canonical
                    .usage
                    .total_tokens
                    .unwrap_or(input.unwrap_or(0) + output_tokens.unwrap_or(0)),
            }),
        },
    }
}
