use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChatResponse, MessagePart, StopReason, Usage};
use crate::toolcall::arguments_to_canonical;

use super::ResponsesResponse;

/// Decode an OpenAI Responses provider response into the canonical form.
///
/// # Errors
///
/// Returns [`GatewayError::InternalConversion`] when an output item is
/// structurally invalid.
pub fn decode_responses_response(
    response: ResponsesResponse,
) -> Result<ChatResponse, GatewayError> {
    let mut content: Vec<MessagePart> = Vec::new();
    let mut has_tool_calls = false;

    for item in &response.output {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        match item_type {
            "message" => {
                if let Some(Value::Array(blocks)) = item.get("content") {
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("output_text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                content.push(MessagePart::Text(text.to_string()));
                            }
                        }
                    }
                }
            }
            "function_call" => {
                let call_id = item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GatewayError::InternalConversion(
                            "provider function_call item is missing 'call_id'".to_string(),
                        )
                    })?;
                let name = item.get("name").and_then(Value::as_str).ok_or_else(|| {
                    GatewayError::InternalConversion(
                        "provider function_call item is missing 'name'".to_string(),
                    )
                })?;
                has_tool_calls = true;
                content.push(MessagePart::ToolCall {
                    id: call_id.to_string(),
                    name: name.to_string(),
                    arguments: arguments_to_canonical(
                        item.get("arguments").unwrap_or(&Value::Null),
                    ),
                });
            }
            "reasoning" => {
                if let Some(Value::Array(blocks)) = item.get("content") {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            content.push(MessagePart::Reasoning(text.to_string()));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let stop_reason = if has_tool_calls {
        StopReason::ToolCalls
    } else if response.status == "incomplete" {
        StopReason::MaxTokens
    } else {
        StopReason::EndOfTurn
    };

    Ok(ChatResponse {
        id: response.id,
        model: response.model,
        content,
        stop_reason,
        usage: response.usage.map_or_else(Usage::default, |u| Usage {
            input_tokens: Some(u.input_tokens),
            output_tokens: Some(u.output_tokens),
            total_tokens: Some(u.total_tokens),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_and_function_call_items_decode() {
        let wire: ResponsesResponse = serde_json::from_value(json!({
            "id": "resp_1",
            "object": "response",
            "status": "completed",
            "model": "gpt-4",
            "output": [
                {"type": "message", "id": "msg_1", "role": "assistant",
                 "content": [{"type": "output_text", "text": "calling", "annotations": []}]},
                {"type": "function_call", "call_id": "call_1", "name": "apply_patch",
                 "arguments": "{\"patch\":\"p\"}"}
            ],
            "usage": {"input_tokens": 5, "output_tokens": 3, "total_tokens": 8}
        }))
        .unwrap();
        let resp = decode_responses_response(wire).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolCalls);
        assert_eq!(resp.content.len(), 2);
        assert_eq!(resp.usage.total_tokens, Some(8));
    }

    #[test]
    fn incomplete_status_maps_to_max_tokens() {
        let wire: ResponsesResponse = serde_json::from_value(json!({
            "id": "resp_2", "object": "response", "status": "incomplete", "model": "m",
            "output": [{"type": "message", "content":
                [{"type": "output_text", "text": "cut off"}]}]
        }))
        .unwrap();
        let resp = decode_responses_response(wire).unwrap();
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
    }
}
