use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChatResponse, MessagePart, StopReason, Usage};
use crate::protocol::mapping::anthropic_stop_to_reason;
use crate::toolcall::arguments_to_canonical;

use super::AnthropicResponse;

/// Decode an Anthropic Messages provider response into the canonical form.
///
/// # Errors
///
/// Returns [`GatewayError::InternalConversion`] when a content block is
/// structurally invalid.
pub fn decode_messages_response(
    response: AnthropicResponse,
) -> Result<ChatResponse, GatewayError> {
    let mut content: Vec<MessagePart> = Vec::with_capacity(response.content.len());

    for block in &response.content {
        let block_type = block.get("type").and_then(Value::as_str).unwrap_or("text");
        match block_type {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    content.push(MessagePart::Text(text.to_string()));
                }
            }
            "thinking" => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    content.push(MessagePart::Reasoning(text.to_string()));
                }
            }
            "tool_use" => {
                let id = block.get("id").and_then(Value::as_str).ok_or_else(|| {
                    GatewayError::InternalConversion(
                        "provider tool_use block is missing 'id'".to_string(),
                    )
                })?;
                let name = block.get("name").and_then(Value::as_str).ok_or_else(|| {
                    GatewayError::InternalConversion(
                        "provider tool_use block is missing 'name'".to_string(),
                    )
                })?;
                content.push(MessagePart::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments_to_canonical(block.get("input").unwrap_or(&Value::Null)),
                });
            }
            _ => {}
        }
    }

    let stop_reason = response
        .stop_reason
        .as_deref()
        .map_or(StopReason::EndOfTurn, anthropic_stop_to_reason);

    Ok(ChatResponse {
        id: response.id,
        model: response.model,
        content,
        stop_reason,
        usage: response.usage.map_or_else(Usage::default, |u| Usage {
            input_tokens: Some(u.input_tokens),
            output_tokens: Some(u.output_tokens),
            total_tokens: Some(u.input_tokens + u.output_tokens),
        }),
    })
}
