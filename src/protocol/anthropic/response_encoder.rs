use crate::protocol::canonical::{ChatResponse, MessagePart};
use crate::protocol::mapping::stop_reason_to_anthropic;

use super::{AnthropicResponse, AnthropicUsage};

/// Encode a canonical response into an Anthropic Messages client body.
#[must_use]
pub fn encode_messages_response(canonical: &ChatResponse) -> AnthropicResponse {
    let mut blocks: Vec<serde_json::Value> = Vec::with_capacity(canonical.content.len());

    for part in &canonical.content {
        match part {
            MessagePart::Text(text) => {
                blocks.push(serde_json::json!({"type": "text", "text": text}));
            }
            MessagePart::Reasoning(text) => {
                blocks.push(serde_json::json!({"type": "thinking", "thinking": text}));
            }
            MessagePart::ToolCall {
                id,
                name,
                arguments,
            } => {
                let input: serde_json::Value =
                    serde_json::from_str(arguments).unwrap_or(serde_json::json!({}));
                blocks.push(serde_json::json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                }));
            }
            MessagePart::ToolResult { .. } | MessagePart::ImageUrl { .. } => {}
        }
    }

    AnthropicResponse {
        id: canonical.id.clone(),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: canonical.model.clone(),
        content: blocks,
        stop_reason: Some(stop_reason_to_anthropic(canonical.stop_reason).to_string()),
        stop_sequence: None,
        usage: Some(AnthropicUsage {
            input_tokens: canonical.usage.input_tokens.unwrap_or(0),
            output_tokens: canonical.usage.output_tokens.unwrap_or(0),
        }),
    }
}
