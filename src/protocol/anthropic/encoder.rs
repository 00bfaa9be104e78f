use crate::error::GatewayError;
use crate::protocol::canonical::{
    ChatRequest, ChatRole, MessagePart, TargetProtocol, ToolChoice,
};
use crate::protocol::mapping::chat_role_to_anthropic;
use crate::toolcall::arguments_for_target;

use super::{AnthropicMessage, AnthropicRequest, AnthropicTool};

const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Encode a canonical request into the Anthropic Messages wire format.
///
/// An empty `tools: []` is preserved iff the client sent the field; tool
/// arguments are re-parsed from the canonical JSON string (arrays wrapped
/// as `{items:[…]}`).
///
/// # Errors
///
/// Returns [`GatewayError`] when a tool-call argument payload is not valid
/// JSON.
pub fn encode_messages_request(
    canonical: &ChatRequest,
    model: &str,
) -> Result<AnthropicRequest, GatewayError> {
    let system = canonical
        .system
        .as_ref()
        .map(|s| serde_json::Value::String(s.clone()));

    let mut messages: Vec<AnthropicMessage> = Vec::with_capacity(canonical.messages.len());
    for msg in &canonical.messages {
        if msg.role == ChatRole::System {
            continue;
        }
        let role = chat_role_to_anthropic(msg.role).to_string();
        let mut content = encode_parts(msg.role, &msg.parts)?;
        // Anthropic wants alternating roles; canonical tool-result messages
        // merge back into the adjacent user turn.
        let mut merged = false;
        if let Some(last) = messages.last_mut() {
            if last.role == role {
                if let (serde_json::Value::Array(existing), serde_json::Value::Array(new_blocks)) =
                    (&mut last.content, &mut content)
                {
                    existing.append(new_blocks);
                    merged = true;
                }
            }
        }
        if !merged {
            messages.push(AnthropicMessage { role, content });
        }
    }

    let tools = if canonical.tools.is_empty() {
        canonical.tools_field_present.then(Vec::new)
    } else {
        Some(
            canonical
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t.function.parameters.clone(),
                })
                .collect(),
        )
    };

    Ok(AnthropicRequest {
        model: model.to_string(),
        max_tokens: canonical.generation.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system,
        messages,
        tools,
        tool_choice: encode_tool_choice(&canonical.tool_choice, canonical.tools.is_empty()),
        stream: canonical.stream.then_some(true),
        temperature: canonical.generation.temperature,
        top_p: canonical.generation.top_p,
        stop_sequences: canonical.generation.stop.clone(),
        extra: serde_json::Map::new(),
    })
}

/// Encode canonical parts into an Anthropic content array. `tool_result`
/// blocks must come first in a user message.
fn encode_parts(
    role: ChatRole,
    parts: &[MessagePart],
) -> Result<serde_json::Value, GatewayError> {
    let mut blocks = Vec::with_capacity(parts.len());
    if matches!(role, ChatRole::User | ChatRole::Tool) {
        for part in parts {
            if matches!(part, MessagePart::ToolResult { .. }) {
                encode_part(part, &mut blocks)?;
            }
        }
        for part in parts {
            if !matches!(part, MessagePart::ToolResult { .. }) {
                encode_part(part, &mut blocks)?;
            }
        }
    } else {
        for part in parts {
            encode_part(part, &mut blocks)?;
        }
    }
    Ok(serde_json::Value::Array(blocks))
}

fn encode_part(
    part: &MessagePart,
    blocks: &mut Vec<serde_json::Value>,
) -> Result<(), GatewayError> {
    match part {
        MessagePart::Text(text) => {
            blocks.push(serde_json::json!({
                "type": "text",
                "text": text,
            }));
        }
        MessagePart::Reasoning(text) => {
            blocks.push(serde_json::json!({
                "type": "thinking",
                "thinking": text,
            }));
        }
        MessagePart::ToolCall {
            id,
            name,
            arguments,
        } => {
            let input = arguments_for_target(arguments, name, TargetProtocol::Anthropic)?;
            blocks.push(serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }));
        }
        MessagePart::ToolResult {
            tool_call_id,
            content,
        } => {
            blocks.push(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
            }));
        }
        MessagePart::ImageUrl { url, .. } => {
            blocks.push(serde_json::json!({
                "type": "image",
                "source": {
                    "type": "url",
                    "url": url,
                },
            }));
        }
    }
    Ok(())
}

fn encode_tool_choice(choice: &ToolChoice, tools_empty: bool) -> Option<serde_json::Value> {
    if tools_empty {
        return None;
    }
    Some(match choice {
        ToolChoice::Auto => serde_json::json!({"type": "auto"}),
        ToolChoice::None => serde_json::json!({"type": "none"}),
        ToolChoice::Required => serde_json::json!({"type": "any"}),
        ToolChoice::Specific(name) => serde_json::json!({"type": "tool", "name": name}),
    })
}
