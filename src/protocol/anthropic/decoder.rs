use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{
    ChatMessage, ChatRequest, ChatRole, EntryProtocol, GenerationParams, MessagePart,
    RequestMetadata, ToolChoice, ToolFunction, ToolSpec,
};
use crate::protocol::mapping::anthropic_role_to_chat;
use crate::toolcall::arguments_to_canonical;

use super::{AnthropicRequest, AnthropicTool};

/// Decode an Anthropic Messages wire request into the canonical form.
///
/// `text`, `input_text` and `output_text` blocks flatten into text parts;
/// `tool_use` blocks lift into tool calls; `tool_result` blocks become tool
/// results; `thinking` blocks become reasoning parts.
///
/// # Errors
///
/// Returns [`GatewayError::Protocol`] when a block is structurally invalid.
pub fn decode_messages_request(
    request: AnthropicRequest,
    request_id: String,
    metadata: RequestMetadata,
) -> Result<ChatRequest, GatewayError> {
    let AnthropicRequest {
        model,
        max_tokens,
        system,
        messages,
        tools,
        tool_choice,
        stream,
        temperature,
        top_p,
        stop_sequences,
        extra: _,
    } = request;

    let tools_field_present = tools.is_some();
    let mut canonical_messages = Vec::with_capacity(messages.len());
    for msg in messages {
        decode_message(&msg.role, msg.content, &mut canonical_messages)?;
    }

    Ok(ChatRequest {
        request_id,
        entry: EntryProtocol::AnthropicMessages,
        model,
        stream: stream.unwrap_or(false),
        system: system.as_ref().and_then(extract_system_text),
        messages: canonical_messages,
        tools: decode_tools(tools),
        tools_field_present,
        tool_choice: decode_tool_choice(tool_choice.as_ref()),
        generation: GenerationParams {
            temperature,
            max_tokens: Some(max_tokens),
            top_p,
            stop: stop_sequences,
        },
        metadata,
    })
}

/// Decode one wire message. `tool_result` blocks lift out into dedicated
/// tool-role canonical messages (each carrying its `tool_call_id`); the
/// remaining blocks form the user/assistant message.
fn decode_message(
    role: &str,
    content: Value,
    out: &mut Vec<ChatMessage>,
) -> Result<(), GatewayError> {
    let role = anthropic_role_to_chat(role);
    let mut parts: smallvec::SmallVec<[MessagePart; 1]> = smallvec::SmallVec::new();
    let mut tool_results: Vec<(String, String)> = Vec::new();

    match content {
        Value::String(text) => {
            parts.push(MessagePart::Text(text));
        }
        Value::Array(blocks) => {
            for block in blocks {
                decode_block(block, &mut parts, &mut tool_results)?;
            }
        }
        other => {
            return Err(GatewayError::Protocol(format!(
                "message content must be a string or block array, got {other}"
            )));
        }
    }

    for (tool_call_id, content) in tool_results {
        let mut result_parts = smallvec::SmallVec::new();
        result_parts.push(MessagePart::ToolResult {
            tool_call_id: tool_call_id.clone(),
            content,
        });
        out.push(ChatMessage {
            role: ChatRole::Tool,
            parts: result_parts,
            name: None,
            tool_call_id: Some(tool_call_id),
        });
    }

    if !parts.is_empty() {
        out.push(ChatMessage {
            role,
            parts,
            name: None,
            tool_call_id: None,
        });
    }
    Ok(())
}

fn decode_block(
    block: Value,
    parts: &mut smallvec::SmallVec<[MessagePart; 1]>,
    tool_results: &mut Vec<(String, String)>,
) -> Result<(), GatewayError> {
    let block_type = block.get("type").and_then(Value::as_str).unwrap_or("text");
    match block_type {
        "text" | "input_text" | "output_text" => {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                // Adjacent text blocks flatten into a single part.
                if let Some(MessagePart::Text(existing)) = parts.last_mut() {
                    existing.push_str(text);
                } else {
                    parts.push(MessagePart::Text(text.to_string()));
                }
            }
        }
        "thinking" => {
            if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                parts.push(MessagePart::Reasoning(text.to_string()));
            }
        }
        "tool_use" => {
            let id = block
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::Protocol("tool_use block is missing 'id'".to_string())
                })?
                .to_string();
            let name = block
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::Protocol("tool_use block is missing 'name'".to_string())
                })?
                .to_string();
            let arguments =
                arguments_to_canonical(block.get("input").unwrap_or(&Value::Null));
            parts.push(MessagePart::ToolCall {
                id,
                name,
                arguments,
            });
        }
        "tool_result" => {
            let id = block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::Protocol("tool_result block is missing 'tool_use_id'".to_string())
                })?
                .to_string();
            let content = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(blocks)) => {
                    let mut text = String::new();
                    for inner in blocks {
                        if let Some(t) = inner.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    text
                }
                Some(other) => other.to_string(),
                None => String::new(),
            };
            tool_results.push((id, content));
        }
        "image" => {
            if let Some(url) = block
                .get("source")
                .and_then(|s| s.get("url"))
                .and_then(Value::as_str)
            {
                parts.push(MessagePart::ImageUrl {
                    url: url.to_string(),
                    detail: None,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

fn extract_system_text(system: &Value) -> Option<String> {
    match system {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let mut text = String::new();
            for block in blocks {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
            }
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn decode_tools(tools: Option<Vec<AnthropicTool>>) -> Vec<ToolSpec> {
    tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolSpec {
            function: ToolFunction {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            },
        })
        .collect()
}

fn decode_tool_choice(choice: Option<&Value>) -> ToolChoice {
    let Some(choice) = choice else {
        return ToolChoice::Auto;
    };
    match choice.get("type").and_then(Value::as_str) {
        Some("none") => ToolChoice::None,
        Some("any") => ToolChoice::Required,
        Some("tool") => choice
            .get("name")
            .and_then(Value::as_str)
            .map_or(ToolChoice::Auto, |name| {
                ToolChoice::Specific(name.to_string())
            }),
        _ => ToolChoice::Auto,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(body: Value) -> Result<ChatRequest, GatewayError> {
        let wire: AnthropicRequest = serde_json::from_value(body).unwrap();
        decode_messages_request(wire, "req_1".into(), RequestMetadata::default())
    }

    #[test]
    fn text_blocks_flatten_into_one_part() {
        let req = decode(json!({
            "model": "claude",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "a"},
                {"type": "input_text", "text": "b"}
            ]}]
        }))
        .unwrap();
        assert_eq!(req.messages[0].parts.len(), 1);
        assert_eq!(req.messages[0].joined_text(), "ab");
    }

    #[test]
    fn tool_use_lifts_into_tool_call_with_string_arguments() {
        let req = decode(json!({
            "model": "claude",
            "max_tokens": 256,
            "messages": [{"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                 "input": {"city": "SF"}}
            ]}]
        }))
        .unwrap();
        let MessagePart::ToolCall {
            id,
            name,
            arguments,
        } = &req.messages[0].parts[0]
        else {
            panic!("expected tool call");
        };
        assert_eq!(id, "toolu_1");
        assert_eq!(name, "get_weather");
        assert_eq!(arguments, "{\"city\":\"SF\"}");
    }

    #[test]
    fn tool_result_carries_call_id() {
        let req = decode(json!({
            "model": "claude",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "sunny"}
            ]}]
        }))
        .unwrap();
        assert_eq!(req.messages[0].tool_call_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn system_block_array_joins_lines() {
        let req = decode(json!({
            "model": "claude",
            "max_tokens": 10,
            "system": [{"type": "text", "text": "one"}, {"type": "text", "text": "two"}],
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(req.system.as_deref(), Some("one\ntwo"));
    }

    #[test]
    fn thinking_blocks_become_reasoning_parts() {
        let req = decode(json!({
            "model": "claude",
            "max_tokens": 10,
            "messages": [{"role": "assistant", "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "answer"}
            ]}]
        }))
        .unwrap();
        assert_eq!(
            req.messages[0].parts[0],
            MessagePart::Reasoning("hmm".into())
        );
    }

    #[test]
    fn tool_use_without_id_is_rejected() {
        let err = decode(json!({
            "model": "claude",
            "max_tokens": 10,
            "messages": [{"role": "assistant", "content": [
                {"type": "tool_use", "name": "f", "input": {}}
            ]}]
        }))
        .unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn anthropic_tool_choice_maps_to_canonical() {
        let req = decode(json!({
            "model": "claude",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "f", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "any"}
        }))
        .unwrap();
        assert_eq!(req.tool_choice, ToolChoice::Required);
        assert!(req.tools_field_present);
    }
}
