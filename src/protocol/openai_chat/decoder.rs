use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{
    ChatMessage, ChatRequest, ChatRole, EntryProtocol, GenerationParams, MessagePart,
    RequestMetadata, ToolChoice, ToolFunction, ToolSpec,
};
use crate::protocol::mapping::openai_role_to_chat;
use crate::toolcall::arguments_to_canonical;

use super::{OpenAiChatRequest, OpenAiMessage, OpenAiStop, OpenAiTool, OpenAiToolChoice};

/// Decode an OpenAI Chat Completions wire request into the canonical form.
///
/// # Errors
///
/// Returns [`GatewayError::Protocol`] when a message violates the wire
/// contract (e.g. a tool message without `tool_call_id`).
pub fn decode_chat_request(
    request: OpenAiChatRequest,
    request_id: String,
    metadata: RequestMetadata,
) -> Result<ChatRequest, GatewayError> {
    let OpenAiChatRequest {
        model,
        messages,
        tools,
        tool_choice,
        stream,
        temperature,
        max_tokens,
        max_completion_tokens,
        top_p,
        stop,
        extra: _,
    } = request;

    let tools_field_present = tools.is_some();
    let (system, messages) = collect_messages(messages)?;

    Ok(ChatRequest {
        request_id,
        entry: EntryProtocol::OpenAiChat,
        model,
        stream: stream.unwrap_or(false),
        system,
        messages,
        tools: decode_tools(tools),
        tools_field_present,
        tool_choice: decode_tool_choice(tool_choice),
        generation: GenerationParams {
            temperature,
            max_tokens: max_tokens.or(max_completion_tokens),
            top_p,
            stop: decode_stop(stop),
        },
        metadata,
    })
}

fn collect_messages(
    messages: Vec<OpenAiMessage>,
) -> Result<(Option<String>, Vec<ChatMessage>), GatewayError> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());

    for msg in messages {
        let role = openai_role_to_chat(&msg.role);
        if role == ChatRole::System {
            if let Some(text) = extract_text_content(msg.content) {
                system_parts.push(text);
            }
            continue;
        }
        out.push(decode_message(role, msg)?);
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    Ok((system, out))
}

fn decode_message(role: ChatRole, msg: OpenAiMessage) -> Result<ChatMessage, GatewayError> {
    let mut parts = smallvec::SmallVec::new();

    if role == ChatRole::Tool {
        let tool_call_id = msg.tool_call_id.clone().ok_or_else(|| {
            GatewayError::Protocol("tool message is missing tool_call_id".to_string())
        })?;
        let content = extract_text_content(msg.content).unwrap_or_default();
        parts.push(MessagePart::ToolResult {
            tool_call_id: tool_call_id.clone(),
            content,
        });
        return Ok(ChatMessage {
            role,
            parts,
            name: msg.name,
            tool_call_id: Some(tool_call_id),
        });
    }

    if let Some(reasoning) = msg.reasoning_content.filter(|r| !r.is_empty()) {
        parts.push(MessagePart::Reasoning(reasoning));
    }
    if let Some(text) = extract_text_content(msg.content) {
        if !text.is_empty() {
            parts.push(MessagePart::Text(text));
        }
    }
    for call in msg.tool_calls.unwrap_or_default() {
        parts.push(MessagePart::ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: arguments_to_canonical(&call.function.arguments),
        });
    }

    Ok(ChatMessage {
        role,
        parts,
        name: msg.name,
        tool_call_id: msg.tool_call_id,
    })
}

/// Extract plain text from an OpenAI message content field (string or
/// content-part array).
fn extract_text_content(content: Option<Value>) -> Option<String> {
    match content {
        Some(Value::String(s)) => Some(s),
        Some(Value::Array(arr)) => {
            let mut text = String::new();
            for part in arr {
                if part.get("type").and_then(Value::as_str) != Some("text") {
                    continue;
                }
                if let Some(content) = part.get("text").and_then(Value::as_str) {
                    text.push_str(content);
                }
            }
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        None | Some(_) => None,
    }
}

fn decode_tools(tools: Option<Vec<OpenAiTool>>) -> Vec<ToolSpec> {
    tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolSpec {
            function: ToolFunction {
                name: t.function.name,
                description: t.function.description,
                parameters: t
                    .function
                    .parameters
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            },
        })
        .collect()
}

fn decode_tool_choice(choice: Option<OpenAiToolChoice>) -> ToolChoice {
    match choice {
        None => ToolChoice::Auto,
        Some(OpenAiToolChoice::Mode(mode)) => match mode.as_str() {
            "none" => ToolChoice::None,
            "required" => ToolChoice::Required,
            _ => ToolChoice::Auto,
        },
        Some(OpenAiToolChoice::Function(f)) => ToolChoice::Specific(f.function.name),
    }
}

fn decode_stop(stop: Option<OpenAiStop>) -> Option<Vec<String>> {
    match stop {
        None => None,
        Some(OpenAiStop::Single(s)) => Some(vec![s]),
        Some(OpenAiStop::Multi(v)) => Some(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(body: Value) -> Result<ChatRequest, GatewayError> {
        let wire: OpenAiChatRequest = serde_json::from_value(body).unwrap();
        decode_chat_request(wire, "req_1".into(), RequestMetadata::default())
    }

    #[test]
    fn system_messages_lift_into_system_prompt() {
        let req = decode(json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        }))
        .unwrap();
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, ChatRole::User);
    }

    #[test]
    fn tool_call_arguments_become_json_strings() {
        let req = decode(json!({
            "model": "gpt-4",
            "messages": [
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "f", "arguments": {"x": 1}}}
                ]}
            ]
        }))
        .unwrap();
        let MessagePart::ToolCall { arguments, .. } = &req.messages[0].parts[0] else {
            panic!("expected tool call");
        };
        assert_eq!(arguments, "{\"x\":1}");
    }

    #[test]
    fn tool_message_without_call_id_is_rejected() {
        let err = decode(json!({
            "model": "gpt-4",
            "messages": [{"role": "tool", "content": "result"}]
        }))
        .unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn tools_field_presence_is_tracked() {
        let with_empty = decode(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": []
        }))
        .unwrap();
        assert!(with_empty.tools_field_present);
        assert!(with_empty.tools.is_empty());

        let without = decode(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert!(!without.tools_field_present);
    }

    #[test]
    fn content_part_arrays_flatten_to_text() {
        let req = decode(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "a"},
                {"type": "text", "text": "b"}
            ]}]
        }))
        .unwrap();
        assert_eq!(req.messages[0].joined_text(), "ab");
    }

    #[test]
    fn max_completion_tokens_aliases_max_tokens() {
        let req = decode(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_completion_tokens": 128
        }))
        .unwrap();
        assert_eq!(req.generation.max_tokens, Some(128));
    }
}
