use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChatRequest, ChatRole, MessagePart, ToolChoice};
use crate::protocol::mapping::chat_role_to_openai;

use super::{ResponsesRequest, ResponsesTool};

/// Encode a canonical request into the OpenAI Responses wire format for an
/// upstream that speaks Responses natively.
///
/// # Errors
///
/// Returns [`GatewayError::InternalConversion`] when a canonical part cannot
/// be represented.
pub fn encode_responses_request(
    canonical: &ChatRequest,
    model: &str,
) -> Result<ResponsesRequest, GatewayError> {
    let mut input: Vec<Value> = Vec::with_capacity(canonical.messages.len());

    for msg in &canonical.messages {
        encode_message_items(msg, &mut input)?;
    }

    let tools = if canonical.tools.is_empty() {
        None
    } else {
        Some(
            canonical
                .tools
                .iter()
                .map(|t| ResponsesTool {
                    type_: "function".to_string(),
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: Some(t.function.parameters.clone()),
                })
                .collect(),
        )
    };

    Ok(ResponsesRequest {
        model: model.to_string(),
        input: Value::Array(input),
        instructions: canonical.system.clone(),
        tools,
        tool_choice: encode_tool_choice(&canonical.tool_choice, canonical.tools.is_empty()),
        stream: canonical.stream.then_some(true),
        temperature: canonical.generation.temperature,
        max_output_tokens: canonical.generation.max_tokens,
        top_p: canonical.generation.top_p,
        previous_response_id: None,
        extra: serde_json::Map::new(),
    })
}

fn encode_message_items(
    msg: &crate::protocol::canonical::ChatMessage,
    out: &mut Vec<Value>,
) -> Result<(), GatewayError> {
    let mut text_blocks: Vec<Value> = Vec::new();

    let text_type = if msg.role == ChatRole::Assistant {
        "output_text"
    } else {
        "input_text"
    };

    for part in &msg.parts {
        match part {
            MessagePart::Text(text) => {
                text_blocks.push(serde_json::json!({"type": text_type, "text": text}));
            }
            // Reasoning from history is not replayed to Responses upstreams.
            MessagePart::Reasoning(_) => {}
            MessagePart::ToolCall {
                id,
                name,
                arguments,
            } => {
                out.push(serde_json::json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": arguments,
                }));
            }
            MessagePart::ToolResult {
                tool_call_id,
                content,
            } => {
                out.push(serde_json::json!({
                    "type": "function_call_output",
                    "call_id": tool_call_id,
                    "output": content,
                }));
            }
            MessagePart::ImageUrl { url, .. } => {
                text_blocks.push(serde_json::json!({
                    "type": "input_image",
                    "image_url": url,
                }));
            }
        }
    }

    if !text_blocks.is_empty() {
        out.push(serde_json::json!({
            "type": "message",
            "role": chat_role_to_openai(msg.role),
            "content": text_blocks,
        }));
    }
    Ok(())
}

fn encode_tool_choice(choice: &ToolChoice, tools_empty: bool) -> Option<Value> {
    if tools_empty {
        return None;
    }
    Some(match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Required => Value::String("required".to_string()),
        ToolChoice::Specific(name) => {
            serde_json::json!({"type": "function", "name": name})
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{
        ChatMessage, EntryProtocol, GenerationParams, RequestMetadata,
    };

    fn base_request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            request_id: "r1".into(),
            entry: EntryProtocol::OpenAiResponses,
            model: "alias".into(),
            stream: false,
            system: Some("sys".into()),
            messages,
            tools: vec![],
            tools_field_present: false,
            tool_choice: ToolChoice::Auto,
            generation: GenerationParams::default(),
            metadata: RequestMetadata::default(),
        }
    }

    #[test]
    fn user_and_assistant_text_use_matching_block_types() {
        let wire = encode_responses_request(
            &base_request(vec![
                ChatMessage::text(ChatRole::User, "q"),
                ChatMessage::text(ChatRole::Assistant, "a"),
            ]),
            "m",
        )
        .unwrap();
        let items = wire.input.as_array().unwrap();
        assert_eq!(items[0]["content"][0]["type"], "input_text");
        assert_eq!(items[1]["content"][0]["type"], "output_text");
        assert_eq!(wire.instructions.as_deref(), Some("sys"));
    }

    #[test]
    fn tool_round_trip_items_are_emitted() {
        let mut call = ChatMessage::text(ChatRole::Assistant, "");
        call.parts.clear();
        call.parts.push(MessagePart::ToolCall {
            id: "call_1".into(),
            name: "f".into(),
            arguments: "{}".into(),
        });
        let mut result = ChatMessage::text(ChatRole::Tool, "");
        result.parts.clear();
        result.parts.push(MessagePart::ToolResult {
            tool_call_id: "call_1".into(),
            content: "ok".into(),
        });
        let wire = encode_responses_request(&base_request(vec![call, result]), "m").unwrap();
        let items = wire.input.as_array().unwrap();
        assert_eq!(items[0]["type"], "function_call");
        assert_eq!(items[1]["type"], "function_call_output");
        assert_eq!(items[1]["call_id"], "call_1");
    }
}
