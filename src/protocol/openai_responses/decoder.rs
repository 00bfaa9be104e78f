use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{
    ChatMessage, ChatRequest, ChatRole, EntryProtocol, GenerationParams, MessagePart,
    RequestMetadata, ToolChoice, ToolFunction, ToolSpec,
};
use crate::protocol::mapping::openai_role_to_chat;
use crate::toolcall::arguments_to_canonical;

use super::{ResponsesRequest, ResponsesTool};

/// Decode an OpenAI Responses wire request into the canonical form.
///
/// # Errors
///
/// Returns [`GatewayError::Protocol`] when an input item is structurally
/// invalid.
pub fn decode_responses_request(
    request: ResponsesRequest,
    request_id: String,
    metadata: RequestMetadata,
) -> Result<ChatRequest, GatewayError> {
    let ResponsesRequest {
        model,
        input,
        instructions,
        tools,
        tool_choice,
        stream,
        temperature,
        max_output_tokens,
        top_p,
        previous_response_id: _,
        extra: _,
    } = request;

    let tools_field_present = tools.is_some();
    let messages = decode_input(input)?;

    Ok(ChatRequest {
        request_id,
        entry: EntryProtocol::OpenAiResponses,
        model,
        stream: stream.unwrap_or(false),
        system: instructions,
        messages,
        tools: decode_tools(tools),
        tools_field_present,
        tool_choice: decode_tool_choice(tool_choice.as_ref()),
        generation: GenerationParams {
            temperature,
            max_tokens: max_output_tokens,
            top_p,
            stop: None,
        },
        metadata,
    })
}

fn decode_input(input: Value) -> Result<Vec<ChatMessage>, GatewayError> {
    match input {
        Value::String(text) => Ok(vec![ChatMessage::text(ChatRole::User, text)]),
        Value::Array(items) => {
            let mut messages = Vec::with_capacity(items.len());
            for item in items {
                decode_input_item(item, &mut messages)?;
            }
            Ok(messages)
        }
        other => Err(GatewayError::Protocol(format!(
            "input must be a string or item array, got {other}"
        ))),
    }
}

fn decode_input_item(item: Value, out: &mut Vec<ChatMessage>) -> Result<(), GatewayError> {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("message");
    match item_type {
        "message" => {
            let role = openai_role_to_chat(
                item.get("role").and_then(Value::as_str).unwrap_or("user"),
            );
            let mut parts = smallvec::SmallVec::new();
            match item.get("content") {
                Some(Value::String(text)) => parts.push(MessagePart::Text(text.clone())),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        let block_type = block
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("input_text");
                        if matches!(block_type, "input_text" | "output_text" | "text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                if let Some(MessagePart::Text(existing)) = parts.last_mut() {
                                    existing.push_str(text);
                                } else {
                                    parts.push(MessagePart::Text(text.to_string()));
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
            out.push(ChatMessage {
                role,
                parts,
                name: None,
                tool_call_id: None,
            });
        }
        "function_call" => {
            let call_id = item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::Protocol("function_call item is missing 'call_id'".to_string())
                })?
                .to_string();
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::Protocol("function_call item is missing 'name'".to_string())
                })?
                .to_string();
            let arguments =
                arguments_to_canonical(item.get("arguments").unwrap_or(&Value::Null));
            let mut parts = smallvec::SmallVec::new();
            parts.push(MessagePart::ToolCall {
                id: call_id,
                name,
                arguments,
            });
            out.push(ChatMessage {
                role: ChatRole::Assistant,
                parts,
                name: None,
                tool_call_id: None,
            });
        }
        "function_call_output" => {
            let call_id = item
                .get("call_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::Protocol(
                        "function_call_output item is missing 'call_id'".to_string(),
                    )
                })?
                .to_string();
            let output = match item.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let mut parts = smallvec::SmallVec::new();
            parts.push(MessagePart::ToolResult {
                tool_call_id: call_id.clone(),
                content: output,
            });
            out.push(ChatMessage {
                role: ChatRole::Tool,
                parts,
                name: None,
                tool_call_id: Some(call_id),
            });
        }
        // Reasoning items from prior turns are history we pass through as
        // reasoning parts on an assistant message.
        "reasoning" => {
            let mut text = String::new();
            if let Some(Value::Array(blocks)) = item.get("content") {
                for block in blocks {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
            }
            if !text.is_empty() {
                let mut parts = smallvec::SmallVec::new();
                parts.push(MessagePart::Reasoning(text));
                out.push(ChatMessage {
                    role: ChatRole::Assistant,
                    parts,
                    name: None,
                    tool_call_id: None,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

fn decode_tools(tools: Option<Vec<ResponsesTool>>) -> Vec<ToolSpec> {
    tools
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.type_ == "function")
        .map(|t| ToolSpec {
            function: ToolFunction {
                name: t.name,
                description: t.description,
                parameters: t
                    .parameters
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            },
        })
        .collect()
}

fn decode_tool_choice(choice: Option<&Value>) -> ToolChoice {
    match choice {
        None => ToolChoice::Auto,
        Some(Value::String(mode)) => match mode.as_str() {
            "none" => ToolChoice::None,
            "required" => ToolChoice::Required,
            _ => ToolChoice::Auto,
        },
        Some(obj) => obj
            .get("name")
            .and_then(Value::as_str)
            .map_or(ToolChoice::Auto, |name| {
                ToolChoice::Specific(name.to_string())
            }),
    }
}
