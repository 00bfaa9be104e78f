use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChatRequest, ChatRole, MessagePart, ToolChoice};
use crate::protocol::mapping::chat_role_to_openai;

use super::{
    OpenAiChatRequest, OpenAiMessage, OpenAiStop, OpenAiTool, OpenAiToolCall,
    OpenAiToolCallFunction, OpenAiToolChoice, OpenAiToolChoiceFunction,
    OpenAiToolChoiceFunctionCall, OpenAiToolFunction,
};

/// Encode a canonical request into the OpenAI Chat Completions wire format.
///
/// `model` is the provider-side model id resolved by the router, which may
/// differ from the client-requested name.
///
/// # Errors
///
/// Returns [`GatewayError::InternalConversion`] when a canonical part cannot
/// be represented.
pub fn encode_chat_request(
    canonical: &ChatRequest,
    model: &str,
) -> Result<OpenAiChatRequest, GatewayError> {
    let mut messages = Vec::with_capacity(canonical.messages.len() + 1);
    if let Some(system) = &canonical.system {
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: Some(Value::String(system.clone())),
            name: None,
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
        });
    }
    for msg in &canonical.messages {
        encode_message(msg, &mut messages)?;
    }

    let tools = if canonical.tools.is_empty() {
        None
    } else {
        Some(
            canonical
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    type_: "function".to_string(),
                    function: OpenAiToolFunction {
                        name: t.function.name.clone(),
                        description: t.function.description.clone(),
                        parameters: Some(t.function.parameters.clone()),
                    },
                })
                .collect(),
        )
    };

    Ok(OpenAiChatRequest {
        model: model.to_string(),
        messages,
        tools,
        tool_choice: encode_tool_choice(&canonical.tool_choice, canonical.tools.is_empty()),
        stream: canonical.stream.then_some(true),
        temperature: canonical.generation.temperature,
        max_tokens: canonical.generation.max_tokens,
        max_completion_tokens: None,
        top_p: canonical.generation.top_p,
        stop: canonical.generation.stop.as_ref().map(|stops| {
            if stops.len() == 1 {
                OpenAiStop::Single(stops[0].clone())
            } else {
                OpenAiStop::Multi(stops.clone())
            }
        }),
        extra: serde_json::Map::new(),
    })
}

fn encode_message(
    msg: &crate::protocol::canonical::ChatMessage,
    out: &mut Vec<OpenAiMessage>,
) -> Result<(), GatewayError> {
    // Tool results each become their own `role: tool` wire message.
    if msg.role == ChatRole::Tool {
        for part in &msg.parts {
            if let MessagePart::ToolResult {
                tool_call_id,
                content,
            } = part
            {
                out.push(OpenAiMessage {
                    role: "tool".to_string(),
                    content: Some(Value::String(content.clone())),
                    name: msg.name.clone(),
                    reasoning_content: None,
                    tool_calls: None,
                    tool_call_id: Some(tool_call_id.clone()),
                });
            }
        }
        return Ok(());
    }

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

    for part in &msg.parts {
        match part {
            MessagePart::Text(t) => text.push_str(t),
            MessagePart::Reasoning(t) => reasoning.push_str(t),
            MessagePart::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(OpenAiToolCall {
                id: id.clone(),
                type_: "function".to_string(),
                function: OpenAiToolCallFunction {
                    name: name.clone(),
                    arguments: Value::String(arguments.clone()),
                },
            }),
            MessagePart::ToolResult { .. } => {
                return Err(GatewayError::InternalConversion(format!(
                    "tool result part on {:?} message",
                    msg.role
                )));
            }
            MessagePart::ImageUrl { url, detail } => {
                // Image parts force the content-array form; emit directly.
                out.push(OpenAiMessage {
                    role: chat_role_to_openai(msg.role).to_string(),
                    content: Some(serde_json::json!([{
                        "type": "image_url",
                        "image_url": {"url": url, "detail": detail},
                    }])),
                    name: msg.name.clone(),
                    reasoning_content: None,
                    tool_calls: None,
                    tool_call_id: None,
                });
                continue;
            }
        }
    }

    // Assistant tool-call turns carry content: null, never "".
    let content = if !text.is_empty() {
        Some(Value::String(text))
    } else if tool_calls.is_empty() {
        Some(Value::String(String::new()))
    } else {
        None
    };

    out.push(OpenAiMessage {
        role: chat_role_to_openai(msg.role).to_string(),
        content,
        name: msg.name.clone(),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: msg.tool_call_id.clone(),
    });
    Ok(())
}

fn encode_tool_choice(choice: &ToolChoice, tools_empty: bool) -> Option<OpenAiToolChoice> {
    if tools_empty {
        return None;
    }
    Some(match choice {
        ToolChoice::Auto => OpenAiToolChoice::Mode("auto".to_string()),
        ToolChoice::None => OpenAiToolChoice::Mode("none".to_string()),
        ToolChoice::Required => OpenAiToolChoice::Mode("required".to_string()),
        ToolChoice::Specific(name) => OpenAiToolChoice::Function(OpenAiToolChoiceFunctionCall {
            type_: "function".to_string(),
            function: OpenAiToolChoiceFunction { name: name.clone() },
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{
        ChatMessage, EntryProtocol, GenerationParams, RequestMetadata, ToolFunction, ToolSpec,
    };

    fn base_request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            request_id: "r1".into(),
            entry: EntryProtocol::OpenAiChat,
            model: "alias".into(),
            stream: false,
            system: None,
            messages,
            tools: vec![],
            tools_field_present: false,
            tool_choice: ToolChoice::Auto,
            generation: GenerationParams::default(),
            metadata: RequestMetadata::default(),
        }
    }

    #[test]
    fn assistant_tool_call_turn_has_null_content() {
        let mut msg = ChatMessage::text(ChatRole::Assistant, "");
        msg.parts.clear();
        msg.parts.push(MessagePart::ToolCall {
            id: "call_1".into(),
            name: "f".into(),
            arguments: "{}".into(),
        });
        let wire = encode_chat_request(&base_request(vec![msg]), "real-model").unwrap();
        assert!(wire.messages[0].content.is_none());
        assert_eq!(wire.messages[0].tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn router_model_overrides_client_model() {
        let wire = encode_chat_request(
            &base_request(vec![ChatMessage::text(ChatRole::User, "hi")]),
            "provider-model",
        )
        .unwrap();
        assert_eq!(wire.model, "provider-model");
    }

    #[test]
    fn tool_results_expand_to_tool_messages() {
        let mut msg = ChatMessage::text(ChatRole::Tool, "");
        msg.parts.clear();
        msg.parts.push(MessagePart::ToolResult {
            tool_call_id: "call_1".into(),
            content: "{\"ok\":true}".into(),
        });
        msg.parts.push(MessagePart::ToolResult {
            tool_call_id: "call_2".into(),
            content: "{}".into(),
        });
        let wire = encode_chat_request(&base_request(vec![msg]), "m").unwrap();
        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "tool");
        assert_eq!(wire.messages[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn tool_choice_omitted_without_tools() {
        let mut req = base_request(vec![ChatMessage::text(ChatRole::User, "hi")]);
        req.tool_choice = ToolChoice::Required;
        let wire = encode_chat_request(&req, "m").unwrap();
        assert!(wire.tool_choice.is_none());

        req.tools = vec![ToolSpec {
            function: ToolFunction {
                name: "f".into(),
                description: None,
                parameters: serde_json::json!({"type": "object"}),
            },
        }];
        let wire = encode_chat_request(&req, "m").unwrap();
        assert!(matches!(
            wire.tool_choice,
            Some(OpenAiToolChoice::Mode(ref m)) if m == "required"
        ));
    }
}
