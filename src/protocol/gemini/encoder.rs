use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{
    ChatRequest, ChatRole, MessagePart, TargetProtocol, ToolChoice,
};
use crate::protocol::mapping::chat_role_to_gemini;
use crate::toolcall::arguments_for_target;

use super::GeminiEnvelopeContext;

/// Encode a canonical request into the Cloud Code Assist envelope.
///
/// Top-level keys are exactly `{project, requestId, request, model,
/// userAgent, requestType}`; the generation payload lives under `request`.
///
/// # Errors
///
/// Returns [`GatewayError`] when a tool payload cannot be represented.
pub fn encode_envelope(
    canonical: &ChatRequest,
    model: &str,
    ctx: &GeminiEnvelopeContext,
) -> Result<Value, GatewayError> {
    let request = encode_inner_request(canonical)?;
    Ok(serde_json::json!({
        "project": ctx.project,
        "requestId": canonical.request_id,
        "request": request,
        "model": model,
        "userAgent": ctx.user_agent,
        "requestType": ctx.request_type,
    }))
}

/// Build the inner `request` payload (`contents`, `systemInstruction`,
/// `tools`, `toolConfig`, `generationConfig`).
///
/// # Errors
///
/// Returns [`GatewayError`] when a tool-call argument payload is invalid.
pub fn encode_inner_request(canonical: &ChatRequest) -> Result<Value, GatewayError> {
    let mut request = serde_json::Map::new();

    // Tool results need the original function name; Gemini has no call ids.
    let call_names: FxHashMap<&str, &str> = canonical
        .messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            MessagePart::ToolCall { id, name, .. } => Some((id.as_str(), name.as_str())),
            _ => None,
        })
        .collect();

    let mut contents: Vec<Value> = Vec::with_capacity(canonical.messages.len());
    for msg in &canonical.messages {
        if msg.role == ChatRole::System {
            continue;
        }
        let parts = encode_parts(&msg.parts, &call_names)?;
        if parts.is_empty() {
            continue;
        }
        contents.push(serde_json::json!({
            "role": chat_role_to_gemini(msg.role),
            "parts": parts,
        }));
    }
    request.insert("contents".to_string(), Value::Array(contents));

    if let Some(system) = &canonical.system {
        request.insert(
            "systemInstruction".to_string(),
            serde_json::json!({"parts": [{"text": system}]}),
        );
    }

    if !canonical.tools.is_empty() {
        let declarations: Vec<Value> = canonical
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": sanitize_schema(&t.function.parameters),
                })
            })
            .collect();
        request.insert(
            "tools".to_string(),
            serde_json::json!([{"functionDeclarations": declarations}]),
        );
        request.insert(
            "toolConfig".to_string(),
            encode_tool_config(&canonical.tool_choice),
        );
    }

    let mut generation = serde_json::Map::new();
    if let Some(temperature) = canonical.generation.temperature {
        generation.insert("temperature".to_string(), serde_json::json!(temperature));
    }
    if let Some(max_tokens) = canonical.generation.max_tokens {
        generation.insert("maxOutputTokens".to_string(), serde_json::json!(max_tokens));
    }
    if let Some(top_p) = canonical.generation.top_p {
        generation.insert("topP".to_string(), serde_json::json!(top_p));
    }
    if let Some(stop) = &canonical.generation.stop {
        generation.insert("stopSequences".to_string(), serde_json::json!(stop));
    }
    if !generation.is_empty() {
        request.insert("generationConfig".to_string(), Value::Object(generation));
    }

    Ok(Value::Object(request))
}

fn encode_parts(
    parts: &[MessagePart],
    call_names: &FxHashMap<&str, &str>,
) -> Result<Vec<Value>, GatewayError> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            MessagePart::Text(text) => {
                out.push(serde_json::json!({"text": text}));
            }
            // Reasoning is never replayed upstream in the Gemini shape.
            MessagePart::Reasoning(_) => {}
            MessagePart::ToolCall {
                name, arguments, ..
            } => {
                let args = arguments_for_target(arguments, name, TargetProtocol::Gemini)?;
                out.push(serde_json::json!({
                    "functionCall": {"name": name, "args": args},
                }));
            }
            MessagePart::ToolResult {
                tool_call_id,
                content,
            } => {
                let name = call_names.get(tool_call_id.as_str()).copied().unwrap_or("tool");
                let response: Value = serde_json::from_str(content)
                    .unwrap_or_else(|_| serde_json::json!({"output": content}));
                out.push(serde_json::json!({
                    "functionResponse": {"name": name, "response": response},
                }));
            }
            MessagePart::ImageUrl { url, .. } => {
                out.push(serde_json::json!({
                    "fileData": {"fileUri": url},
                }));
            }
        }
    }
    Ok(out)
}

fn encode_tool_config(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => serde_json::json!({"functionCallingConfig": {"mode": "AUTO"}}),
        ToolChoice::None => serde_json::json!({"functionCallingConfig": {"mode": "NONE"}}),
        ToolChoice::Required => serde_json::json!({"functionCallingConfig": {"mode": "ANY"}}),
        ToolChoice::Specific(name) => serde_json::json!({
            "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]},
        }),
    }
}

/// Gemini's schema dialect rejects several JSON Schema keywords that OpenAI
/// tools commonly carry; strip them recursively.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if matches!(
                    key.as_str(),
                    "additionalProperties" | "$schema" | "exclusiveMaximum" | "exclusiveMinimum"
                ) {
                    continue;
                }
                out.insert(key.clone(), sanitize_schema(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{
        ChatMessage, EntryProtocol, GenerationParams, RequestMetadata, ToolFunction, ToolSpec,
    };
    use crate::protocol::gemini::{FORBIDDEN_INNER_KEYS, FORBIDDEN_TOP_LEVEL_KEYS};

    fn ctx() -> GeminiEnvelopeContext {
        GeminiEnvelopeContext {
            project: "projects/p1".into(),
            user_agent: "routecodex".into(),
            request_type: "agent".into(),
        }
    }

    fn base_request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            request_id: "req_1".into(),
            entry: EntryProtocol::AnthropicMessages,
            model: "alias".into(),
            stream: false,
            system: Some("sys".into()),
            messages,
            tools: vec![ToolSpec {
                function: ToolFunction {
                    name: "get_weather".into(),
                    description: Some("weather".into()),
                    parameters: serde_json::json!({
                        "type": "object",
                        "properties": {"city": {"type": "string"}},
                        "additionalProperties": false
                    }),
                },
            }],
            tools_field_present: true,
            tool_choice: ToolChoice::Auto,
            generation: GenerationParams {
                max_tokens: Some(100),
                ..GenerationParams::default()
            },
            metadata: RequestMetadata::default(),
        }
    }

    #[test]
    fn envelope_top_level_keys_are_exact() {
        let envelope = encode_envelope(
            &base_request(vec![ChatMessage::text(ChatRole::User, "weather?")]),
            "gemini-3-pro",
            &ctx(),
        )
        .unwrap();
        let keys: Vec<&str> = envelope.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["project", "requestId", "request", "model", "userAgent", "requestType"]
        );
        for forbidden in FORBIDDEN_TOP_LEVEL_KEYS {
            assert!(envelope.get(forbidden).is_none(), "{forbidden} leaked");
        }
    }

    #[test]
    fn inner_request_has_no_forbidden_keys() {
        let envelope = encode_envelope(
            &base_request(vec![ChatMessage::text(ChatRole::User, "hi")]),
            "gemini-3-pro",
            &ctx(),
        )
        .unwrap();
        let inner = envelope["request"].as_object().unwrap();
        for forbidden in FORBIDDEN_INNER_KEYS {
            assert!(!inner.contains_key(*forbidden), "{forbidden} leaked");
        }
    }

    #[test]
    fn function_declarations_carry_tool_names() {
        let envelope = encode_envelope(
            &base_request(vec![ChatMessage::text(ChatRole::User, "weather?")]),
            "gemini-3-pro",
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            envelope["request"]["tools"][0]["functionDeclarations"][0]["name"],
            "get_weather"
        );
        // additionalProperties is stripped for Gemini's schema dialect.
        assert!(envelope["request"]["tools"][0]["functionDeclarations"][0]["parameters"]
            .get("additionalProperties")
            .is_none());
    }

    #[test]
    fn tool_results_bind_back_to_function_names() {
        let mut call = ChatMessage::text(ChatRole::Assistant, "");
        call.parts.clear();
        call.parts.push(MessagePart::ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: "{\"city\":\"SF\"}".into(),
        });
        let mut result = ChatMessage::text(ChatRole::Tool, "");
        result.parts.clear();
        result.parts.push(MessagePart::ToolResult {
            tool_call_id: "call_1".into(),
            content: "{\"weather\":\"sunny\"}".into(),
        });
        let inner =
            encode_inner_request(&base_request(vec![call, result])).unwrap();
        let parts = inner["contents"][1]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["functionResponse"]["name"], "get_weather");
        assert_eq!(parts[0]["functionResponse"]["response"]["weather"], "sunny");
    }

    #[test]
    fn array_arguments_wrap_into_items() {
        let mut call = ChatMessage::text(ChatRole::Assistant, "");
        call.parts.clear();
        call.parts.push(MessagePart::ToolCall {
            id: "call_1".into(),
            name: "batch".into(),
            arguments: "[\"a\",\"b\"]".into(),
        });
        let inner = encode_inner_request(&base_request(vec![call])).unwrap();
        assert_eq!(
            inner["contents"][0]["parts"][0]["functionCall"]["args"],
            serde_json::json!({"items": ["a", "b"]})
        );
    }
}
