use std::sync::atomic::AtomicU64;

use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChatResponse, MessagePart, StopReason, Usage};
use crate::protocol::mapping::gemini_finish_to_reason;
use crate::util::next_generated_id;

use super::GeminiResponse;

static CALL_ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Decode a Gemini provider response into the canonical form.
///
/// Gemini function calls carry no ids; fresh `call-…` ids are generated so
/// downstream tool results can bind to them.
///
/// # Errors
///
/// Returns [`GatewayError::InternalConversion`] when the response has no
/// candidates.
pub fn decode_gemini_response(response: GeminiResponse) -> Result<ChatResponse, GatewayError> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(GatewayError::InternalConversion(
            "gemini response has no candidates".to_string(),
        ));
    };

    let mut content: Vec<MessagePart> = Vec::new();
    let mut has_tool_calls = false;

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        decode_part(&part, &mut content, &mut has_tool_calls);
    }

    let stop_reason = match candidate.finish_reason.as_deref() {
        // Gemini reports STOP even for tool-call turns.
        Some(reason) if has_tool_calls && reason == "STOP" => StopReason::ToolCalls,
        Some(reason) => gemini_finish_to_reason(reason),
        None if has_tool_calls => StopReason::ToolCalls,
        None => StopReason::EndOfTurn,
    };

    Ok(ChatResponse {
        id: response
            .response_id
            .unwrap_or_else(|| next_generated_id("resp", &CALL_ID_SEQ)),
        model: response.model_version.unwrap_or_default(),
        content,
        stop_reason,
        usage: response.usage_metadata.map_or_else(Usage::default, |u| Usage {
            input_tokens: Some(u.prompt_token_count),
            output_tokens: Some(u.candidates_token_count),
            total_tokens: Some(u.total_token_count),
        }),
    })
}

pub(super) fn decode_part(
    part: &Value,
    content: &mut Vec<MessagePart>,
    has_tool_calls: &mut bool,
) {
    if let Some(text) = part.get("text").and_then(Value::as_str) {
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            content.push(MessagePart::Reasoning(text.to_string()));
        } else {
            content.push(MessagePart::Text(text.to_string()));
        }
        return;
    }
    if let Some(call) = part.get("functionCall") {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = call.get("args").cloned().unwrap_or(Value::Null);
        let arguments = if args.is_null() {
            "{}".to_string()
        } else {
            args.to_string()
        };
        *has_tool_calls = true;
        content.push(MessagePart::ToolCall {
            id: next_generated_id("call", &CALL_ID_SEQ),
            name,
            arguments,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn function_call_parts_get_generated_ids() {
        let wire = GeminiResponse::from_provider_value(json!({
            "response": {
                "candidates": [{"content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "SF"}}}
                ]}, "finishReason": "STOP"}]
            }
        }))
        .unwrap();
        let resp = decode_gemini_response(wire).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolCalls);
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.starts_with("call-"));
        assert_eq!(calls[0].1, "get_weather");
        assert_eq!(calls[0].2, "{\"city\":\"SF\"}");
    }

    #[test]
    fn thought_parts_become_reasoning() {
        let wire = GeminiResponse::from_provider_value(json!({
            "candidates": [{"content": {"parts": [
                {"text": "planning", "thought": true},
                {"text": "answer"}
            ]}, "finishReason": "STOP"}]
        }))
        .unwrap();
        let resp = decode_gemini_response(wire).unwrap();
        assert_eq!(resp.content[0], MessagePart::Reasoning("planning".into()));
        assert_eq!(resp.content[1], MessagePart::Text("answer".into()));
        assert_eq!(resp.stop_reason, StopReason::EndOfTurn);
    }

    #[test]
    fn no_candidates_is_a_conversion_error() {
        let wire = GeminiResponse::from_provider_value(json!({"candidates": []})).unwrap();
        assert!(matches!(
            decode_gemini_response(wire),
            Err(GatewayError::InternalConversion(_))
        ));
    }
}
