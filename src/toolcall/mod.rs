//! Structural repair of tool-call payloads.
//!
//! The pipeline never parses or rewrites tool-call semantics; this module
//! only fixes shape: arguments become a non-empty JSON string at the
//! canonical level, array payloads are wrapped for providers that forbid
//! top-level arrays, and apply_patch bodies are validated before send.

pub mod apply_patch;

use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChatRequest, MessagePart, TargetProtocol};

/// Coerce a wire-level `function.arguments` value into the canonical JSON
/// string form. Strings pass through (empty becomes `{}`); objects and
/// arrays are re-serialized; null becomes `{}`.
#[must_use]
pub fn arguments_to_canonical(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.trim().is_empty() {
                "{}".to_string()
            } else {
                s.clone()
            }
        }
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// Parse canonical argument text into the value shape a target expects.
///
/// Top-level arrays are wrapped as `{items:[…]}` for Gemini and Anthropic,
/// which reject non-object tool input; OpenAI-family targets keep raw
/// arrays.
///
/// # Errors
///
/// Returns [`GatewayError::ToolPayloadInvalid`] when the text is not valid
/// JSON.
pub fn arguments_for_target(
    arguments: &str,
    tool_name: &str,
    target: TargetProtocol,
) -> Result<Value, GatewayError> {
    let trimmed = arguments.trim();
    let text = if trimmed.is_empty() { "{}" } else { trimmed };
    let parsed: Value = serde_json::from_str(text).map_err(|e| {
        GatewayError::ToolPayloadInvalid(format!(
            "tool '{tool_name}': arguments are not valid JSON: {e}"
        ))
    })?;

    if parsed.is_array() && wraps_top_level_arrays(target) {
        return Ok(serde_json::json!({ "items": parsed }));
    }
    Ok(parsed)
}

#[inline]
#[must_use]
fn wraps_top_level_arrays(target: TargetProtocol) -> bool {
    matches!(target, TargetProtocol::Gemini | TargetProtocol::Anthropic)
}

/// Outbound tool-call guard, run after the outbound codec has been chosen
/// but before the provider body is built.
///
/// Ensures every tool-call part carries non-empty, parseable arguments and
/// that apply_patch bodies are well-formed. Historical tool messages are
/// never dropped or rewritten.
///
/// # Errors
///
/// Returns [`GatewayError::ToolPayloadInvalid`] on structural failures.
pub fn repair_outbound_tool_calls(
    request: &mut ChatRequest,
    target: TargetProtocol,
) -> Result<(), GatewayError> {
    for message in &mut request.messages {
        for part in &mut message.parts {
            let MessagePart::ToolCall {
                name, arguments, ..
            } = part
            else {
                continue;
            };

            if arguments.trim().is_empty() {
                "{}".clone_into(arguments);
            }
            // Parse once up front so a malformed payload fails the request
            // instead of producing a provider 4xx.
            let parsed = arguments_for_target(arguments, name, target)?;
            if name == "apply_patch" {
                validate_apply_patch_arguments(&parsed)?;
            }
        }
    }
    Ok(())
}

/// Extract the patch body from apply_patch arguments and validate it.
///
/// Accepts both the `{patch:"…"}` and `{input:"…"}` spellings seen across
/// clients.
///
/// # Errors
///
/// Returns [`GatewayError::ToolPayloadInvalid`] when no patch body is
/// present or the body fails envelope/hunk validation.
pub fn validate_apply_patch_arguments(arguments: &Value) -> Result<(), GatewayError> {
    let body = arguments
        .get("patch")
        .or_else(|| arguments.get("input"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GatewayError::ToolPayloadInvalid(
                "apply_patch: arguments carry no 'patch' string".to_string(),
            )
        })?;
    apply_patch::validate_patch(body)
        .map_err(|e| GatewayError::ToolPayloadInvalid(format!("apply_patch: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{
        ChatMessage, ChatRole, EntryProtocol, GenerationParams, RequestMetadata, ToolChoice,
    };
    use serde_json::json;

    fn request_with_tool_call(arguments: &str) -> ChatRequest {
        let mut msg = ChatMessage::text(ChatRole::Assistant, "");
        msg.parts.clear();
        msg.parts.push(MessagePart::ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: arguments.into(),
        });
        ChatRequest {
            request_id: "r1".into(),
            entry: EntryProtocol::OpenAiChat,
            model: "m".into(),
            stream: false,
            system: None,
            messages: vec![msg],
            tools: vec![],
            tools_field_present: false,
            tool_choice: ToolChoice::Auto,
            generation: GenerationParams::default(),
            metadata: RequestMetadata::default(),
        }
    }

    #[test]
    fn string_arguments_pass_through() {
        assert_eq!(arguments_to_canonical(&json!("{\"a\":1}")), "{\"a\":1}");
        assert_eq!(arguments_to_canonical(&json!("")), "{}");
        assert_eq!(arguments_to_canonical(&Value::Null), "{}");
    }

    #[test]
    fn object_arguments_are_serialized() {
        assert_eq!(arguments_to_canonical(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn arrays_wrap_only_for_gemini_and_anthropic() {
        let wrapped = arguments_for_target("[1,2]", "t", TargetProtocol::Gemini).unwrap();
        assert_eq!(wrapped, json!({"items": [1, 2]}));
        let wrapped = arguments_for_target("[1,2]", "t", TargetProtocol::Anthropic).unwrap();
        assert_eq!(wrapped, json!({"items": [1, 2]}));
        let raw = arguments_for_target("[1,2]", "t", TargetProtocol::OpenAiChat).unwrap();
        assert_eq!(raw, json!([1, 2]));
    }

    #[test]
    fn invalid_json_arguments_fail_repair() {
        let mut req = request_with_tool_call("not json");
        let err = repair_outbound_tool_calls(&mut req, TargetProtocol::OpenAiChat).unwrap_err();
        assert!(matches!(err, GatewayError::ToolPayloadInvalid(_)));
    }

    #[test]
    fn empty_arguments_are_repaired_to_empty_object() {
        let mut req = request_with_tool_call("  ");
        repair_outbound_tool_calls(&mut req, TargetProtocol::OpenAiChat).unwrap();
        let MessagePart::ToolCall { arguments, .. } = &req.messages[0].parts[0] else {
            panic!("expected tool call");
        };
        assert_eq!(arguments, "{}");
    }

    #[test]
    fn apply_patch_arguments_are_validated() {
        let good = json!({"patch": "*** Begin Patch\n*** Add File: a.txt\n+hello\n*** End Patch"});
        assert!(validate_apply_patch_arguments(&good).is_ok());

        let bad = json!({"patch": "no markers"});
        assert!(validate_apply_patch_arguments(&bad).is_err());

        let missing = json!({"other": 1});
        assert!(validate_apply_patch_arguments(&missing).is_err());
    }
}
