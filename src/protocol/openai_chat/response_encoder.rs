use serde_json::Value;

use crate::protocol::canonical::{ChatResponse, MessagePart};
use crate::protocol::mapping::stop_reason_to_openai;
use crate::util::unix_now_secs;

use super::{
    OpenAiChatResponse, OpenAiChoice, OpenAiMessage, OpenAiToolCall, OpenAiToolCallFunction,
    OpenAiUsage,
};

/// Encode a canonical response into an OpenAI Chat Completions client body.
#[must_use]
pub fn encode_chat_response(canonical: &ChatResponse) -> OpenAiChatResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

    for part in &canonical.content {
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
            MessagePart::ToolResult { .. } | MessagePart::ImageUrl { .. } => {}
        }
    }

    let content = if !text.is_empty() {
        Some(Value::String(text))
    } else if tool_calls.is_empty() {
        Some(Value::String(String::new()))
    } else {
        None
    };

    OpenAiChatResponse {
        id: canonical.id.clone(),
        object: "chat.completion".to_string(),
        created: Some(unix_now_secs()),
        model: canonical.model.clone(),
        choices: vec![OpenAiChoice {
            index: 0,
            message: OpenAiMessage {
                role: "assistant".to_string(),
                content,
                name: None,
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            },
            finish_reason: Some(stop_reason_to_openai(canonical.stop_reason).to_string()),
        }],
        usage: match (
            canonical.usage.input_tokens,
            canonical.usage.output_tokens,
        ) {
            (None, None) => None,
            (input, output) => Some(OpenAiUsage {
                prompt_tokens: input.unwrap_or(0),
                completion_tokens: output.unwrap_or(0),
                total_tokens: canonical
                    .usage
                    .total_tokens
                    .unwrap_or(input.unwrap_or(0) + output.unwrap_or(0)),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{StopReason, Usage};

    #[test]
    fn tool_call_response_encodes_null_content_and_finish_reason() {
        let canonical = ChatResponse {
            id: "chatcmpl-1".into(),
            model: "gpt-4".into(),
            content: vec![MessagePart::ToolCall {
                id: "call_1".into(),
                name: "f".into(),
                arguments: "{\"a\":1}".into(),
            }],
            stop_reason: StopReason::ToolCalls,
            usage: Usage::default(),
        };
        let wire = encode_chat_response(&canonical);
        assert!(wire.choices[0].message.content.is_none());
        assert_eq!(
            wire.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
        assert!(wire.usage.is_none());
    }

    #[test]
    fn usage_total_is_derived_when_missing() {
        let canonical = ChatResponse {
            id: "c".into(),
            model: "m".into(),
            content: vec![MessagePart::Text("hi".into())],
            stop_reason: StopReason::EndOfTurn,
            usage: Usage {
                input_tokens: Some(10),
                output_tokens: Some(5),
                total_tokens: None,
            },
        };
        let wire = encode_chat_response(&canonical);
        assert_eq!(wire.usage.unwrap().total_tokens, 15);
    }
}
