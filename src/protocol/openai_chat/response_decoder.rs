use crate::error::GatewayError;
use crate::protocol::canonical::{ChatResponse, MessagePart, StopReason, Usage};
use crate::protocol::mapping::{openai_stop_to_reason, split_think_block};
use crate::toolcall::arguments_to_canonical;

use super::OpenAiChatResponse;

/// Decode an OpenAI Chat Completions provider response into the canonical
/// form. Only the first choice is considered; this gateway never requests
/// `n > 1`.
///
/// # Errors
///
/// Returns [`GatewayError::InternalConversion`] when the response carries no
/// choices.
pub fn decode_chat_response(response: OpenAiChatResponse) -> Result<ChatResponse, GatewayError> {
    let OpenAiChatResponse {
        id,
        model,
        choices,
        usage,
        ..
    } = response;

    let Some(choice) = choices.into_iter().next() else {
        return Err(GatewayError::InternalConversion(
            "provider chat response has no choices".to_string(),
        ));
    };

    let mut content: Vec<MessagePart> = Vec::new();

    if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
        content.push(MessagePart::Reasoning(reasoning));
    }
    if let Some(serde_json::Value::String(text)) = choice.message.content {
        // Providers without a reasoning_content channel inline <think> blocks.
        let (reasoning, visible) = split_think_block(&text);
        if let Some(reasoning) = reasoning {
            content.push(MessagePart::Reasoning(reasoning));
        }
        if !visible.is_empty() {
            content.push(MessagePart::Text(visible));
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        content.push(MessagePart::ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: arguments_to_canonical(&call.function.arguments),
        });
    }

    let stop_reason = choice
        .finish_reason
        .as_deref()
        .map_or(StopReason::EndOfTurn, openai_stop_to_reason);

    Ok(ChatResponse {
        id,
        model,
        content,
        stop_reason,
        usage: usage.map_or_else(Usage::default, |u| Usage {
            input_tokens: Some(u.prompt_tokens),
            output_tokens: Some(u.completion_tokens),
            total_tokens: Some(u.total_tokens),
        }),
    })
}
