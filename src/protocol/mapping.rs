use super::canonical::{ChatRole, StopReason};

// ---------------------------------------------------------------------------
// Role mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn chat_role_to_openai(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

#[must_use]
pub fn openai_role_to_chat(s: &str) -> ChatRole {
    match s {
        "system" | "developer" => ChatRole::System,
        "assistant" => ChatRole::Assistant,
        "tool" => ChatRole::Tool,
        _ => ChatRole::User,
    }
}

#[must_use]
pub fn chat_role_to_anthropic(role: ChatRole) -> &'static str {
    match role {
        // System is top-level in the Anthropic shape; tool results travel in
        // user messages.
        ChatRole::System | ChatRole::User | ChatRole::Tool => "user",
        ChatRole::Assistant => "assistant",
    }
}

#[must_use]
pub fn anthropic_role_to_chat(s: &str) -> ChatRole {
    match s {
        "assistant" => ChatRole::Assistant,
        _ => ChatRole::User,
    }
}

#[must_use]
pub fn chat_role_to_gemini(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System | ChatRole::User => "user",
        ChatRole::Assistant => "model",
        ChatRole::Tool => "function",
    }
}

#[must_use]
pub fn gemini_role_to_chat(s: &str) -> ChatRole {
    match s {
        "model" => ChatRole::Assistant,
        "function" => ChatRole::Tool,
        _ => ChatRole::User,
    }
}

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn stop_reason_to_openai(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndOfTurn => "stop",
        StopReason::ToolCalls => "tool_calls",
        StopReason::MaxTokens => "length",
        StopReason::ContentFilter => "content_filter",
    }
}

#[must_use]
pub fn openai_stop_to_reason(s: &str) -> StopReason {
    match s {
        "tool_calls" | "function_call" => StopReason::ToolCalls,
        "length" => StopReason::MaxTokens,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::EndOfTurn,
    }
}

#[must_use]
pub fn stop_reason_to_anthropic(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndOfTurn | StopReason::ContentFilter => "end_turn",
        StopReason::ToolCalls => "tool_use",
        StopReason::MaxTokens => "max_tokens",
    }
}

#[must_use]
pub fn anthropic_stop_to_reason(s: &str) -> StopReason {
    match s {
        "tool_use" => StopReason::ToolCalls,
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::EndOfTurn,
    }
}

#[must_use]
pub fn gemini_finish_to_reason(s: &str) -> StopReason {
    match s {
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" => StopReason::ContentFilter,
        _ => StopReason::EndOfTurn,
    }
}

// ---------------------------------------------------------------------------
// <think> segmentation
// ---------------------------------------------------------------------------

/// Split a text body into (reasoning, visible) halves when it opens with a
/// `<think>…</think>` block. Providers that inline reasoning this way get it
/// lifted into a dedicated reasoning part so the reasoning policy can decide
/// whether the client sees it.
#[must_use]
pub fn split_think_block(text: &str) -> (Option<String>, String) {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix("<think>") else {
        return (None, text.to_string());
    };
    match rest.find("</think>") {
        Some(end) => {
            let reasoning = rest[..end].trim().to_string();
            let visible = rest[end + "</think>".len()..].trim_start().to_string();
            let reasoning = (!reasoning.is_empty()).then_some(reasoning);
            (reasoning, visible)
        }
        // Unterminated block: the whole body is reasoning.
        None => (Some(rest.trim().to_string()), String::new()),
    }
}
