use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Which client-facing API the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryProtocol {
    OpenAiChat,
    OpenAiResponses,
    #[serde(rename = "anthropic-messages")]
    AnthropicMessages,
}

/// Which wire protocol the selected provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetProtocol {
    OpenAiChat,
    OpenAiResponses,
    #[serde(rename = "anthropic")]
    Anthropic,
    Gemini,
}

impl EntryProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntryProtocol::OpenAiChat => "openai-chat",
            EntryProtocol::OpenAiResponses => "openai-responses",
            EntryProtocol::AnthropicMessages => "anthropic-messages",
        }
    }
}

impl TargetProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TargetProtocol::OpenAiChat => "openai-chat",
            TargetProtocol::OpenAiResponses => "openai-responses",
            TargetProtocol::Anthropic => "anthropic",
            TargetProtocol::Gemini => "gemini",
        }
    }

    /// Parse an outbound-profile string from config.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "openai-chat" | "openai" => Some(TargetProtocol::OpenAiChat),
            "openai-responses" | "responses" => Some(TargetProtocol::OpenAiResponses),
            "anthropic" | "anthropic-messages" => Some(TargetProtocol::Anthropic),
            "gemini" | "antigravity" => Some(TargetProtocol::Gemini),
            _ => None,
        }
    }
}

/// Canonical message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    EndOfTurn,
    ToolCalls,
    MaxTokens,
    ContentFilter,
}

/// Tool choice specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Specific(String),
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// Generation parameters passed through to the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
}

/// A single part of a message's content.
///
/// Tool-call arguments are carried as a JSON string here; providers that
/// need object-shaped input (Anthropic, Gemini) re-parse at the outbound
/// stage, where array payloads also get their `{items:[…]}` wrap.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    Reasoning(String),
    ImageUrl {
        url: String,
        detail: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

/// A single message in the canonical conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub parts: SmallVec<[MessagePart; 1]>,
    pub name: Option<String>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    #[must_use]
    pub fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: smallvec::smallvec![MessagePart::Text(text.into())],
            name: None,
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolCall { .. }))
    }

    /// Concatenated plain-text content of this message.
    #[must_use]
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// A tool's function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// A tool specification in the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub function: ToolFunction,
}

/// Per-request metadata carried alongside the canonical payload.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub route_hint: Option<String>,
    pub session_id: Option<String>,
    pub api_key: Option<String>,
    pub process_mode: Option<String>,
}

/// The fully-decoded, provider-agnostic request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub request_id: String,
    pub entry: EntryProtocol,
    pub model: String,
    pub stream: bool,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// Whether the client sent a `tools` field at all. An empty `tools: []`
    /// is preserved on the Anthropic outbound iff this is set.
    pub tools_field_present: bool,
    pub tool_choice: ToolChoice,
    pub generation: GenerationParams,
    pub metadata: RequestMetadata,
}

impl ChatRequest {
    /// Plain text of the last user message, used by route classification.
    #[must_use]
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(ChatMessage::joined_text)
    }

    /// Total character count across system prompt and all text parts.
    #[must_use]
    pub fn text_char_count(&self) -> usize {
        let mut total = self.system.as_ref().map_or(0, String::len);
        for msg in &self.messages {
            for part in &msg.parts {
                match part {
                    MessagePart::Text(t) | MessagePart::Reasoning(t) => total += t.len(),
                    MessagePart::ToolCall { arguments, .. } => total += arguments.len(),
                    MessagePart::ToolResult { content, .. } => total += content.len(),
                    MessagePart::ImageUrl { .. } => {}
                }
            }
        }
        total
    }
}

/// The fully-decoded, provider-agnostic non-streaming response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<MessagePart>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ChatResponse {
    #[must_use]
    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.content
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// A single event in a canonical stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        role: ChatRole,
        model: String,
    },
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArgsDelta {
        index: usize,
        delta: String,
    },
    ToolCallEnd {
        index: usize,
    },
    Usage(Usage),
    MessageEnd {
        stop_reason: StopReason,
    },
    Done,
    Error {
        status: u16,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_text_skips_assistant_turns() {
        let req = ChatRequest {
            request_id: "r1".into(),
            entry: EntryProtocol::OpenAiChat,
            model: "m".into(),
            stream: false,
            system: None,
            messages: vec![
                ChatMessage::text(ChatRole::User, "first"),
                ChatMessage::text(ChatRole::Assistant, "reply"),
                ChatMessage::text(ChatRole::User, "second"),
            ],
            tools: vec![],
            tools_field_present: false,
            tool_choice: ToolChoice::Auto,
            generation: GenerationParams::default(),
            metadata: RequestMetadata::default(),
        };
        assert_eq!(req.last_user_text().as_deref(), Some("second"));
    }

    #[test]
    fn text_char_count_includes_tool_payloads() {
        let mut msg = ChatMessage::text(ChatRole::Assistant, "ab");
        msg.parts.push(MessagePart::ToolCall {
            id: "c1".into(),
            name: "f".into(),
            arguments: "{\"x\":1}".into(),
        });
        let req = ChatRequest {
            request_id: "r1".into(),
            entry: EntryProtocol::OpenAiChat,
            model: "m".into(),
            stream: false,
            system: Some("sys".into()),
            messages: vec![msg],
            tools: vec![],
            tools_field_present: false,
            tool_choice: ToolChoice::Auto,
            generation: GenerationParams::default(),
            metadata: RequestMetadata::default(),
        };
        assert_eq!(req.text_char_count(), 3 + 2 + 7);
    }
}
