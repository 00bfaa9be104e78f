//! Gemini / Antigravity Cloud Code Assist target codec.
//!
//! Gemini is outbound-only: no client speaks it to this gateway. The
//! outbound body is the Cloud Code Assist envelope
//! `{project, requestId, request, model, userAgent, requestType}` with the
//! generation payload nested under `request`.

pub mod encoder;
pub mod response_decoder;
pub mod stream;

use serde::{Deserialize, Serialize};

/// Keys that must never appear at the top level of the Cloud Code Assist
/// envelope; they belong inside `request`.
pub const FORBIDDEN_TOP_LEVEL_KEYS: &[&str] = &[
    "contents",
    "systemInstruction",
    "tools",
    "toolConfig",
    "generationConfig",
    "safetySettings",
];

/// Keys that must never appear inside the inner `request` payload.
pub const FORBIDDEN_INNER_KEYS: &[&str] =
    &["metadata", "action", "web_search", "stream", "sessionId"];

/// Per-target context needed to build the envelope.
#[derive(Debug, Clone)]
pub struct GeminiEnvelopeContext {
    pub project: String,
    pub user_agent: String,
    pub request_type: String,
}

/// Gemini response wire type (the inner payload; Cloud Code Assist wraps it
/// under a top-level `response` key, which the decoder unwraps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

/// A single candidate in a Gemini response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiCandidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Content block: role plus typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<serde_json::Value>,
}

/// Usage metadata in a Gemini response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

impl GeminiResponse {
    /// Deserialize from a provider body, unwrapping the Cloud Code Assist
    /// `{response: {…}}` envelope when present.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error when neither shape parses.
    pub fn from_provider_value(
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let inner = match value {
            serde_json::Value::Object(mut map) => match map.remove("response") {
                Some(inner @ serde_json::Value::Object(_)) => inner,
                _ => serde_json::Value::Object(map),
            },
            other => other,
        };
        serde_json::from_value(with_camel_case(inner))
    }
}

// Gemini emits camelCase; the serde derives above expect snake_case field
// names, so normalize the handful of top-level keys we read.
fn with_camel_case(value: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(mut map) = value else {
        return value;
    };
    for (from, to) in [
        ("usageMetadata", "usage_metadata"),
        ("modelVersion", "model_version"),
        ("responseId", "response_id"),
    ] {
        if let Some(v) = map.remove(from) {
            map.insert(to.to_string(), v);
        }
    }
    if let Some(serde_json::Value::Array(candidates)) = map.get_mut("candidates") {
        for candidate in candidates {
            if let serde_json::Value::Object(cmap) = candidate {
                if let Some(v) = cmap.remove("finishReason") {
                    cmap.insert("finish_reason".to_string(), v);
                }
            }
        }
    }
    if let Some(serde_json::Value::Object(umap)) = map.get_mut("usage_metadata") {
        for (from, to) in [
            ("promptTokenCount", "prompt_token_count"),
            ("candidatesTokenCount", "candidates_token_count"),
            ("totalTokenCount", "total_token_count"),
        ] {
            if let Some(v) = umap.remove(from) {
                umap.insert(to.to_string(), v);
            }
        }
    }
    serde_json::Value::Object(map)
}
