//! Client-facing error payload shapes, one per ingress family.

use serde_json::{json, Value};

/// OpenAI-style error body used by both Chat Completions and Responses.
#[must_use]
pub fn openai_error_payload(code: &str, message: &str) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message,
            "type": openai_error_type(code),
        }
    })
}

/// Anthropic-style error body.
#[must_use]
pub fn anthropic_error_payload(code: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "code": code,
            "type": anthropic_error_type(code),
            "message": message,
        }
    })
}

fn openai_error_type(code: &str) -> &'static str {
    match code {
        "invalid_request_error" | "tool_payload_invalid" => "invalid_request_error",
        "authentication_error" | "upstream_auth" => "authentication_error",
        "upstream_quota_depleted" | "upstream_capacity" => "rate_limit_error",
        "no_available_provider" => "service_unavailable_error",
        _ => "server_error",
    }
}

fn anthropic_error_type(code: &str) -> &'static str {
    match code {
        "invalid_request_error" | "tool_payload_invalid" => "invalid_request_error",
        "authentication_error" | "upstream_auth" => "authentication_error",
        "upstream_quota_depleted" | "upstream_capacity" => "rate_limit_error",
        "no_available_provider" => "overloaded_error",
        _ => "api_error",
    }
}
