//! Provider HTTP failure classification.
//!
//! Maps status + parsed body into the gateway error taxonomy plus the
//! event fields the quota daemon dispatches on.

use serde_json::Value;

use crate::error::GatewayError;
use crate::quota::cooldown::{parse_compact_duration_ms, parse_reset_after_ms};
use crate::quota::events::codes;

use super::ProviderType;

/// A classified provider failure: the user-facing error plus the quota
/// event enrichment.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub error: GatewayError,
    pub code: Option<&'static str>,
    pub cooldown_ms: Option<u64>,
    pub details: Option<Value>,
}

const IFLOW_BLOCKED_MARKER: &str = "access to the current AK has been blocked";

/// Classify an HTTP failure response.
#[must_use]
pub fn classify_http_failure(
    provider_type: ProviderType,
    status: u16,
    body_text: &str,
    retry_after: Option<u64>,
) -> ProviderFailure {
    let body_json: Option<Value> = serde_json::from_str(body_text).ok();
    let message = provider_error_message(body_json.as_ref(), body_text);

    // iFlow hard-blocks an access key with a dedicated status.
    if status == 434 || (provider_type == ProviderType::IFlow && message.contains(IFLOW_BLOCKED_MARKER))
    {
        return ProviderFailure {
            error: GatewayError::UpstreamAuth {
                status,
                message: message.clone(),
            },
            code: Some(codes::IFLOW_BLOCKED),
            cooldown_ms: None,
            details: None,
        };
    }

    match status {
        429 => classify_rate_limited(&message, body_json.as_ref(), retry_after),
        401 | 402 | 403 => {
            if let Some(url) = verification_url(&message, body_json.as_ref()) {
                ProviderFailure {
                    error: GatewayError::UpstreamAuth {
                        status,
                        message: message.clone(),
                    },
                    code: Some(codes::VERIFICATION_REQUIRED),
                    cooldown_ms: None,
                    details: Some(serde_json::json!({"verificationUrl": url})),
                }
            } else {
                ProviderFailure {
                    error: GatewayError::UpstreamAuth { status, message },
                    code: None,
                    cooldown_ms: None,
                    details: None,
                }
            }
        }
        _ => ProviderFailure {
            error: GatewayError::UpstreamTransient { status, message },
            code: None,
            cooldown_ms: None,
            details: None,
        },
    }
}

fn classify_rate_limited(
    message: &str,
    body_json: Option<&Value>,
    retry_after: Option<u64>,
) -> ProviderFailure {
    // Quota depletion signals: an explicit quotaResetDelay field
    // ("3h22m41s") or a "reset after …" phrase in the message.
    let reset_delay = body_json
        .and_then(find_quota_reset_delay)
        .or_else(|| parse_reset_after_ms(message));

    if let Some(cooldown_ms) = reset_delay {
        return ProviderFailure {
            error: GatewayError::UpstreamQuota {
                message: message.to_string(),
                cooldown_ms: Some(cooldown_ms),
            },
            code: Some(codes::QUOTA_DEPLETED),
            cooldown_ms: Some(cooldown_ms),
            details: None,
        };
    }

    if message.to_ascii_lowercase().contains("quota") {
        return ProviderFailure {
            error: GatewayError::UpstreamQuota {
                message: message.to_string(),
                cooldown_ms: retry_after,
            },
            code: Some(codes::QUOTA_DEPLETED),
            cooldown_ms: retry_after,
            details: None,
        };
    }

    ProviderFailure {
        error: GatewayError::UpstreamCapacity {
            message: message.to_string(),
            cooldown_ms: retry_after,
        },
        code: None,
        cooldown_ms: retry_after,
        details: None,
    }
}

/// Search a 429 body for `quotaResetDelay` at any depth; Antigravity nests
/// it under error details.
fn find_quota_reset_delay(body: &Value) -> Option<u64> {
    match body {
        Value::Object(map) => {
            if let Some(raw) = map.get("quotaResetDelay").and_then(Value::as_str) {
                return parse_compact_duration_ms(raw);
            }
            map.values().find_map(find_quota_reset_delay)
        }
        Value::Array(items) => items.iter().find_map(find_quota_reset_delay),
        _ => None,
    }
}

fn verification_url(message: &str, body_json: Option<&Value>) -> Option<String> {
    if let Some(url) = body_json
        .and_then(|b| b.pointer("/error/details/verificationUrl"))
        .and_then(Value::as_str)
    {
        return Some(url.to_string());
    }
    let start = message.find("https://accounts.google.com")?;
    let rest = &message[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '"')
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn provider_error_message(body_json: Option<&Value>, body_text: &str) -> String {
    if let Some(body) = body_json {
        for pointer in ["/error/message", "/message", "/error"] {
            if let Some(message) = body.pointer(pointer).and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }
    let trimmed = body_text.trim();
    if trimmed.is_empty() {
        "provider returned an error with an empty body".to_string()
    } else {
        trimmed.chars().take(512).collect()
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP-date.
#[must_use]
pub fn parse_retry_after_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs * 1000);
    }
    let target = httpdate::parse_http_date(raw).ok()?;
    target
        .duration_since(std::time::SystemTime::now())
        .ok()
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iflow_blocked_is_fatal_for_quota() {
        let failure = classify_http_failure(
            ProviderType::IFlow,
            434,
            r#"{"message":"access to the current AK has been blocked"}"#,
            None,
        );
        assert_eq!(failure.code, Some(codes::IFLOW_BLOCKED));
        assert!(matches!(
            failure.error,
            GatewayError::UpstreamAuth { status: 434, .. }
        ));
    }

    #[test]
    fn reset_after_message_becomes_quota_depletion() {
        let failure = classify_http_failure(
            ProviderType::OpenAi,
            429,
            r#"{"error":{"message":"rate limited, reset after 1h30m"}}"#,
            None,
        );
        assert_eq!(failure.code, Some(codes::QUOTA_DEPLETED));
        assert_eq!(failure.cooldown_ms, Some(5_400_000));
    }

    #[test]
    fn nested_quota_reset_delay_is_found() {
        let failure = classify_http_failure(
            ProviderType::Antigravity,
            429,
            r#"{"error":{"details":[{"quotaResetDelay":"3h22m41s"}]}}"#,
            None,
        );
        assert_eq!(failure.code, Some(codes::QUOTA_DEPLETED));
        assert_eq!(failure.cooldown_ms, Some(12_161_000));
    }

    #[test]
    fn plain_429_is_capacity_with_retry_after() {
        let failure = classify_http_failure(
            ProviderType::OpenAi,
            429,
            r#"{"error":{"message":"model overloaded"}}"#,
            Some(30_000),
        );
        assert!(failure.code.is_none());
        assert_eq!(failure.cooldown_ms, Some(30_000));
        assert!(matches!(failure.error, GatewayError::UpstreamCapacity { .. }));
    }

    #[test]
    fn verification_url_is_surfaced_in_details() {
        let failure = classify_http_failure(
            ProviderType::Antigravity,
            403,
            r#"{"error":{"message":"verify at https://accounts.google.com/v/x before use"}}"#,
            None,
        );
        assert_eq!(failure.code, Some(codes::VERIFICATION_REQUIRED));
        assert_eq!(
            failure.details.unwrap()["verificationUrl"],
            "https://accounts.google.com/v/x"
        );
    }

    #[test]
    fn server_errors_are_transient() {
        let failure = classify_http_failure(ProviderType::Glm, 502, "bad gateway", None);
        assert!(matches!(
            failure.error,
            GatewayError::UpstreamTransient { status: 502, .. }
        ));
        assert!(failure.error.recoverable());
    }

    #[test]
    fn retry_after_seconds_parse() {
        assert_eq!(parse_retry_after_ms("30"), Some(30_000));
        assert!(parse_retry_after_ms("garbage").is_none());
    }
}
