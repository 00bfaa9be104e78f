//! Provider adapter layer.
//!
//! One adapter shape covers every provider type: auth injection, endpoint
//! construction, a single HTTP send per attempt, and failure
//! classification. The `mock` provider type short-circuits the network and
//! fabricates OpenAI-shaped replies for tests and dry runs.

pub mod auth;
pub mod classify;
pub mod transport;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::TargetProtocol;
use crate::protocol::gemini::GeminiEnvelopeContext;
use crate::quota::ProviderKey;
use crate::stream::{sse_event_stream, SseEvent};

use auth::{resolve_auth, AuthSpec};
use classify::{classify_http_failure, parse_retry_after_ms, ProviderFailure};
use transport::HttpTransport;

/// The provider families this gateway speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Gemini,
    Antigravity,
    IFlow,
    Glm,
    Qwen,
    LmStudio,
    Mock,
}

impl ProviderType {
    /// The wire protocol this provider family speaks by default; config may
    /// override per target.
    #[must_use]
    pub fn default_outbound_profile(self) -> TargetProtocol {
        match self {
            ProviderType::Anthropic => TargetProtocol::Anthropic,
            ProviderType::Gemini | ProviderType::Antigravity => TargetProtocol::Gemini,
            _ => TargetProtocol::OpenAiChat,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Gemini => "gemini",
            ProviderType::Antigravity => "antigravity",
            ProviderType::IFlow => "iflow",
            ProviderType::Glm => "glm",
            ProviderType::Qwen => "qwen",
            ProviderType::LmStudio => "lmstudio",
            ProviderType::Mock => "mock",
        }
    }
}

/// A fully-resolved provider+model target, built once at config bootstrap.
#[derive(Debug, Clone)]
pub struct Target {
    pub provider_key: ProviderKey,
    pub provider_type: ProviderType,
    pub outbound_profile: TargetProtocol,
    pub compatibility_profile: Option<String>,
    pub runtime_key: String,
    /// Base endpoint, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    pub auth: AuthSpec,
    pub default_model: String,
    pub proxy: Option<String>,
}

/// A failed attempt: the user-facing error plus quota-event enrichment.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub error: GatewayError,
    pub code: Option<String>,
    pub cooldown_ms: Option<u64>,
    pub details: Option<Value>,
    pub stage: Option<&'static str>,
}

impl AttemptFailure {
    fn from_classified(failure: ProviderFailure) -> Self {
        Self {
            error: failure.error,
            code: failure.code.map(str::to_string),
            cooldown_ms: failure.cooldown_ms,
            details: failure.details,
            stage: None,
        }
    }

    fn auth(error: GatewayError) -> Self {
        Self {
            error,
            code: None,
            cooldown_ms: None,
            details: None,
            stage: Some("auth"),
        }
    }

    fn transport(message: String) -> Self {
        Self {
            // Connection-level failures carry a synthetic 599.
            error: GatewayError::UpstreamTransient {
                status: 599,
                message,
            },
            code: None,
            cooldown_ms: None,
            details: None,
            stage: Some("transport"),
        }
    }
}

/// Everything needed for one send: resolved auth, final URL, and the Gemini
/// envelope context when the target speaks Cloud Code Assist.
#[derive(Debug, Clone)]
pub struct PreparedSend {
    pub url: String,
    pub headers: http::HeaderMap,
    pub gemini_ctx: Option<GeminiEnvelopeContext>,
    pub proxy: Option<String>,
    pub provider_type: ProviderType,
}

const USER_AGENT: &str = concat!("routecodex/", env!("CARGO_PKG_VERSION"));

/// The adapter shared by all provider types.
pub struct ProviderAdapter {
    transport: HttpTransport,
}

impl ProviderAdapter {
    #[must_use]
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    /// Resolve auth and build the send URL. Token files are read here, so
    /// this is a suspension-point-adjacent step the executor runs per
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns an [`AttemptFailure`] with `stage = "auth"` when auth
    /// material cannot be resolved.
    pub fn prepare(&self, target: &Target, stream: bool) -> Result<PreparedSend, AttemptFailure> {
        if target.provider_type == ProviderType::Mock {
            return Ok(PreparedSend {
                url: String::new(),
                headers: http::HeaderMap::new(),
                gemini_ctx: None,
                proxy: None,
                provider_type: ProviderType::Mock,
            });
        }

        let resolved =
            resolve_auth(&target.auth, target.provider_type).map_err(AttemptFailure::auth)?;

        let gemini_ctx = if target.outbound_profile == TargetProtocol::Gemini {
            let project = resolved.project.clone().ok_or_else(|| {
                AttemptFailure::auth(GatewayError::UpstreamAuth {
                    status: 401,
                    message: format!(
                        "target {} has no Cloud project id",
                        target.provider_key
                    ),
                })
            })?;
            Some(GeminiEnvelopeContext {
                project,
                user_agent: USER_AGENT.to_string(),
                request_type: "agent".to_string(),
            })
        } else {
            None
        };

        Ok(PreparedSend {
            url: build_url(target, stream),
            headers: resolved.headers,
            gemini_ctx,
            proxy: target.proxy.clone(),
            provider_type: target.provider_type,
        })
    }

    /// One unary HTTP send; no in-target retry.
    ///
    /// # Errors
    ///
    /// Returns a classified [`AttemptFailure`] on HTTP or transport errors.
    pub async fn send_unary(
        &self,
        prepared: &PreparedSend,
        body: &Value,
    ) -> Result<Value, AttemptFailure> {
        if prepared.provider_type == ProviderType::Mock {
            return mock_unary_result(body);
        }

        let client = self
            .transport
            .unary_client(prepared.proxy.as_deref())
            .map_err(|e| AttemptFailure::transport(e.to_string()))?;
        let response = client
            .post(&prepared.url)
            .headers(prepared.headers.clone())
            .header(http::header::USER_AGENT, USER_AGENT)
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptFailure::transport(e.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| AttemptFailure::transport(format!("body read failed: {e}")));
        }

        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after_ms);
        let body_text = response.text().await.unwrap_or_default();
        Err(AttemptFailure::from_classified(classify_http_failure(
            prepared.provider_type,
            status,
            &body_text,
            retry_after,
        )))
    }

    /// One streaming HTTP send; yields a lazy, finite, non-restartable
    /// frame sequence. Dropping the stream aborts the underlying request.
    ///
    /// # Errors
    ///
    /// Returns a classified [`AttemptFailure`] when the response status is
    /// not success (failover is still possible at this point).
    pub async fn send_stream(
        &self,
        prepared: &PreparedSend,
        body: &Value,
    ) -> Result<BoxStream<'static, SseEvent>, AttemptFailure> {
        if prepared.provider_type == ProviderType::Mock {
            return Ok(mock_stream_response(body));
        }

        let client = self
            .transport
            .stream_client(prepared.proxy.as_deref())
            .map_err(|e| AttemptFailure::transport(e.to_string()))?;
        let response = client
            .post(&prepared.url)
            .headers(prepared.headers.clone())
            .header(http::header::USER_AGENT, USER_AGENT)
            .header(http::header::ACCEPT, "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptFailure::transport(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(http::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after_ms);
            let body_text = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::from_classified(classify_http_failure(
                prepared.provider_type,
                status,
                &body_text,
                retry_after,
            )));
        }

        Ok(sse_event_stream(response.bytes_stream()).boxed())
    }
}

fn build_url(target: &Target, stream: bool) -> String {
    let base = target.endpoint.trim_end_matches('/');
    match target.outbound_profile {
        TargetProtocol::OpenAiChat => format!("{base}/chat/completions"),
        TargetProtocol::OpenAiResponses => format!("{base}/responses"),
        TargetProtocol::Anthropic => format!("{base}/messages"),
        TargetProtocol::Gemini => {
            if stream {
                format!("{base}:streamGenerateContent?alt=sse")
            } else {
                format!("{base}:generateContent")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// Mock sends succeed with a canned reply; model names shaped
/// `error-<status>` fabricate a classified HTTP failure instead, which the
/// failover tests lean on.
fn mock_unary_result(body: &Value) -> Result<Value, AttemptFailure> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock-model");
    if let Some(status) = model
        .strip_prefix("error-")
        .and_then(|s| s.parse::<u16>().ok())
    {
        return Err(AttemptFailure::from_classified(classify_http_failure(
            ProviderType::Mock,
            status,
            &format!("{{\"error\":{{\"message\":\"mock {status}\"}}}}"),
            None,
        )));
    }
    Ok(mock_unary_response(body))
}

fn mock_unary_response(body: &Value) -> Value {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock-model");
    serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "mock response"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3},
    })
}

fn mock_stream_response(body: &Value) -> BoxStream<'static, SseEvent> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock-model")
        .to_string();
    let frames = vec![
        SseEvent::data(
            serde_json::json!({
                "id": "chatcmpl-mock", "object": "chat.completion.chunk", "model": model,
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "mock "}}],
            })
            .to_string(),
        ),
        SseEvent::data(
            serde_json::json!({
                "id": "chatcmpl-mock", "object": "chat.completion.chunk", "model": model,
                "choices": [{"index": 0, "delta": {"content": "response"}}],
            })
            .to_string(),
        ),
        SseEvent::data(
            serde_json::json!({
                "id": "chatcmpl-mock", "object": "chat.completion.chunk", "model": model,
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            })
            .to_string(),
        ),
        SseEvent::data("[DONE]"),
    ];
    futures_util::stream::iter(frames).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(provider_type: ProviderType, profile: TargetProtocol) -> Target {
        Target {
            provider_key: ProviderKey::new("p.a.m"),
            provider_type,
            outbound_profile: profile,
            compatibility_profile: None,
            runtime_key: "p.a".into(),
            endpoint: "https://api.example.com/v1".into(),
            auth: AuthSpec::ApiKey("k".into()),
            default_model: "m".into(),
            proxy: None,
        }
    }

    #[test]
    fn urls_follow_the_outbound_profile() {
        assert_eq!(
            build_url(&target(ProviderType::OpenAi, TargetProtocol::OpenAiChat), false),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            build_url(
                &target(ProviderType::OpenAi, TargetProtocol::OpenAiResponses),
                false
            ),
            "https://api.example.com/v1/responses"
        );
        assert_eq!(
            build_url(&target(ProviderType::Anthropic, TargetProtocol::Anthropic), false),
            "https://api.example.com/v1/messages"
        );
        let gemini = Target {
            endpoint: "https://cloudcode-pa.googleapis.com/v1internal".into(),
            ..target(ProviderType::Antigravity, TargetProtocol::Gemini)
        };
        assert_eq!(
            build_url(&gemini, false),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(
            build_url(&gemini, true),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[tokio::test]
    async fn mock_provider_answers_without_network() {
        let adapter = ProviderAdapter::new(
            HttpTransport::new(std::time::Duration::from_secs(1)).unwrap(),
        );
        let mock = target(ProviderType::Mock, TargetProtocol::OpenAiChat);
        let prepared = adapter.prepare(&mock, false).unwrap();
        let body = serde_json::json!({"model": "m", "messages": []});
        let reply = adapter.send_unary(&prepared, &body).await.unwrap();
        assert_eq!(reply["choices"][0]["message"]["content"], "mock response");
    }

    #[tokio::test]
    async fn mock_stream_ends_with_done() {
        let adapter = ProviderAdapter::new(
            HttpTransport::new(std::time::Duration::from_secs(1)).unwrap(),
        );
        let mock = target(ProviderType::Mock, TargetProtocol::OpenAiChat);
        let prepared = adapter.prepare(&mock, true).unwrap();
        let body = serde_json::json!({"model": "m"});
        let frames: Vec<SseEvent> = adapter
            .send_stream(&prepared, &body)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(frames.last().unwrap().is_done());
    }

    #[test]
    fn default_profiles_match_provider_families() {
        assert_eq!(
            ProviderType::Glm.default_outbound_profile(),
            TargetProtocol::OpenAiChat
        );
        assert_eq!(
            ProviderType::Antigravity.default_outbound_profile(),
            TargetProtocol::Gemini
        );
        assert_eq!(
            ProviderType::Anthropic.default_outbound_profile(),
            TargetProtocol::Anthropic
        );
    }
}
