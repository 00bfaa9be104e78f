use crate::protocol::canonical::EntryProtocol;
use crate::protocol::error_shapes::{anthropic_error_payload, openai_error_payload};

/// Gateway-wide error type. Variants map one-to-one onto the error kinds the
/// executor and quota daemon dispatch on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("No available provider for route '{route}'")]
    NoAvailableProvider {
        route: String,
        retry_after_ms: Option<u64>,
    },
    #[error("Upstream auth failure: status={status}, {message}")]
    UpstreamAuth { status: u16, message: String },
    #[error("Upstream quota depleted: {message}")]
    UpstreamQuota {
        message: String,
        cooldown_ms: Option<u64>,
    },
    #[error("Upstream capacity exhausted: {message}")]
    UpstreamCapacity {
        message: String,
        cooldown_ms: Option<u64>,
    },
    #[error("Upstream error: status={status}, {message}")]
    UpstreamTransient { status: u16, message: String },
    #[error("Upstream idle timeout after {idle_ms}ms")]
    UpstreamIdleTimeout { idle_ms: u64 },
    #[error("Tool payload invalid: {0}")]
    ToolPayloadInvalid(String),
    #[error("Internal conversion error: {0}")]
    InternalConversion(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status-code selection and client payload shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    Unprocessable,
    Unavailable,
    ServerError,
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Protocol(_) => ErrorCategory::InvalidRequest,
            GatewayError::Auth(_) => ErrorCategory::Authentication,
            GatewayError::ToolPayloadInvalid(_) => ErrorCategory::Unprocessable,
            GatewayError::NoAvailableProvider { .. } => ErrorCategory::Unavailable,
            GatewayError::UpstreamQuota { .. } | GatewayError::UpstreamCapacity { .. } => {
                ErrorCategory::RateLimit
            }
            GatewayError::UpstreamAuth { status, .. } => {
                if *status == 403 {
                    ErrorCategory::Permission
                } else {
                    ErrorCategory::Authentication
                }
            }
            GatewayError::Config(_)
            | GatewayError::UpstreamTransient { .. }
            | GatewayError::UpstreamIdleTimeout { .. }
            | GatewayError::InternalConversion(_)
            | GatewayError::Cancelled
            | GatewayError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// Short machine-readable code used in `{error:{code}}` bodies and in
    /// provider error events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config_error",
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::Protocol(_) => "invalid_request_error",
            GatewayError::NoAvailableProvider { .. } => "no_available_provider",
            GatewayError::UpstreamAuth { .. } => "upstream_auth",
            GatewayError::UpstreamQuota { .. } => "upstream_quota_depleted",
            GatewayError::UpstreamCapacity { .. } => "upstream_capacity",
            GatewayError::UpstreamTransient { .. } => "upstream_error",
            GatewayError::UpstreamIdleTimeout { .. } => "upstream_idle_timeout",
            GatewayError::ToolPayloadInvalid(_) => "tool_payload_invalid",
            GatewayError::InternalConversion(_) => "internal_conversion_error",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Whether the executor may try the next target in the route after this
    /// failure. Inbound and conversion errors would reproduce identically, so
    /// they never fail over. Upstream auth failures do: credentials are
    /// per-alias, and another target in the route may hold valid ones while
    /// the quota daemon cools the failing alias down.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamAuth { .. }
                | GatewayError::UpstreamQuota { .. }
                | GatewayError::UpstreamCapacity { .. }
                | GatewayError::UpstreamTransient { .. }
                | GatewayError::UpstreamIdleTimeout { .. }
        )
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::Unprocessable => http::StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::Unavailable => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Format an error for a given entry protocol, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(
    err: &GatewayError,
    entry: EntryProtocol,
) -> (http::StatusCode, serde_json::Value) {
    let status = http_status_for_category(err.category());
    let message = err.to_string();

    let body = match entry {
        EntryProtocol::OpenAiChat | EntryProtocol::OpenAiResponses => {
            openai_error_payload(err.code(), &message)
        }
        EntryProtocol::AnthropicMessages => anthropic_error_payload(err.code(), &message),
    };

    (status, body)
}

/// Convert a `GatewayError` into an axum response for a specific entry protocol.
#[must_use]
pub fn into_axum_response(err: &GatewayError, entry: EntryProtocol) -> axum::response::Response {
    use axum::response::IntoResponse;
    let (status, body) = format_error(err, entry);
    let mut response = (status, axum::Json(body)).into_response();
    if let GatewayError::NoAvailableProvider {
        retry_after_ms: Some(ms),
        ..
    } = err
    {
        let secs = ms.div_ceil(1000).max(1);
        if let Ok(value) = http::HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(http::header::RETRY_AFTER, value);
        }
    }
    response
}

/// Default `IntoResponse` falls back to the OpenAI Chat shape; real handlers
/// call [`into_axum_response`] with the correct entry protocol.
impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        into_axum_response(&self, EntryProtocol::OpenAiChat)
    }
}
