//! HTTP dispatch and endpoint handlers.
//!
//! Routing is a hand-rolled match over method and path (no framework
//! router); handlers build an [`Envelope`], run the executor, and shape the
//! reply for the entry protocol.

pub mod lifecycle;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::auth::authenticate;
use crate::error::{into_axum_response, GatewayError};
use crate::executor::ExecutionOutcome;
use crate::pipeline::Envelope;
use crate::protocol::canonical::{
    ChatMessage, ChatRole, EntryProtocol, MessagePart, RequestMetadata,
};
use crate::protocol::openai_responses::SubmitToolOutputsRequest;
use crate::quota::{DisableMode, ProviderKey};
use crate::state::{AppState, PendingToolLoop};
use crate::util::{next_request_id, sanitize_request_id};

const DEFAULT_BODY_LIMIT_BYTES: usize = 8 * 1024 * 1024;

enum RouteMatch<'a> {
    Health,
    OpenAiChat,
    OpenAiResponses,
    SubmitToolOutputs { response_id: &'a str },
    Anthropic,
    Shutdown,
    AdminPool,
    AdminDisable { key: &'a str },
    AdminRecover { key: &'a str },
    AdminReset { key: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function never returns `Err`; the type is `Infallible` for the
/// hyper service contract.
pub async fn dispatch_request(
    state: Arc<AppState>,
    remote_addr: SocketAddr,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path());

    let response = match route {
        RouteMatch::Health => health_response(),
        RouteMatch::OpenAiChat => {
            entry_handler(state, EntryProtocol::OpenAiChat, &parts.headers, body).await
        }
        RouteMatch::OpenAiResponses => {
            entry_handler(state, EntryProtocol::OpenAiResponses, &parts.headers, body).await
        }
        RouteMatch::Anthropic => {
            entry_handler(state, EntryProtocol::AnthropicMessages, &parts.headers, body).await
        }
        RouteMatch::SubmitToolOutputs { response_id } => {
            let response_id = response_id.to_string();
            submit_tool_outputs_handler(state, &response_id, &parts.headers, body).await
        }
        RouteMatch::Shutdown => shutdown_handler(&state, remote_addr, &parts.headers),
        RouteMatch::AdminPool => admin_pool_handler(&state),
        RouteMatch::AdminDisable { key } => {
            let key = key.to_string();
            admin_disable_handler(state, &key, body).await
        }
        RouteMatch::AdminRecover { key } => {
            state.quota.recover_provider(&ProviderKey::new(key));
            ok_json()
        }
        RouteMatch::AdminReset { key } => {
            state.quota.reset_provider(&ProviderKey::new(key));
            ok_json()
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

fn match_route<'a>(method: &Method, path: &'a str) -> RouteMatch<'a> {
    match path {
        "/health" => {
            if method == Method::GET {
                RouteMatch::Health
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/shutdown" => {
            if method == Method::POST {
                RouteMatch::Shutdown
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/v1/chat/completions" => {
            if method == Method::POST {
                RouteMatch::OpenAiChat
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/v1/responses" => {
            if method == Method::POST {
                RouteMatch::OpenAiResponses
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/v1/messages" => {
            if method == Method::POST {
                RouteMatch::Anthropic
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/admin/provider-pool" | "/admin/quota-view" => {
            if method == Method::GET {
                RouteMatch::AdminPool
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        _ => {
            if let Some(rest) = path.strip_prefix("/v1/responses/") {
                if let Some(response_id) = rest.strip_suffix("/submit_tool_outputs") {
                    return if method != Method::POST {
                        RouteMatch::MethodNotAllowed
                    } else if response_id.is_empty() {
                        RouteMatch::NotFound
                    } else {
                        RouteMatch::SubmitToolOutputs { response_id }
                    };
                }
            }
            if let Some(rest) = path.strip_prefix("/admin/providers/") {
                let action = if method == Method::POST {
                    rest.rsplit_once('/')
                } else {
                    None
                };
                if let Some((key, action)) = action {
                    return match action {
                        "disable" => RouteMatch::AdminDisable { key },
                        "recover" => RouteMatch::AdminRecover { key },
                        "reset" => RouteMatch::AdminReset { key },
                        _ => RouteMatch::NotFound,
                    };
                }
            }
            RouteMatch::NotFound
        }
    }
}

fn health_response() -> Response {
    axum::Json(serde_json::json!({"status": "healthy"})).into_response()
}

fn ok_json() -> Response {
    axum::Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn read_request_body(body: Body) -> Result<Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 8MiB)",
            )
                .into_response()
        })
}

fn build_envelope(
    entry: EntryProtocol,
    endpoint: &str,
    headers: &HeaderMap,
    payload: Bytes,
    api_key: Option<&str>,
) -> Envelope {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(next_request_id, sanitize_request_id);
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Envelope {
        endpoint: endpoint.to_string(),
        entry,
        request_id,
        payload,
        metadata: RequestMetadata {
            route_hint: header_str("x-route-hint"),
            session_id: header_str("x-session-id"),
            api_key: api_key.map(str::to_string),
            process_mode: header_str("x-process-mode"),
        },
    }
}

async fn entry_handler(
    state: Arc<AppState>,
    entry: EntryProtocol,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    let api_key = match authenticate(&state.allowed_client_keys, entry, headers) {
        Ok(key) => key.map(str::to_string),
        Err(err) => return into_axum_response(&err, entry),
    };
    let payload = match read_request_body(body).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    let endpoint = match entry {
        EntryProtocol::OpenAiChat => "/v1/chat/completions",
        EntryProtocol::OpenAiResponses => "/v1/responses",
        EntryProtocol::AnthropicMessages => "/v1/messages",
    };
    let envelope = build_envelope(entry, endpoint, headers, payload, api_key.as_deref());
    let request_id = envelope.request_id.clone();

    match state.executor.execute(&envelope).await {
        Ok(ExecutionOutcome::Unary(response)) => {
            finish_unary(&state, entry, &envelope, response)
        }
        Ok(ExecutionOutcome::Stream(rx)) => sse_response(rx),
        Err(err) => {
            tracing::info!(request_id = %request_id, error = %err, "request failed");
            into_axum_response(&err, entry)
        }
    }
}

/// Encode a unary canonical response for the client; Responses tool-call
/// turns additionally park the conversation for `submit_tool_outputs`.
fn finish_unary(
    state: &AppState,
    entry: EntryProtocol,
    envelope: &Envelope,
    response: crate::protocol::canonical::ChatResponse,
) -> Response {
    let body = match state
        .executor
        .pipeline()
        .encode_client_response(entry, response.clone())
    {
        Ok(body) => body,
        Err(err) => return into_axum_response(&err, entry),
    };

    if entry == EntryProtocol::OpenAiResponses
        && response.stop_reason == crate::protocol::canonical::StopReason::ToolCalls
    {
        if let Ok(canonical) = state.executor.pipeline().decode_inbound(envelope) {
            let response_id = body
                .get("id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(&response.id)
                .to_string();
            state.pending_responses.store(
                response_id,
                PendingToolLoop {
                    canonical,
                    response,
                },
            );
        }
    }

    axum::Json(body).into_response()
}

async fn submit_tool_outputs_handler(
    state: Arc<AppState>,
    response_id: &str,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    let entry = EntryProtocol::OpenAiResponses;
    if let Err(err) = authenticate(&state.allowed_client_keys, entry, headers) {
        return into_axum_response(&err, entry);
    }
    let payload = match read_request_body(body).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let submit: SubmitToolOutputsRequest = match serde_json::from_slice(&payload) {
        Ok(submit) => submit,
        Err(err) => {
            return into_axum_response(
                &GatewayError::Protocol(format!("invalid submit_tool_outputs body: {err}")),
                entry,
            )
        }
    };

    let Some(pending) = state.pending_responses.take(response_id) else {
        return into_axum_response(
            &GatewayError::Protocol(format!(
                "no pending tool loop for response '{response_id}'"
            )),
            entry,
        );
    };

    let mut canonical = pending.canonical;
    // Replay the model's tool-call turn, then append the client's outputs.
    let mut call_turn = ChatMessage {
        role: ChatRole::Assistant,
        parts: smallvec::SmallVec::new(),
        name: None,
        tool_call_id: None,
    };
    for part in &pending.response.content {
        call_turn.parts.push(part.clone());
    }
    canonical.messages.push(call_turn);
    for output in submit.tool_outputs {
        let mut parts = smallvec::SmallVec::new();
        parts.push(MessagePart::ToolResult {
            tool_call_id: output.tool_call_id.clone(),
            content: output.output,
        });
        canonical.messages.push(ChatMessage {
            role: ChatRole::Tool,
            parts,
            name: None,
            tool_call_id: Some(output.tool_call_id),
        });
    }
    canonical.stream = submit.stream.unwrap_or(false)
        || headers
            .get(http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/event-stream"));

    match state.executor.execute_canonical(canonical).await {
        Ok(ExecutionOutcome::Unary(response)) => {
            match state
                .executor
                .pipeline()
                .encode_client_response(entry, response)
            {
                Ok(body) => axum::Json(body).into_response(),
                Err(err) => into_axum_response(&err, entry),
            }
        }
        Ok(ExecutionOutcome::Stream(rx)) => sse_response(rx),
        Err(err) => into_axum_response(&err, entry),
    }
}

/// Wrap the pump's frame channel into an SSE response body.
fn sse_response(rx: tokio::sync::mpsc::Receiver<String>) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<Bytes, Infallible>(Bytes::from(frame)), rx))
    });
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    response.headers_mut().insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    response
}

/// Graceful shutdown. Accepted from loopback only: the endpoint carries no
/// client key, so the peer address is the whole authentication.
fn shutdown_handler(state: &AppState, remote_addr: SocketAddr, headers: &HeaderMap) -> Response {
    if !remote_addr.ip().is_loopback() {
        tracing::warn!(peer = %remote_addr, "shutdown refused for non-loopback caller");
        return StatusCode::FORBIDDEN.into_response();
    }
    let caller: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-routecodex-stop-caller"))
        .map(|(name, value)| {
            format!("{}={}", name.as_str(), value.to_str().unwrap_or("?"))
        })
        .collect();
    tracing::info!(caller = caller.join(","), "shutdown requested");
    state.shutdown.send_replace(true);
    ok_json()
}

fn admin_pool_handler(state: &AppState) -> Response {
    let entries = state.quota.entries();
    axum::Json(serde_json::json!({"providers": entries})).into_response()
}

async fn admin_disable_handler(state: Arc<AppState>, key: &str, body: Body) -> Response {
    #[derive(serde::Deserialize)]
    struct DisableBody {
        mode: DisableMode,
        #[serde(rename = "durationMs")]
        duration_ms: Option<u64>,
    }

    let payload = match read_request_body(body).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let request: DisableBody = match serde_json::from_slice(&payload) {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid disable body: {err}"))
                .into_response()
        }
    };
    state
        .quota
        .disable_provider(&ProviderKey::new(key), request.mode, request.duration_ms);
    ok_json()
}
