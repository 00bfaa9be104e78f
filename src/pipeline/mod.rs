//! The conversion pipeline: the only component that touches
//! provider-shaped bytes.
//!
//! Requests flow inbound-filter -> inbound codec -> router -> outbound codec ->
//! outbound filter -> provider send; responses flow the dual. Codecs are
//! dispatched over the `(entry, target)` protocol tuple rather than an open
//! trait hierarchy: each arm is a free function in the protocol modules.

pub mod reasoning;

use std::sync::atomic::AtomicU64;

use crate::error::GatewayError;
use crate::protocol::canonical::{
    ChatRequest, ChatResponse, EntryProtocol, RequestMetadata, StreamEvent, TargetProtocol,
};
use crate::protocol::gemini::GeminiEnvelopeContext;
use crate::protocol::{anthropic, gemini, openai_chat, openai_responses};
use crate::stream::SseEvent;
use crate::toolcall::repair_outbound_tool_calls;
use crate::util::next_generated_id;

pub use reasoning::ReasoningPolicy;

static RESPONSE_ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// One request's worth of transport-independent context.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub endpoint: String,
    pub entry: EntryProtocol,
    pub request_id: String,
    pub payload: bytes::Bytes,
    pub metadata: RequestMetadata,
}

/// All registered `(entry, target)` codec pairs. Every pair is reachable;
/// the round-trip identity property is asserted over this list.
pub const CODEC_PAIRS: &[(EntryProtocol, TargetProtocol)] = &[
    (EntryProtocol::OpenAiChat, TargetProtocol::OpenAiChat),
    (EntryProtocol::OpenAiChat, TargetProtocol::OpenAiResponses),
    (EntryProtocol::OpenAiChat, TargetProtocol::Anthropic),
    (EntryProtocol::OpenAiChat, TargetProtocol::Gemini),
    (EntryProtocol::OpenAiResponses, TargetProtocol::OpenAiChat),
    (
        EntryProtocol::OpenAiResponses,
        TargetProtocol::OpenAiResponses,
    ),
    (EntryProtocol::OpenAiResponses, TargetProtocol::Anthropic),
    (EntryProtocol::OpenAiResponses, TargetProtocol::Gemini),
    (EntryProtocol::AnthropicMessages, TargetProtocol::OpenAiChat),
    (
        EntryProtocol::AnthropicMessages,
        TargetProtocol::OpenAiResponses,
    ),
    (EntryProtocol::AnthropicMessages, TargetProtocol::Anthropic),
    (EntryProtocol::AnthropicMessages, TargetProtocol::Gemini),
];

/// The stage-wise codec pipeline shared by all requests.
#[derive(Debug, Clone)]
pub struct ConversionPipeline {
    reasoning: ReasoningPolicy,
}

impl ConversionPipeline {
    #[must_use]
    pub fn new(reasoning: ReasoningPolicy) -> Self {
        Self { reasoning }
    }

    #[must_use]
    pub fn reasoning_policy(&self) -> ReasoningPolicy {
        self.reasoning
    }

    /// Inbound leg: client bytes to the canonical request.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Protocol`] (a client 4xx) on malformed input.
    pub fn decode_inbound(&self, envelope: &Envelope) -> Result<ChatRequest, GatewayError> {
        let parse = |e: serde_json::Error| GatewayError::Protocol(format!("invalid body: {e}"));
        match envelope.entry {
            EntryProtocol::OpenAiChat => {
                let wire = serde_json::from_slice(&envelope.payload).map_err(parse)?;
                openai_chat::decoder::decode_chat_request(
                    wire,
                    envelope.request_id.clone(),
                    envelope.metadata.clone(),
                )
            }
            EntryProtocol::OpenAiResponses => {
                let wire = serde_json::from_slice(&envelope.payload).map_err(parse)?;
                openai_responses::decoder::decode_responses_request(
                    wire,
                    envelope.request_id.clone(),
                    envelope.metadata.clone(),
                )
            }
            EntryProtocol::AnthropicMessages => {
                let wire = serde_json::from_slice(&envelope.payload).map_err(parse)?;
                anthropic::decoder::decode_messages_request(
                    wire,
                    envelope.request_id.clone(),
                    envelope.metadata.clone(),
                )
            }
        }
    }

    /// Outbound leg: canonical request to the provider body. Runs the
    /// outbound tool filter first; failures there are client 422s, while
    /// codec failures are 5xx and are never retried on another target.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ToolPayloadInvalid`] or
    /// [`GatewayError::InternalConversion`].
    pub fn encode_outbound(
        &self,
        canonical: &mut ChatRequest,
        target: TargetProtocol,
        model: &str,
        gemini_ctx: Option<&GeminiEnvelopeContext>,
    ) -> Result<serde_json::Value, GatewayError> {
        repair_outbound_tool_calls(canonical, target)?;

        let to_value = |r: Result<serde_json::Value, serde_json::Error>| {
            r.map_err(|e| GatewayError::InternalConversion(format!("encode failed: {e}")))
        };
        match target {
            TargetProtocol::OpenAiChat => {
                let wire = openai_chat::encoder::encode_chat_request(canonical, model)?;
                to_value(serde_json::to_value(wire))
            }
            TargetProtocol::OpenAiResponses => {
                let wire =
                    openai_responses::encoder::encode_responses_request(canonical, model)?;
                to_value(serde_json::to_value(wire))
            }
            TargetProtocol::Anthropic => {
                let wire = anthropic::encoder::encode_messages_request(canonical, model)?;
                to_value(serde_json::to_value(wire))
            }
            TargetProtocol::Gemini => {
                let ctx = gemini_ctx.ok_or_else(|| {
                    GatewayError::InternalConversion(
                        "gemini target without envelope context".to_string(),
                    )
                })?;
                gemini::encoder::encode_envelope(canonical, model, ctx)
            }
        }
    }

    /// Provider response body to the canonical response.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InternalConversion`] on unrepresentable
    /// responses.
    pub fn decode_provider_response(
        &self,
        target: TargetProtocol,
        body: serde_json::Value,
    ) -> Result<ChatResponse, GatewayError> {
        let parse =
            |e: serde_json::Error| GatewayError::InternalConversion(format!("decode failed: {e}"));
        match target {
            TargetProtocol::OpenAiChat => {
                let wire = serde_json::from_value(body).map_err(parse)?;
                openai_chat::response_decoder::decode_chat_response(wire)
            }
            TargetProtocol::OpenAiResponses => {
                let wire = serde_json::from_value(body).map_err(parse)?;
                openai_responses::response_decoder::decode_responses_response(wire)
            }
            TargetProtocol::Anthropic => {
                let wire = serde_json::from_value(body).map_err(parse)?;
                anthropic::response_decoder::decode_messages_response(wire)
            }
            TargetProtocol::Gemini => {
                let wire = gemini::GeminiResponse::from_provider_value(body).map_err(parse)?;
                gemini::response_decoder::decode_gemini_response(wire)
            }
        }
    }

    /// Client-view leg: canonical response to the entry-shaped body, with
    /// the reasoning policy applied.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InternalConversion`] when serialization fails.
    pub fn encode_client_response(
        &self,
        entry: EntryProtocol,
        mut canonical: ChatResponse,
    ) -> Result<serde_json::Value, GatewayError> {
        self.reasoning.apply_to_response(&mut canonical, entry);
        if canonical.id.is_empty() {
            canonical.id = fresh_response_id(entry);
        }
        let to_value = |r: Result<serde_json::Value, serde_json::Error>| {
            r.map_err(|e| GatewayError::InternalConversion(format!("encode failed: {e}")))
        };
        match entry {
            EntryProtocol::OpenAiChat => to_value(serde_json::to_value(
                openai_chat::response_encoder::encode_chat_response(&canonical),
            )),
            EntryProtocol::OpenAiResponses => to_value(serde_json::to_value(
                openai_responses::response_encoder::encode_responses_response(&canonical),
            )),
            EntryProtocol::AnthropicMessages => to_value(serde_json::to_value(
                anthropic::response_encoder::encode_messages_response(&canonical),
            )),
        }
    }

    /// Build the stream decoder for a target protocol.
    #[must_use]
    pub fn stream_decoder(&self, target: TargetProtocol) -> StreamDecoder {
        match target {
            TargetProtocol::OpenAiChat => {
                StreamDecoder::OpenAiChat(openai_chat::stream::ChatStreamDecoder::new())
            }
            TargetProtocol::OpenAiResponses => StreamDecoder::OpenAiResponses(
                openai_responses::stream::ResponsesStreamDecoder::new(),
            ),
            TargetProtocol::Anthropic => {
                StreamDecoder::Anthropic(anthropic::stream::MessagesStreamDecoder::new())
            }
            TargetProtocol::Gemini => {
                StreamDecoder::Gemini(gemini::stream::GeminiStreamDecoder::new())
            }
        }
    }

    /// Build the stream encoder for an entry protocol.
    #[must_use]
    pub fn stream_encoder(&self, entry: EntryProtocol, model: &str) -> StreamEncoder {
        let response_id = fresh_response_id(entry);
        match entry {
            EntryProtocol::OpenAiChat => StreamEncoder::OpenAiChat(
                openai_chat::stream::ChatStreamEncoder::new(response_id, model.to_string()),
            ),
            EntryProtocol::OpenAiResponses => {
                StreamEncoder::OpenAiResponses(
                    openai_responses::stream::ResponsesStreamEncoder::new(
                        response_id,
                        model.to_string(),
                    ),
                )
            }
            EntryProtocol::AnthropicMessages => StreamEncoder::AnthropicMessages(
                anthropic::stream::MessagesStreamEncoder::new(response_id, model.to_string()),
            ),
        }
    }
}

fn fresh_response_id(entry: EntryProtocol) -> String {
    let prefix = match entry {
        EntryProtocol::OpenAiChat => "chatcmpl",
        EntryProtocol::OpenAiResponses => "resp",
        EntryProtocol::AnthropicMessages => "msg",
    };
    next_generated_id(prefix, &RESPONSE_ID_SEQ)
}

/// Target-side stream decoder, dispatched by protocol tag.
pub enum StreamDecoder {
    OpenAiChat(openai_chat::stream::ChatStreamDecoder),
    OpenAiResponses(openai_responses::stream::ResponsesStreamDecoder),
    Anthropic(anthropic::stream::MessagesStreamDecoder),
    Gemini(gemini::stream::GeminiStreamDecoder),
}

impl StreamDecoder {
    /// Decode one provider SSE frame into canonical events.
    pub fn decode(&mut self, frame: &SseEvent, out: &mut Vec<StreamEvent>) {
        match self {
            StreamDecoder::OpenAiChat(d) => d.decode(frame, out),
            StreamDecoder::OpenAiResponses(d) => d.decode(frame, out),
            StreamDecoder::Anthropic(d) => d.decode(frame, out),
            StreamDecoder::Gemini(d) => d.decode(frame, out),
        }
    }
}

/// Entry-side stream encoder, dispatched by protocol tag.
pub enum StreamEncoder {
    OpenAiChat(openai_chat::stream::ChatStreamEncoder),
    OpenAiResponses(openai_responses::stream::ResponsesStreamEncoder),
    AnthropicMessages(anthropic::stream::MessagesStreamEncoder),
}

impl StreamEncoder {
    /// Encode one canonical event into client SSE wire strings.
    pub fn encode(&mut self, event: &StreamEvent, out: &mut Vec<String>) {
        match self {
            StreamEncoder::OpenAiChat(e) => e.encode(event, out),
            StreamEncoder::OpenAiResponses(e) => e.encode(event, out),
            StreamEncoder::AnthropicMessages(e) => e.encode(event, out),
        }
    }

    /// A terminal error frame for a stream that already sent headers.
    pub fn encode_terminal_error(&mut self, status: u16, message: &str, out: &mut Vec<String>) {
        self.encode(
            &StreamEvent::Error {
                status,
                message: message.to_string(),
            },
            out,
        );
    }
}
