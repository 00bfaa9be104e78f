//! Codec matrix coverage: every registered (entry, target) pair converts a
//! representative request, and response conversion round-trips through the
//! protocols that are both entry and target.

use bytes::Bytes;
use routecodex::pipeline::{ConversionPipeline, Envelope, ReasoningPolicy, CODEC_PAIRS};
use routecodex::protocol::canonical::{
    ChatResponse, EntryProtocol, MessagePart, RequestMetadata, StopReason, TargetProtocol, Usage,
};
use routecodex::protocol::gemini::{GeminiEnvelopeContext, FORBIDDEN_TOP_LEVEL_KEYS};
use serde_json::json;

fn pipeline() -> ConversionPipeline {
    ConversionPipeline::new(ReasoningPolicy::Preserve)
}

fn fixture_body(entry: EntryProtocol) -> serde_json::Value {
    match entry {
        EntryProtocol::OpenAiChat => json!({
            "model": "client-model",
            "messages": [
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "weather in SF?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "{\"weather\":\"sunny\"}"}
            ],
            "tools": [{"type": "function", "function": {
                "name": "get_weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            }}]
        }),
        EntryProtocol::OpenAiResponses => json!({
            "model": "client-model",
            "instructions": "be helpful",
            "input": [
                {"type": "message", "role": "user", "content": "weather in SF?"},
                {"type": "function_call", "call_id": "call_1", "name": "get_weather",
                 "arguments": "{\"city\":\"SF\"}"},
                {"type": "function_call_output", "call_id": "call_1",
                 "output": "{\"weather\":\"sunny\"}"}
            ],
            "tools": [{"type": "function", "name": "get_weather",
                       "parameters": {"type": "object"}}]
        }),
        EntryProtocol::AnthropicMessages => json!({
            "model": "client-model",
            "max_tokens": 512,
            "system": "be helpful",
            "messages": [
                {"role": "user", "content": "weather in SF?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "call_1", "name": "get_weather",
                     "input": {"city": "SF"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_1",
                     "content": "{\"weather\":\"sunny\"}"}
                ]}
            ],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
        }),
    }
}

fn envelope(entry: EntryProtocol) -> Envelope {
    Envelope {
        endpoint: "/test".into(),
        entry,
        request_id: "req_matrix".into(),
        payload: Bytes::from(fixture_body(entry).to_string()),
        metadata: RequestMetadata::default(),
    }
}

#[test]
fn every_codec_pair_converts_the_fixture() {
    let pipeline = pipeline();
    let gemini_ctx = GeminiEnvelopeContext {
        project: "projects/p1".into(),
        user_agent: "routecodex-test".into(),
        request_type: "agent".into(),
    };

    for (entry, target) in CODEC_PAIRS {
        let mut canonical = pipeline
            .decode_inbound(&envelope(*entry))
            .unwrap_or_else(|e| panic!("decode failed for {entry:?}: {e}"));
        assert_eq!(canonical.system.as_deref(), Some("be helpful"), "{entry:?}");
        assert_eq!(canonical.tools.len(), 1, "{entry:?}");

        let body = pipeline
            .encode_outbound(
                &mut canonical,
                *target,
                "provider-model",
                Some(&gemini_ctx),
            )
            .unwrap_or_else(|e| panic!("encode failed for {entry:?}->{target:?}: {e}"));

        let tool_name_present = body.to_string().contains("get_weather");
        assert!(tool_name_present, "{entry:?}->{target:?} lost the tool");

        match target {
            TargetProtocol::Gemini => {
                for key in FORBIDDEN_TOP_LEVEL_KEYS {
                    assert!(
                        body.get(key).is_none(),
                        "{entry:?}->gemini leaked top-level {key}"
                    );
                }
                assert_eq!(body["model"], "provider-model");
                assert_eq!(
                    body["request"]["tools"][0]["functionDeclarations"][0]["name"],
                    "get_weather"
                );
            }
            TargetProtocol::OpenAiChat | TargetProtocol::OpenAiResponses => {
                assert_eq!(body["model"], "provider-model");
            }
            TargetProtocol::Anthropic => {
                assert_eq!(body["model"], "provider-model");
                assert!(body["max_tokens"].as_u64().is_some());
            }
        }
    }
}

fn sample_response() -> ChatResponse {
    ChatResponse {
        id: "resp-roundtrip".into(),
        model: "provider-model".into(),
        content: vec![
            MessagePart::Text("checking the weather".into()),
            MessagePart::ToolCall {
                id: "call_9".into(),
                name: "get_weather".into(),
                arguments: "{\"city\":\"SF\"}".into(),
            },
        ],
        stop_reason: StopReason::ToolCalls,
        usage: Usage {
            input_tokens: Some(11),
            output_tokens: Some(5),
            total_tokens: Some(16),
        },
    }
}

/// For protocols that are both entry and target, the entry-side response
/// encoder emits exactly the provider wire shape, so encode->decode must be
/// the identity on canonical content.
#[test]
fn response_conversion_round_trips_for_bidirectional_protocols() {
    let pipeline = pipeline();
    let cases = [
        (EntryProtocol::OpenAiChat, TargetProtocol::OpenAiChat),
        (EntryProtocol::OpenAiResponses, TargetProtocol::OpenAiResponses),
        (EntryProtocol::AnthropicMessages, TargetProtocol::Anthropic),
    ];

    for (entry, target) in cases {
        let original = sample_response();
        let wire = pipeline
            .encode_client_response(entry, original.clone())
            .unwrap();
        let decoded = pipeline.decode_provider_response(target, wire).unwrap();

        assert_eq!(decoded.stop_reason, original.stop_reason, "{entry:?}");
        assert_eq!(
            decoded.tool_calls(),
            original.tool_calls(),
            "{entry:?} tool calls diverged"
        );
        let text = |r: &ChatResponse| {
            r.content
                .iter()
                .filter_map(|p| match p {
                    MessagePart::Text(t) => Some(t.clone()),
                    _ => None,
                })
                .collect::<String>()
        };
        assert_eq!(text(&decoded), text(&original), "{entry:?} text diverged");
        assert_eq!(decoded.usage, original.usage, "{entry:?} usage diverged");
    }
}

#[test]
fn gemini_response_decodes_into_anthropic_client_shape() {
    // S2: Anthropic client, Gemini provider, tool_use lifted back.
    let pipeline = pipeline();
    let provider_body = json!({
        "response": {
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "SF"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 4,
                              "totalTokenCount": 12}
        }
    });
    let canonical = pipeline
        .decode_provider_response(TargetProtocol::Gemini, provider_body)
        .unwrap();
    assert_eq!(canonical.stop_reason, StopReason::ToolCalls);

    let client = pipeline
        .encode_client_response(EntryProtocol::AnthropicMessages, canonical)
        .unwrap();
    let blocks = client["content"].as_array().unwrap();
    assert_eq!(blocks[0]["type"], "tool_use");
    assert_eq!(blocks[0]["name"], "get_weather");
    assert_eq!(blocks[0]["input"]["city"], "SF");
    assert_eq!(client["stop_reason"], "tool_use");
}

#[test]
fn anthropic_empty_tools_survive_iff_field_was_present() {
    let pipeline = pipeline();
    let with_tools = Envelope {
        endpoint: "/v1/messages".into(),
        entry: EntryProtocol::AnthropicMessages,
        request_id: "req_1".into(),
        payload: Bytes::from(
            json!({
                "model": "claude", "max_tokens": 16, "tools": [],
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ),
        metadata: RequestMetadata::default(),
    };
    let mut canonical = pipeline.decode_inbound(&with_tools).unwrap();
    let body = pipeline
        .encode_outbound(&mut canonical, TargetProtocol::Anthropic, "claude", None)
        .unwrap();
    assert_eq!(body["tools"], json!([]));

    let without_tools = Envelope {
        payload: Bytes::from(
            json!({
                "model": "claude", "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ),
        ..with_tools
    };
    let mut canonical = pipeline.decode_inbound(&without_tools).unwrap();
    let body = pipeline
        .encode_outbound(&mut canonical, TargetProtocol::Anthropic, "claude", None)
        .unwrap();
    assert!(body.get("tools").is_none());
}
