//! Streaming handoff: pump provider frames through the codec pair into a
//! bounded channel of client SSE strings.
//!
//! Once the first provider frame has been pulled there is no failover:
//! partial output cannot be rolled back. Backpressure comes from the
//! bounded channel: a frame is converted and delivered before the next is
//! pulled. Client disconnects drop the receiver, the send fails, and the
//! pump task drops the provider stream, aborting the underlying request.

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::pipeline::{ReasoningPolicy, StreamDecoder, StreamEncoder};
use crate::protocol::canonical::{EntryProtocol, StreamEvent};
use crate::quota::events::{EventRuntime, ProviderErrorEvent, ProviderSuccessEvent, QuotaEventBus};
use crate::quota::ProviderKey;
use crate::stream::SseEvent;
use crate::util::unix_now_ms;

const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Context the pump needs to report the attempt's outcome.
pub struct StreamAttemptContext {
    pub provider_key: ProviderKey,
    pub runtime: EventRuntime,
    pub events: QuotaEventBus,
}

/// Spawn the pump task and return the client-side frame receiver.
pub fn spawn_stream_pump(
    mut frames: BoxStream<'static, SseEvent>,
    mut decoder: StreamDecoder,
    mut encoder: StreamEncoder,
    policy: ReasoningPolicy,
    entry: EntryProtocol,
    idle_timeout: Duration,
    ctx: StreamAttemptContext,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut message_ended = false;
        let mut tokens_used: Option<u64> = None;
        let mut canonical_events: Vec<StreamEvent> = Vec::with_capacity(8);
        let mut wire: Vec<String> = Vec::with_capacity(4);

        loop {
            let next = tokio::time::timeout(idle_timeout, frames.next()).await;
            let frame = match next {
                Err(_) => {
                    let error = GatewayError::UpstreamIdleTimeout {
                        idle_ms: idle_timeout.as_millis() as u64,
                    };
                    ctx.events.emit_error(ProviderErrorEvent {
                        provider_key: ctx.provider_key.clone(),
                        status: None,
                        code: None,
                        stage: Some("stream".to_string()),
                        message: error.to_string(),
                        recoverable: true,
                        cooldown_ms: None,
                        details: None,
                        timestamp_ms: unix_now_ms(),
                        runtime: ctx.runtime.clone(),
                    });
                    wire.clear();
                    encoder.encode_terminal_error(504, &error.to_string(), &mut wire);
                    for frame in wire.drain(..) {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    return;
                }
                Ok(Some(frame)) => frame,
                Ok(None) => break,
            };

            canonical_events.clear();
            decoder.decode(&frame, &mut canonical_events);
            for event in &canonical_events {
                match event {
                    StreamEvent::MessageEnd { .. } | StreamEvent::Done => message_ended = true,
                    StreamEvent::Usage(usage) => {
                        tokens_used = usage.total_tokens.or(usage.output_tokens);
                    }
                    StreamEvent::Error { status, message } => {
                        // Terminal by definition: emit the event, send the
                        // error frame, close the stream.
                        ctx.events.emit_error(ProviderErrorEvent {
                            provider_key: ctx.provider_key.clone(),
                            status: Some(*status),
                            code: None,
                            stage: Some("stream".to_string()),
                            message: message.clone(),
                            recoverable: true,
                            cooldown_ms: None,
                            details: None,
                            timestamp_ms: unix_now_ms(),
                            runtime: ctx.runtime.clone(),
                        });
                        wire.clear();
                        encoder.encode(event, &mut wire);
                        for frame in wire.drain(..) {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        return;
                    }
                    _ => {}
                }
                if !policy.keeps_stream_event(event, entry) {
                    continue;
                }
                wire.clear();
                encoder.encode(event, &mut wire);
                for frame in wire.drain(..) {
                    if tx.send(frame).await.is_err() {
                        // Client disconnected; dropping `frames` cancels the
                        // provider request.
                        return;
                    }
                }
            }
        }

        if message_ended {
            ctx.events.emit_success(ProviderSuccessEvent::new(
                ctx.provider_key.clone(),
                tokens_used,
                ctx.runtime.clone(),
            ));
        } else {
            // Provider hung up mid-message.
            ctx.events.emit_error(ProviderErrorEvent {
                provider_key: ctx.provider_key.clone(),
                status: Some(502),
                code: None,
                stage: Some("stream".to_string()),
                message: "provider closed the stream before the message completed".to_string(),
                recoverable: true,
                cooldown_ms: None,
                details: None,
                timestamp_ms: unix_now_ms(),
                runtime: ctx.runtime.clone(),
            });
            wire.clear();
            encoder.encode_terminal_error(
                502,
                "provider closed the stream before the message completed",
                &mut wire,
            );
            for frame in wire.drain(..) {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ConversionPipeline, ReasoningPolicy};
    use crate::protocol::canonical::TargetProtocol;
    use crate::quota::events::event_channel;

    fn pump_frames(
        frames: Vec<SseEvent>,
        idle_timeout: Duration,
    ) -> (
        mpsc::Receiver<String>,
        tokio::sync::mpsc::Receiver<crate::quota::events::QuotaEvent>,
    ) {
        let pipeline = ConversionPipeline::new(ReasoningPolicy::Auto);
        let (bus, event_rx) = event_channel();
        let rx = spawn_stream_pump(
            futures_util::stream::iter(frames).boxed(),
            pipeline.stream_decoder(TargetProtocol::OpenAiChat),
            pipeline.stream_encoder(EntryProtocol::OpenAiChat, "gpt-4"),
            ReasoningPolicy::Auto,
            EntryProtocol::OpenAiChat,
            idle_timeout,
            StreamAttemptContext {
                provider_key: ProviderKey::new("p.a.m"),
                runtime: EventRuntime::default(),
                events: bus,
            },
        );
        (rx, event_rx)
    }

    fn chat_chunk(content: &str) -> SseEvent {
        SseEvent::data(
            serde_json::json!({
                "id": "c", "object": "chat.completion.chunk", "model": "gpt-4",
                "choices": [{"index": 0, "delta": {"content": content}}],
            })
            .to_string(),
        )
    }

    fn finish_chunk() -> SseEvent {
        SseEvent::data(
            serde_json::json!({
                "id": "c", "object": "chat.completion.chunk", "model": "gpt-4",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn complete_stream_emits_success_event() {
        let (mut rx, mut events) = pump_frames(
            vec![chat_chunk("hi"), finish_chunk(), SseEvent::data("[DONE]")],
            Duration::from_secs(5),
        );
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert!(frames.last().unwrap().contains("[DONE]"));
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            crate::quota::events::QuotaEvent::Success(_)
        ));
    }

    #[tokio::test]
    async fn truncated_stream_emits_terminal_error_frame() {
        let (mut rx, mut events) =
            pump_frames(vec![chat_chunk("partial")], Duration::from_secs(5));
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        let joined = frames.join("");
        assert!(joined.contains("error"));
        let event = events.recv().await.unwrap();
        assert!(matches!(event, crate::quota::events::QuotaEvent::Error(_)));
    }

    #[tokio::test]
    async fn idle_timeout_terminates_the_stream() {
        let pipeline = ConversionPipeline::new(ReasoningPolicy::Auto);
        let (bus, mut events) = event_channel();
        let never = futures_util::stream::pending::<SseEvent>().boxed();
        let mut rx = spawn_stream_pump(
            never,
            pipeline.stream_decoder(TargetProtocol::OpenAiChat),
            pipeline.stream_encoder(EntryProtocol::OpenAiChat, "gpt-4"),
            ReasoningPolicy::Auto,
            EntryProtocol::OpenAiChat,
            Duration::from_millis(50),
            StreamAttemptContext {
                provider_key: ProviderKey::new("p.a.m"),
                runtime: EventRuntime::default(),
                events: bus,
            },
        );
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert!(frames.join("").contains("idle timeout"));
        let event = events.recv().await.unwrap();
        let crate::quota::events::QuotaEvent::Error(error) = event else {
            panic!("expected error event");
        };
        assert!(error.message.contains("idle timeout"));
    }
}
