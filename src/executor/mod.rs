//! Request executor: single attempt per target, failover across router
//! targets, streaming handoff.

pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::observability::StageLogger;
use crate::pipeline::{ConversionPipeline, Envelope};
use crate::protocol::canonical::ChatRequest;
use crate::protocol::canonical::ChatResponse;
use crate::providers::{AttemptFailure, ProviderAdapter};
use crate::quota::events::{
    EventRuntime, ProviderErrorEvent, ProviderSuccessEvent, QuotaEventBus,
};
use crate::quota::{ProviderKey, QuotaView};
use crate::router::{RouteDecision, VirtualRouter};
use crate::util::unix_now_ms;

use streaming::{spawn_stream_pump, StreamAttemptContext};

/// Default streaming idle deadline.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard cap on failover attempts per request, regardless of pool size.
const MAX_ATTEMPTS: usize = 8;

/// Outcome of one executed request.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Unary(ChatResponse),
    /// Client-shaped SSE wire strings; the pump owns the provider stream.
    Stream(mpsc::Receiver<String>),
}

/// The executor and its collaborators. Re-entrant: no per-request state
/// lives here.
pub struct RequestExecutor {
    pipeline: ConversionPipeline,
    router: Arc<VirtualRouter>,
    quota_view: QuotaView,
    adapter: Arc<ProviderAdapter>,
    events: QuotaEventBus,
    stage_log: Arc<StageLogger>,
    idle_timeout: Duration,
}

impl RequestExecutor {
    #[must_use]
    pub fn new(
        pipeline: ConversionPipeline,
        router: Arc<VirtualRouter>,
        quota_view: QuotaView,
        adapter: Arc<ProviderAdapter>,
        events: QuotaEventBus,
        stage_log: Arc<StageLogger>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            router,
            quota_view,
            adapter,
            events,
            stage_log,
            idle_timeout,
        }
    }

    #[must_use]
    pub fn pipeline(&self) -> &ConversionPipeline {
        &self.pipeline
    }

    /// Decode an envelope and execute it.
    ///
    /// # Errors
    ///
    /// Returns the final attempt's error per the propagation rules: inbound
    /// errors immediately, transient upstream errors only once the route is
    /// exhausted.
    pub async fn execute(&self, envelope: &Envelope) -> Result<ExecutionOutcome, GatewayError> {
        let canonical = self.pipeline.decode_inbound(envelope)?;
        self.stage_log.log_json(
            &envelope.request_id,
            "inbound",
            &serde_json::json!({
                "entry": envelope.entry.as_str(),
                "model": canonical.model,
                "stream": canonical.stream,
                "messages": canonical.messages.len(),
            }),
        );
        self.execute_canonical(canonical).await
    }

    /// Execute an already-canonical request (also the tool-loop
    /// continuation path).
    ///
    /// # Errors
    ///
    /// See [`Self::execute`].
    pub async fn execute_canonical(
        &self,
        mut canonical: ChatRequest,
    ) -> Result<ExecutionOutcome, GatewayError> {
        let mut attempted: Vec<ProviderKey> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        while attempted.len() < MAX_ATTEMPTS {
            let decision = match self.router.route(&canonical, &self.quota_view, &attempted) {
                Ok(decision) => decision,
                Err(route_error) => {
                    // After at least one attempt the user-visible error is
                    // the final attempt's, not the exhaustion itself.
                    return Err(last_error.unwrap_or(route_error));
                }
            };
            attempted.push(decision.provider_key.clone());

            match self.attempt(&mut canonical, &decision).await {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptOutcome::Fatal(error)) => return Err(error),
                Err(AttemptOutcome::Failover(error)) => {
                    self.router.note_failure(&decision);
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::NoAvailableProvider {
            route: "default".to_string(),
            retry_after_ms: None,
        }))
    }

    /// One single-attempt send against a selected target.
    async fn attempt(
        &self,
        canonical: &mut ChatRequest,
        decision: &RouteDecision,
    ) -> Result<ExecutionOutcome, AttemptOutcome> {
        let target = &decision.target;
        let runtime = EventRuntime {
            request_id: canonical.request_id.clone(),
            provider_id: target.provider_key.provider_id().to_string(),
            route_name: decision.route_name.clone(),
            target_model: target.default_model.clone(),
        };

        let prepared = self
            .adapter
            .prepare(target, canonical.stream)
            .map_err(|failure| self.fail(decision, &runtime, failure))?;

        // Outbound conversion failures would reproduce on any target: the
        // canonical is the same. Never failover on them.
        let body = self
            .pipeline
            .encode_outbound(
                canonical,
                target.outbound_profile,
                &target.default_model,
                prepared.gemini_ctx.as_ref(),
            )
            .map_err(AttemptOutcome::Fatal)?;
        self.stage_log
            .log_json(&canonical.request_id, "outbound", &body);

        if canonical.stream {
            let frames = self
                .adapter
                .send_stream(&prepared, &body)
                .await
                .map_err(|failure| self.fail(decision, &runtime, failure))?;
            // From the first frame on, failover is off the table.
            let rx = spawn_stream_pump(
                frames,
                self.pipeline.stream_decoder(target.outbound_profile),
                self.pipeline
                    .stream_encoder(canonical.entry, &canonical.model),
                self.pipeline.reasoning_policy(),
                canonical.entry,
                self.idle_timeout,
                StreamAttemptContext {
                    provider_key: target.provider_key.clone(),
                    runtime,
                    events: self.events.clone(),
                },
            );
            return Ok(ExecutionOutcome::Stream(rx));
        }

        let provider_body = self
            .adapter
            .send_unary(&prepared, &body)
            .await
            .map_err(|failure| self.fail(decision, &runtime, failure))?;
        self.stage_log
            .log_json(&canonical.request_id, "provider-response", &provider_body);

        let response = self
            .pipeline
            .decode_provider_response(target.outbound_profile, provider_body)
            .map_err(AttemptOutcome::Fatal)?;

        self.events.emit_success(ProviderSuccessEvent::new(
            target.provider_key.clone(),
            response.usage.total_tokens,
            runtime,
        ));
        Ok(ExecutionOutcome::Unary(response))
    }

    /// Emit the failure event and decide whether the executor may move to
    /// the next target.
    fn fail(
        &self,
        decision: &RouteDecision,
        runtime: &EventRuntime,
        failure: AttemptFailure,
    ) -> AttemptOutcome {
        let recoverable = failure.error.recoverable();
        let status = match &failure.error {
            GatewayError::UpstreamAuth { status, .. }
            | GatewayError::UpstreamTransient { status, .. } => Some(*status),
            GatewayError::UpstreamQuota { .. } | GatewayError::UpstreamCapacity { .. } => {
                Some(429)
            }
            _ => None,
        };
        self.events.emit_error(ProviderErrorEvent {
            provider_key: decision.provider_key.clone(),
            status,
            code: failure.code.clone(),
            stage: failure.stage.map(str::to_string),
            message: failure.error.to_string(),
            recoverable,
            cooldown_ms: failure.cooldown_ms,
            details: failure.details.clone(),
            timestamp_ms: unix_now_ms(),
            runtime: runtime.clone(),
        });

        tracing::warn!(
            request_id = %runtime.request_id,
            provider_key = %decision.provider_key,
            route = %decision.route_name,
            error = %failure.error,
            recoverable,
            "provider attempt failed"
        );

        if recoverable {
            AttemptOutcome::Failover(failure.error)
        } else {
            AttemptOutcome::Fatal(failure.error)
        }
    }
}

enum AttemptOutcome {
    /// Try the next target in the route.
    Failover(GatewayError),
    /// Surface immediately.
    Fatal(GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ReasoningPolicy;
    use crate::protocol::canonical::{EntryProtocol, RequestMetadata, TargetProtocol};
    use crate::providers::auth::AuthSpec;
    use crate::providers::transport::HttpTransport;
    use crate::providers::{ProviderType, Target};
    use crate::quota::events::event_channel;
    use crate::quota::{QuotaDaemon, QuotaDaemonConfig};
    use crate::router::{ClassifierConfig, RouteTier, TierMode, DEFAULT_ROUTE};
    use rustc_hash::FxHashMap;

    fn mock_target(key: &str) -> Arc<Target> {
        let provider_key = ProviderKey::new(key);
        Arc::new(Target {
            provider_key: provider_key.clone(),
            provider_type: ProviderType::Mock,
            outbound_profile: TargetProtocol::OpenAiChat,
            compatibility_profile: None,
            runtime_key: key.to_string(),
            endpoint: "http://localhost".into(),
            auth: AuthSpec::None,
            default_model: provider_key.model_id().unwrap_or("m").to_string(),
            proxy: None,
        })
    }

    fn executor(keys: &[&str]) -> (RequestExecutor, QuotaDaemon) {
        let mut targets = FxHashMap::default();
        let mut tier_targets = Vec::new();
        for key in keys {
            targets.insert(ProviderKey::new(*key), mock_target(key));
            tier_targets.push(ProviderKey::new(*key));
        }
        let mut routes = FxHashMap::default();
        routes.insert(
            DEFAULT_ROUTE.to_string(),
            vec![RouteTier {
                id: "primary-1".into(),
                priority: 0,
                backup: false,
                mode: TierMode::Priority,
                targets: tier_targets,
            }],
        );
        let router = Arc::new(VirtualRouter::new(
            routes,
            targets,
            ClassifierConfig::default(),
            None,
        ));
        let daemon = QuotaDaemon::new(QuotaDaemonConfig::default());
        let (bus, _rx) = event_channel();
        let executor = RequestExecutor::new(
            ConversionPipeline::new(ReasoningPolicy::Auto),
            router,
            daemon.view(),
            Arc::new(ProviderAdapter::new(
                HttpTransport::new(Duration::from_secs(5)).unwrap(),
            )),
            bus,
            Arc::new(StageLogger::disabled()),
            DEFAULT_IDLE_TIMEOUT,
        );
        (executor, daemon)
    }

    fn envelope(body: &str, stream: bool) -> Envelope {
        let _ = stream;
        Envelope {
            endpoint: "/v1/chat/completions".into(),
            entry: EntryProtocol::OpenAiChat,
            request_id: "req_test".into(),
            payload: bytes::Bytes::from(body.to_string()),
            metadata: RequestMetadata::default(),
        }
    }

    #[tokio::test]
    async fn unary_request_round_trips_through_mock_provider() {
        let (executor, _daemon) = executor(&["mock.default.gpt-4"]);
        let outcome = executor
            .execute(&envelope(
                r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#,
                false,
            ))
            .await
            .unwrap();
        let ExecutionOutcome::Unary(response) = outcome else {
            panic!("expected unary outcome");
        };
        assert_eq!(
            response.content,
            vec![crate::protocol::canonical::MessagePart::Text(
                "mock response".into()
            )]
        );
    }

    #[tokio::test]
    async fn streaming_request_yields_client_frames() {
        let (executor, _daemon) = executor(&["mock.default.gpt-4"]);
        let outcome = executor
            .execute(&envelope(
                r#"{"model":"gpt-4","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
                true,
            ))
            .await
            .unwrap();
        let ExecutionOutcome::Stream(mut rx) = outcome else {
            panic!("expected stream outcome");
        };
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert!(frames.iter().any(|f| f.contains("mock ")));
        assert!(frames.last().unwrap().contains("[DONE]"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_protocol_error() {
        let (executor, _daemon) = executor(&["mock.default.gpt-4"]);
        let err = executor.execute(&envelope("{", false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn empty_route_is_no_available_provider() {
        let (executor, daemon) = executor(&["mock.default.gpt-4"]);
        daemon.disable_provider(
            &ProviderKey::new("mock.default.gpt-4"),
            crate::quota::DisableMode::Cooldown,
            Some(60_000),
        );
        let err = executor
            .execute(&envelope(
                r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#,
                false,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableProvider { .. }));
    }
}
