//! Provider error/success events.
//!
//! The router and executor emit events into a one-way bounded channel; the
//! quota daemon is the only consumer. This breaks the router ↔ quota cycle:
//! the router sees quota state only through the read-only view.

use tokio::sync::mpsc;

use crate::quota::ProviderKey;
use crate::util::unix_now_ms;

/// Well-known event codes the daemon dispatches on.
pub mod codes {
    pub const QUOTA_DEPLETED: &str = "QUOTA_DEPLETED";
    pub const QUOTA_RECOVERY: &str = "QUOTA_RECOVERY";
    pub const IFLOW_BLOCKED: &str = "IFLOW_BLOCKED";
    pub const VERIFICATION_REQUIRED: &str = "VERIFICATION_REQUIRED";
}

/// Correlation data carried on every event.
#[derive(Debug, Clone, Default)]
pub struct EventRuntime {
    pub request_id: String,
    pub provider_id: String,
    pub route_name: String,
    pub target_model: String,
}

/// A provider failure observed by the executor or adapter layer.
#[derive(Debug, Clone)]
pub struct ProviderErrorEvent {
    pub provider_key: ProviderKey,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub stage: Option<String>,
    pub message: String,
    pub recoverable: bool,
    /// Cooldown hint parsed by the adapter (e.g. from `quotaResetDelay`).
    pub cooldown_ms: Option<u64>,
    pub details: Option<serde_json::Value>,
    pub timestamp_ms: u64,
    pub runtime: EventRuntime,
}

/// A successful provider attempt.
#[derive(Debug, Clone)]
pub struct ProviderSuccessEvent {
    pub provider_key: ProviderKey,
    pub tokens_used: Option<u64>,
    pub timestamp_ms: u64,
    pub runtime: EventRuntime,
}

/// The daemon's input alphabet.
#[derive(Debug, Clone)]
pub enum QuotaEvent {
    Error(ProviderErrorEvent),
    Success(ProviderSuccessEvent),
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Build the event channel: a cloneable bus for producers and the receiver
/// the daemon drains.
#[must_use]
pub fn event_channel() -> (QuotaEventBus, mpsc::Receiver<QuotaEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (QuotaEventBus { tx }, rx)
}

/// Producer handle. Sends are best-effort: pool-state convergence is
/// eventually consistent, so a full channel drops the event with a log line
/// rather than blocking a request.
#[derive(Debug, Clone)]
pub struct QuotaEventBus {
    tx: mpsc::Sender<QuotaEvent>,
}

impl QuotaEventBus {
    pub fn emit_error(&self, event: ProviderErrorEvent) {
        if let Err(err) = self.tx.try_send(QuotaEvent::Error(event)) {
            tracing::warn!(error = %err, "quota event channel full, dropping error event");
        }
    }

    pub fn emit_success(&self, event: ProviderSuccessEvent) {
        if let Err(err) = self.tx.try_send(QuotaEvent::Success(event)) {
            tracing::warn!(error = %err, "quota event channel full, dropping success event");
        }
    }
}

impl ProviderErrorEvent {
    /// Minimal event for paths that only know status and message.
    #[must_use]
    pub fn from_status(
        provider_key: ProviderKey,
        status: u16,
        message: impl Into<String>,
        runtime: EventRuntime,
    ) -> Self {
        Self {
            provider_key,
            status: Some(status),
            code: None,
            stage: None,
            message: message.into(),
            recoverable: true,
            cooldown_ms: None,
            details: None,
            timestamp_ms: unix_now_ms(),
            runtime,
        }
    }
}

impl ProviderSuccessEvent {
    #[must_use]
    pub fn new(provider_key: ProviderKey, tokens_used: Option<u64>, runtime: EventRuntime) -> Self {
        Self {
            provider_key,
            tokens_used,
            timestamp_ms: unix_now_ms(),
            runtime,
        }
    }
}
