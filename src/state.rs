//! Shared application state: every process-wide singleton of the source
//! design lives here as a value owned by `AppState` and injected into the
//! components that need it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};

use crate::auth::AllowedClientKeys;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::executor::RequestExecutor;
use crate::observability::StageLogger;
use crate::pipeline::{ConversionPipeline, ReasoningPolicy};
use crate::protocol::canonical::{ChatRequest, ChatResponse};
use crate::providers::auth::AuthSpec;
use crate::providers::transport::HttpTransport;
use crate::providers::{ProviderAdapter, ProviderType};
use crate::quota::antigravity::{AntigravityQuota, QuotaProbe, TokenFileQuotaProbe};
use crate::quota::events::{event_channel, QuotaEvent, QuotaEventBus};
use crate::quota::{AuthKind, ProviderKey, QuotaDaemon, QuotaDaemonConfig};
use crate::router::{StickySessions, VirtualRouter};

/// A stored Responses tool loop awaiting `submit_tool_outputs`.
#[derive(Debug, Clone)]
pub struct PendingToolLoop {
    pub canonical: ChatRequest,
    pub response: ChatResponse,
}

/// Bounded store of pending Responses tool loops.
pub struct PendingResponses {
    entries: Mutex<FxHashMap<String, PendingToolLoop>>,
    capacity: usize,
}

impl PendingResponses {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn store(&self, response_id: String, pending: PendingToolLoop) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            // Oldest-by-insertion is not tracked; evicting an arbitrary
            // entry bounds memory and tool loops are short-lived anyway.
            if let Some(key) = entries.keys().next().cloned() {
                entries.remove(&key);
            }
        }
        entries.insert(response_id, pending);
    }

    #[must_use]
    pub fn take(&self, response_id: &str) -> Option<PendingToolLoop> {
        self.entries.lock().remove(response_id)
    }
}

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub executor: RequestExecutor,
    pub router: Arc<VirtualRouter>,
    pub quota: QuotaDaemon,
    pub events: QuotaEventBus,
    pub allowed_client_keys: AllowedClientKeys,
    pub pending_responses: PendingResponses,
    pub antigravity: Option<Arc<AntigravityQuota>>,
    pub antigravity_probe: Option<Arc<dyn QuotaProbe>>,
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Wire up the whole object graph from configuration. The returned
    /// receiver feeds [`QuotaDaemon::run`], which the caller spawns.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the HTTP transport cannot be built.
    pub fn from_config(
        config: AppConfig,
        home: Option<PathBuf>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<QuotaEvent>), GatewayError> {
        let targets = config.build_targets();
        let routes = config.build_routes();

        let quota_config = QuotaDaemonConfig::from_env(home.as_deref());
        let antigravity_state_path = quota_config.antigravity_state_path.clone();
        let quota = QuotaDaemon::new(quota_config);

        // Priority tiers come from route membership: a target inherits the
        // best (lowest) tier priority that references it.
        let mut tier_priority: FxHashMap<&ProviderKey, i32> = FxHashMap::default();
        for tiers in routes.values() {
            for tier in tiers {
                for key in &tier.targets {
                    let entry = tier_priority.entry(key).or_insert(tier.priority);
                    *entry = (*entry).min(tier.priority);
                }
            }
        }

        let mut has_antigravity = false;
        let mut antigravity_token_files: Vec<(String, PathBuf)> = Vec::new();
        for (key, target) in &targets {
            let auth_kind = if target.auth.is_oauth() {
                AuthKind::OAuth
            } else if matches!(target.auth, AuthSpec::ApiKey(_)) {
                AuthKind::ApiKey
            } else {
                AuthKind::Unknown
            };
            let priority = tier_priority
                .get(key)
                .copied()
                .unwrap_or(0)
                .max(0)
                .unsigned_abs();
            let tracked = quota.contains(key);
            quota.register_target(key.clone(), auth_kind, priority);

            if target.provider_type == ProviderType::Antigravity {
                has_antigravity = true;
                if let AuthSpec::AntigravityOAuth { path, .. } = &target.auth {
                    let alias = key.alias().unwrap_or_default().to_string();
                    if !antigravity_token_files
                        .iter()
                        .any(|(existing, _)| existing == &alias)
                    {
                        antigravity_token_files.push((alias, path.clone()));
                    }
                    let protected = AntigravityQuota::protected_models_from_token_file(path);
                    if protected.iter().any(|m| m == &target.default_model) {
                        quota.pin_protected(key.clone());
                    } else if !tracked {
                        // Untracked OAuth aliases stay gated until a quota
                        // refresh proves quota is available.
                        quota.gate_untracked(key.clone());
                    }
                }
            }
        }

        let antigravity = has_antigravity
            .then(|| AntigravityQuota::new("antigravity", antigravity_state_path));
        let antigravity_probe: Option<Arc<dyn QuotaProbe>> = has_antigravity.then(|| {
            Arc::new(TokenFileQuotaProbe {
                files: antigravity_token_files,
            }) as Arc<dyn QuotaProbe>
        });

        let (events, event_rx) = event_channel();

        let sticky = StickySessions::enabled_by_env().then(StickySessions::with_defaults);
        let router = Arc::new(VirtualRouter::new(
            routes,
            targets,
            config.classifier_config(),
            sticky,
        ));

        let transport =
            HttpTransport::new(Duration::from_secs(config.server.unary_timeout_secs))?;
        let adapter = Arc::new(ProviderAdapter::new(transport));
        let stage_log = Arc::new(StageLogger::from_env(home.as_deref()));
        let pipeline = ConversionPipeline::new(ReasoningPolicy::from_env());

        let executor = RequestExecutor::new(
            pipeline,
            Arc::clone(&router),
            quota.view(),
            adapter,
            events.clone(),
            stage_log,
            Duration::from_secs(config.server.stream_idle_timeout_secs),
        );

        let (shutdown, _) = watch::channel(false);
        let allowed_client_keys =
            AllowedClientKeys::from_keys(&config.client_authentication.allowed_keys);

        let state = Arc::new(Self {
            config,
            executor,
            router,
            quota,
            events,
            allowed_client_keys,
            pending_responses: PendingResponses::new(256),
            antigravity,
            antigravity_probe,
            shutdown,
        });
        Ok((state, event_rx))
    }
}
