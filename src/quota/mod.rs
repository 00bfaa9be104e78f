//! Provider-quota daemon: the single source of truth for per-provider
//! pool-membership state.
//!
//! The daemon owns every `QuotaState` write. Producers (router, executor,
//! adapters) emit events over a one-way channel; the router reads through
//! the [`QuotaView`] snapshot interface. Automatic exclusions are always
//! finite and capped; only operator blacklists may run longer.

pub mod antigravity;
pub mod cooldown;
pub mod events;
pub mod persist;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex_lite::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::util::unix_now_ms;
use cooldown::{
    cap_auto_cooldown, escalating_cooldown_ms, parse_compact_duration_ms, parse_reset_after_ms,
    AUTO_COOLDOWN_MAX_MS, CAPACITY_COOLDOWN_MS, ERROR_SERIES_THRESHOLD,
    QUOTA_DEFAULT_COOLDOWN_MS,
};
use events::{codes, ProviderErrorEvent, ProviderSuccessEvent, QuotaEvent};

// ---------------------------------------------------------------------------
// ProviderKey
// ---------------------------------------------------------------------------

/// Canonical dotted identifier `providerId.alias.modelId`.
///
/// Construction canonicalizes the legacy numeric-prefix alias encoding
/// (`provider.12-alias.model` -> `provider.alias.model`), so every consumer
/// sees one spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(String);

fn legacy_alias_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([^.]+)\.(\d+)-([^.]+)\.(.+)$").expect("static pattern"))
}

impl ProviderKey {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if let Some(caps) = legacy_alias_pattern().captures(&raw) {
            return Self(format!("{}.{}.{}", &caps[1], &caps[3], &caps[4]));
        }
        Self(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `providerId` component.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// The `alias` component.
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        self.0.split('.').nth(1)
    }

    /// The `modelId` component (everything after the second dot).
    #[must_use]
    pub fn model_id(&self) -> Option<&str> {
        let mut split = self.0.splitn(3, '.');
        split.next()?;
        split.next()?;
        split.next()
    }
}

impl std::fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// State model
// ---------------------------------------------------------------------------

/// Why a provider key is (or is not) in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolReason {
    Ok,
    Cooldown,
    QuotaDepleted,
    /// Legacy import-only state; migrated to `Cooldown` on load.
    Fatal,
    Blacklist,
    /// Antigravity protected model, pinned out of pool.
    Protected,
    /// Google verification gating; cleared only by an operator.
    VerificationRequired,
}

/// How the target authenticates, as far as quota policy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    ApiKey,
    OAuth,
    #[default]
    Unknown,
}

/// Per-provider-key pool state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub provider_key: ProviderKey,
    pub in_pool: bool,
    pub reason: PoolReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklist_until_ms: Option<u64>,
    #[serde(default)]
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub priority_tier: u32,
    #[serde(default)]
    pub total_tokens_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_series: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at_ms: Option<u64>,
    #[serde(default)]
    pub consecutive_error_count: u32,
    #[serde(default)]
    pub window_start_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_url: Option<String>,
}

impl QuotaState {
    #[must_use]
    pub fn new_ok(provider_key: ProviderKey, now_ms: u64) -> Self {
        Self {
            provider_key,
            in_pool: true,
            reason: PoolReason::Ok,
            cooldown_until_ms: None,
            blacklist_until_ms: None,
            auth_kind: AuthKind::Unknown,
            priority_tier: 0,
            total_tokens_used: 0,
            last_error_series: None,
            last_error_code: None,
            last_error_at_ms: None,
            consecutive_error_count: 0,
            window_start_ms: now_ms,
            verification_url: None,
        }
    }

    /// Whether an operator blacklist window is currently holding.
    #[must_use]
    pub fn blacklist_active(&self, now_ms: u64) -> bool {
        self.reason == PoolReason::Blacklist
            && self.blacklist_until_ms.is_none_or(|until| now_ms < until)
    }

    /// Whether the router may select this key right now.
    #[must_use]
    pub fn is_ready(&self, now_ms: u64) -> bool {
        self.in_pool
            && self.reason == PoolReason::Ok
            && self.cooldown_until_ms.is_none_or(|until| now_ms >= until)
            && self.blacklist_until_ms.is_none_or(|until| now_ms >= until)
    }

    /// The untracked-oauth gate: cooled down with no deadline, waiting for
    /// an explicit quota-recovery signal.
    #[must_use]
    pub fn is_untracked_gate(&self) -> bool {
        self.reason == PoolReason::Cooldown && self.cooldown_until_ms.is_none()
    }

    fn to_ok(&mut self) {
        self.in_pool = true;
        self.reason = PoolReason::Ok;
        self.cooldown_until_ms = None;
        self.blacklist_until_ms = None;
        self.consecutive_error_count = 0;
    }

    /// Advance timers; returns true when the state changed.
    fn advance(&mut self, now_ms: u64) -> bool {
        match self.reason {
            PoolReason::Cooldown | PoolReason::QuotaDepleted => {
                if self.cooldown_until_ms.is_some_and(|until| now_ms >= until) {
                    self.to_ok();
                    return true;
                }
            }
            PoolReason::Blacklist => {
                if self.blacklist_until_ms.is_some_and(|until| now_ms >= until) {
                    self.to_ok();
                    return true;
                }
            }
            _ => {}
        }
        false
    }

    fn record_error(&mut self, series: &str, code: Option<&str>, now_ms: u64) {
        self.last_error_series = Some(series.to_string());
        self.last_error_code = code.map(str::to_string);
        self.last_error_at_ms = Some(now_ms);
        if self.window_start_ms == 0 {
            self.window_start_ms = now_ms;
        }
    }
}

/// Read-only projection of one entry, handed to the router.
#[derive(Debug, Clone)]
pub struct QuotaViewEntry {
    pub in_pool: bool,
    pub reason: PoolReason,
    pub cooldown_until_ms: Option<u64>,
    pub blacklist_until_ms: Option<u64>,
    pub priority_tier: u32,
    pub consecutive_error_count: u32,
    pub last_error_at_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Daemon configuration
// ---------------------------------------------------------------------------

pub const ENV_DAEMON_INTERVAL: &str = "ROUTECODEX_QUOTA_DAEMON_INTERVAL_MS";
pub const ENV_PERSIST_DEBOUNCE: &str = "ROUTECODEX_QUOTA_PERSIST_DEBOUNCE_MS";
pub const ENV_ERROR_PRIORITY_WINDOW: &str = "ROUTECODEX_QUOTA_ERROR_PRIORITY_WINDOW_MS";

#[derive(Debug, Clone)]
pub struct QuotaDaemonConfig {
    pub maintenance_interval_ms: u64,
    pub persist_debounce_ms: u64,
    pub error_priority_window_ms: u64,
    /// Snapshot path; `None` disables persistence (tests).
    pub state_path: Option<PathBuf>,
    pub antigravity_state_path: Option<PathBuf>,
}

impl Default for QuotaDaemonConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: 60_000,
            persist_debounce_ms: 5_000,
            error_priority_window_ms: 600_000,
            state_path: None,
            antigravity_state_path: None,
        }
    }
}

impl QuotaDaemonConfig {
    /// Default config with env overrides applied and snapshot paths under
    /// `<home>/.routecodex`.
    #[must_use]
    pub fn from_env(home: Option<&std::path::Path>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_ms(ENV_DAEMON_INTERVAL) {
            config.maintenance_interval_ms = ms;
        }
        if let Some(ms) = env_ms(ENV_PERSIST_DEBOUNCE) {
            config.persist_debounce_ms = ms;
        }
        if let Some(ms) = env_ms(ENV_ERROR_PRIORITY_WINDOW) {
            config.error_priority_window_ms = ms;
        }
        if let Some(home) = home {
            let base = home.join(".routecodex");
            config.state_path = Some(base.join("quota/quota-manager.json"));
            config.antigravity_state_path = Some(base.join("state/quota/antigravity.json"));
        }
        config
    }
}

fn env_ms(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Operator disable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisableMode {
    Cooldown,
    Blacklist,
}

struct QuotaShared {
    states: RwLock<FxHashMap<ProviderKey, QuotaState>>,
    dirty: AtomicBool,
    config: QuotaDaemonConfig,
}

/// Handle to the daemon state. Cloning is cheap; all clones share the state.
#[derive(Clone)]
pub struct QuotaDaemon {
    shared: Arc<QuotaShared>,
}

/// Read-only view handed to the router.
#[derive(Clone)]
pub struct QuotaView {
    shared: Arc<QuotaShared>,
}

impl QuotaDaemon {
    #[must_use]
    pub fn new(config: QuotaDaemonConfig) -> Self {
        let states = config
            .state_path
            .as_deref()
            .map(persist::load_snapshot)
            .unwrap_or_default();
        Self {
            shared: Arc::new(QuotaShared {
                states: RwLock::new(states),
                dirty: AtomicBool::new(false),
                config,
            }),
        }
    }

    #[must_use]
    pub fn view(&self) -> QuotaView {
        QuotaView {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether the daemon already tracks a key (i.e. it was rehydrated from
    /// the snapshot or seen earlier this process).
    #[must_use]
    pub fn contains(&self, key: &ProviderKey) -> bool {
        self.shared.states.read().contains_key(key)
    }

    /// Register a target at bootstrap without disturbing rehydrated state.
    pub fn register_target(&self, key: ProviderKey, auth_kind: AuthKind, priority_tier: u32) {
        let now = unix_now_ms();
        let mut states = self.shared.states.write();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| QuotaState::new_ok(key, now));
        state.auth_kind = auth_kind;
        state.priority_tier = priority_tier;
    }

    /// Gate an untracked OAuth alias: out of pool with no deadline until an
    /// explicit quota-recovery event shows quota.
    pub fn gate_untracked(&self, key: ProviderKey) {
        let now = unix_now_ms();
        let mut states = self.shared.states.write();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| QuotaState::new_ok(key, now));
        state.in_pool = false;
        state.reason = PoolReason::Cooldown;
        state.cooldown_until_ms = None;
        self.shared.dirty.store(true, Ordering::Release);
    }

    /// Pin a protected model out of pool; generic recovery never flips it.
    pub fn pin_protected(&self, key: ProviderKey) {
        let now = unix_now_ms();
        let mut states = self.shared.states.write();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| QuotaState::new_ok(key, now));
        state.in_pool = false;
        state.reason = PoolReason::Protected;
        state.cooldown_until_ms = None;
        self.shared.dirty.store(true, Ordering::Release);
    }

    /// Apply one event to the state map.
    pub fn handle_event(&self, event: QuotaEvent) {
        match event {
            QuotaEvent::Error(error) => self.handle_error(&error),
            QuotaEvent::Success(success) => self.handle_success(&success),
        }
    }

    fn handle_error(&self, event: &ProviderErrorEvent) {
        let key = ProviderKey::new(event.provider_key.as_str());
        let now = event.timestamp_ms;
        let mut states = self.shared.states.write();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| QuotaState::new_ok(key.clone(), now));

        // An active operator blacklist refuses every non-operator overwrite.
        if state.blacklist_active(now) {
            tracing::debug!(provider_key = %key, "event ignored, operator blacklist active");
            return;
        }

        match event.code.as_deref() {
            Some(codes::QUOTA_DEPLETED) => {
                let ttl = event
                    .cooldown_ms
                    .or_else(|| parse_reset_after_ms(&event.message))
                    .or_else(|| quota_reset_delay_from_details(event.details.as_ref()))
                    .unwrap_or(QUOTA_DEFAULT_COOLDOWN_MS);
                set_quota_depleted(state, now, ttl);
                state.record_error("quota", event.code.as_deref(), now);
            }
            Some(codes::QUOTA_RECOVERY) => {
                // Recovery applies to quota depletion and the untracked-oauth
                // gate; it never shortens an active non-quota cooldown.
                if state.reason == PoolReason::QuotaDepleted || state.is_untracked_gate() {
                    state.to_ok();
                }
            }
            Some(codes::IFLOW_BLOCKED) => {
                set_fatal_cooldown(state, now);
                state.record_error("blocked", event.code.as_deref(), now);
            }
            Some(codes::VERIFICATION_REQUIRED) => {
                set_verification_required(state, event);
            }
            _ => self.dispatch_by_status(state, event, now),
        }

        self.shared.dirty.store(true, Ordering::Release);
    }

    fn dispatch_by_status(&self, state: &mut QuotaState, event: &ProviderErrorEvent, now: u64) {
        // Auth/config/compat-stage failures are fatal-for-quota regardless of
        // status: automatic cooldown, never indefinite.
        if matches!(event.stage.as_deref(), Some("auth" | "config" | "compat")) {
            set_fatal_cooldown(state, now);
            state.record_error("fatal", event.code.as_deref(), now);
            return;
        }

        match event.status {
            Some(429) => {
                let quota_ttl = event
                    .cooldown_ms
                    .filter(|_| message_signals_quota(&event.message))
                    .or_else(|| parse_reset_after_ms(&event.message))
                    .or_else(|| quota_reset_delay_from_details(event.details.as_ref()));
                if let Some(ttl) = quota_ttl {
                    set_quota_depleted(state, now, ttl);
                    state.record_error("quota", event.code.as_deref(), now);
                } else {
                    // Model capacity, not quota: short exclusion.
                    let ttl = event.cooldown_ms.unwrap_or(CAPACITY_COOLDOWN_MS);
                    state.in_pool = false;
                    state.reason = PoolReason::Cooldown;
                    state.cooldown_until_ms = Some(now + cap_auto_cooldown(ttl));
                    state.record_error("capacity", event.code.as_deref(), now);
                }
            }
            Some(status @ (401 | 402 | 403)) => {
                if status == 403 && google_verification_url(event).is_some() {
                    set_verification_required(state, event);
                } else {
                    set_fatal_cooldown(state, now);
                    state.record_error("auth", event.code.as_deref(), now);
                }
            }
            Some(434) => {
                set_fatal_cooldown(state, now);
                state.record_error("blocked", event.code.as_deref(), now);
            }
            _ => {
                state.consecutive_error_count = state.consecutive_error_count.saturating_add(1);
                state.record_error("generic", event.code.as_deref(), now);
                if state.consecutive_error_count >= ERROR_SERIES_THRESHOLD {
                    let ttl = escalating_cooldown_ms(state.consecutive_error_count);
                    state.in_pool = false;
                    state.reason = PoolReason::Cooldown;
                    state.cooldown_until_ms = Some(now + ttl);
                }
            }
        }
    }

    fn handle_success(&self, event: &ProviderSuccessEvent) {
        let key = ProviderKey::new(event.provider_key.as_str());
        let now = event.timestamp_ms;
        let mut states = self.shared.states.write();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| QuotaState::new_ok(key, now));

        state.consecutive_error_count = 0;
        state.last_error_series = None;
        state.last_error_code = None;
        if let Some(tokens) = event.tokens_used {
            state.total_tokens_used = state.total_tokens_used.saturating_add(tokens);
        }
        // A lapsed timer heals lazily on the next observation.
        state.advance(now);
        self.shared.dirty.store(true, Ordering::Release);
    }

    /// Operator exclusion; TTLs are NOT capped.
    pub fn disable_provider(&self, key: &ProviderKey, mode: DisableMode, duration_ms: Option<u64>) {
        let key = ProviderKey::new(key.as_str());
        let now = unix_now_ms();
        let mut states = self.shared.states.write();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| QuotaState::new_ok(key, now));
        state.in_pool = false;
        match mode {
            DisableMode::Cooldown => {
                state.reason = PoolReason::Cooldown;
                state.cooldown_until_ms = duration_ms.map(|ms| now + ms);
            }
            DisableMode::Blacklist => {
                state.reason = PoolReason::Blacklist;
                state.blacklist_until_ms = duration_ms.map(|ms| now + ms);
            }
        }
        self.shared.dirty.store(true, Ordering::Release);
    }

    /// Operator recovery; clears any exclusion including blacklists.
    pub fn recover_provider(&self, key: &ProviderKey) {
        let key = ProviderKey::new(key.as_str());
        let mut states = self.shared.states.write();
        if let Some(state) = states.get_mut(&key) {
            state.to_ok();
            state.verification_url = None;
            self.shared.dirty.store(true, Ordering::Release);
        }
    }

    /// Operator reset: fresh state, counters zeroed.
    pub fn reset_provider(&self, key: &ProviderKey) {
        let key = ProviderKey::new(key.as_str());
        let now = unix_now_ms();
        let mut states = self.shared.states.write();
        if let Some(state) = states.get_mut(&key) {
            let auth_kind = state.auth_kind;
            let priority_tier = state.priority_tier;
            let mut fresh = QuotaState::new_ok(key, now);
            fresh.auth_kind = auth_kind;
            fresh.priority_tier = priority_tier;
            *state = fresh;
            self.shared.dirty.store(true, Ordering::Release);
        }
    }

    /// Advance all timers; returns the number of entries that recovered.
    pub fn maintenance_tick(&self) -> usize {
        let now = unix_now_ms();
        let mut states = self.shared.states.write();
        let mut changed = 0;
        for state in states.values_mut() {
            if state.advance(now) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.shared.dirty.store(true, Ordering::Release);
        }
        changed
    }

    /// Write the snapshot if anything changed since the last save.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors from the snapshot write.
    pub fn persist_now(&self) -> std::io::Result<()> {
        let Some(path) = self.shared.config.state_path.as_deref() else {
            return Ok(());
        };
        if !self.shared.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let states = self.shared.states.read().clone();
        persist::save_snapshot(path, &states)
    }

    /// Clone of all entries for the admin surface.
    #[must_use]
    pub fn entries(&self) -> Vec<QuotaState> {
        let states = self.shared.states.read();
        let mut out: Vec<QuotaState> = states.values().cloned().collect();
        out.sort_by(|a, b| a.provider_key.as_str().cmp(b.provider_key.as_str()));
        out
    }

    /// Event loop: drain events, run the maintenance tick, persist on a
    /// debounce, save once more on shutdown.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<QuotaEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let maintenance_interval =
            Duration::from_millis(self.shared.config.maintenance_interval_ms.max(1000));
        let debounce = Duration::from_millis(self.shared.config.persist_debounce_ms.max(100));
        let mut maintenance = tokio::time::interval(maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut persist_deadline: Option<tokio::time::Instant> = None;

        loop {
            let deadline = persist_deadline;
            let persist_timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            self.handle_event(event);
                            if persist_deadline.is_none() {
                                persist_deadline =
                                    Some(tokio::time::Instant::now() + debounce);
                            }
                        }
                        None => break,
                    }
                }
                _ = maintenance.tick() => {
                    self.maintenance_tick();
                    if let Err(err) = self.persist_now() {
                        tracing::warn!(error = %err, "quota snapshot save failed");
                    }
                }
                () = persist_timer => {
                    persist_deadline = None;
                    if let Err(err) = self.persist_now() {
                        tracing::warn!(error = %err, "quota snapshot save failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.shared.dirty.store(true, Ordering::Release);
        if let Err(err) = self.persist_now() {
            tracing::warn!(error = %err, "quota snapshot save on shutdown failed");
        }
    }
}

impl QuotaView {
    /// Per-key entry snapshot, if the daemon tracks the key.
    #[must_use]
    pub fn entry(&self, key: &ProviderKey) -> Option<QuotaViewEntry> {
        let states = self.shared.states.read();
        states.get(key).map(|s| QuotaViewEntry {
            in_pool: s.in_pool,
            reason: s.reason,
            cooldown_until_ms: s.cooldown_until_ms,
            blacklist_until_ms: s.blacklist_until_ms,
            priority_tier: s.priority_tier,
            consecutive_error_count: s.consecutive_error_count,
            last_error_at_ms: s.last_error_at_ms,
        })
    }

    /// Whether a key is selectable right now. Untracked keys are ready:
    /// targets register at bootstrap, so an absent entry means no recorded
    /// trouble.
    #[must_use]
    pub fn is_ready(&self, key: &ProviderKey, now_ms: u64) -> bool {
        let states = self.shared.states.read();
        states.get(key).is_none_or(|s| s.is_ready(now_ms))
    }

    /// Selection penalty: recent consecutive errors (capped), zero once the
    /// last error falls outside the priority window.
    #[must_use]
    pub fn selection_penalty(&self, key: &ProviderKey, now_ms: u64) -> u32 {
        const PENALTY_CAP: u32 = 10;
        let window = self.shared.config.error_priority_window_ms;
        let states = self.shared.states.read();
        let Some(state) = states.get(key) else {
            return 0;
        };
        match state.last_error_at_ms {
            Some(at) if now_ms.saturating_sub(at) <= window => {
                state.consecutive_error_count.min(PENALTY_CAP)
            }
            _ => 0,
        }
    }

    /// Soonest recovery instant across keys, for Retry-After hints.
    #[must_use]
    pub fn soonest_recovery_ms(&self, keys: &[ProviderKey], now_ms: u64) -> Option<u64> {
        let states = self.shared.states.read();
        keys.iter()
            .filter_map(|key| {
                let state = states.get(key)?;
                let until = state.cooldown_until_ms.or(state.blacklist_until_ms)?;
                (until > now_ms).then_some(until - now_ms)
            })
            .min()
    }
}

fn set_quota_depleted(state: &mut QuotaState, now: u64, ttl_ms: u64) {
    state.in_pool = false;
    state.reason = PoolReason::QuotaDepleted;
    state.cooldown_until_ms = Some(now + cap_auto_cooldown(ttl_ms));
}

fn set_fatal_cooldown(state: &mut QuotaState, now: u64) {
    state.in_pool = false;
    state.reason = PoolReason::Cooldown;
    state.cooldown_until_ms = Some(now + AUTO_COOLDOWN_MAX_MS);
}

fn set_verification_required(state: &mut QuotaState, event: &ProviderErrorEvent) {
    state.in_pool = false;
    state.reason = PoolReason::VerificationRequired;
    state.cooldown_until_ms = None;
    state.verification_url = google_verification_url(event);
    tracing::warn!(
        provider_key = %state.provider_key,
        url = state.verification_url.as_deref().unwrap_or(""),
        "provider requires account verification, removed from pool"
    );
}

fn message_signals_quota(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("quota") || lower.contains("reset after")
}

fn quota_reset_delay_from_details(details: Option<&serde_json::Value>) -> Option<u64> {
    let raw = details?
        .get("quotaResetDelay")
        .and_then(serde_json::Value::as_str)?;
    parse_compact_duration_ms(raw)
}

fn google_verification_url(event: &ProviderErrorEvent) -> Option<String> {
    if let Some(url) = event
        .details
        .as_ref()
        .and_then(|d| d.get("verificationUrl"))
        .and_then(serde_json::Value::as_str)
    {
        return Some(url.to_string());
    }
    let start = event.message.find("https://accounts.google.com")?;
    let rest = &event.message[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '"')
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::EventRuntime;

    fn daemon() -> QuotaDaemon {
        QuotaDaemon::new(QuotaDaemonConfig::default())
    }

    fn error_event(key: &str, status: Option<u16>, code: Option<&str>) -> ProviderErrorEvent {
        ProviderErrorEvent {
            provider_key: ProviderKey::new(key),
            status,
            code: code.map(str::to_string),
            stage: None,
            message: String::new(),
            recoverable: true,
            cooldown_ms: None,
            details: None,
            timestamp_ms: unix_now_ms(),
            runtime: EventRuntime::default(),
        }
    }

    #[test]
    fn provider_key_canonicalization_strips_numeric_alias_prefix() {
        let key = ProviderKey::new("antigravity.12-foo.gemini-3-pro");
        assert_eq!(key.as_str(), "antigravity.foo.gemini-3-pro");
        assert_eq!(key.provider_id(), "antigravity");
        assert_eq!(key.alias(), Some("foo"));
        assert_eq!(key.model_id(), Some("gemini-3-pro"));

        let canonical = ProviderKey::new("openai.default.gpt-4");
        assert_eq!(canonical.as_str(), "openai.default.gpt-4");

        let pattern = legacy_alias_pattern();
        assert!(!pattern.is_match(key.as_str()));
    }

    #[test]
    fn quota_depleted_sets_capped_cooldown() {
        let d = daemon();
        let mut event = error_event("p.a.m", Some(429), Some(codes::QUOTA_DEPLETED));
        event.message = "quota exceeded, reset after 1h30m".into();
        let now = event.timestamp_ms;
        d.handle_event(QuotaEvent::Error(event));

        let entries = d.entries();
        assert_eq!(entries[0].reason, PoolReason::QuotaDepleted);
        assert!(!entries[0].in_pool);
        let until = entries[0].cooldown_until_ms.unwrap();
        assert_eq!(until - now, 5_400_000);
    }

    #[test]
    fn quota_depleted_huge_reset_is_capped_at_ceiling() {
        let d = daemon();
        let mut event = error_event("p.a.m", Some(429), Some(codes::QUOTA_DEPLETED));
        event.cooldown_ms = Some(24 * 60 * 60 * 1000);
        let now = event.timestamp_ms;
        d.handle_event(QuotaEvent::Error(event));
        let until = d.entries()[0].cooldown_until_ms.unwrap();
        assert_eq!(until - now, AUTO_COOLDOWN_MAX_MS);
    }

    #[test]
    fn quota_recovery_flips_depleted_back_to_ok() {
        let d = daemon();
        d.handle_event(QuotaEvent::Error(error_event(
            "p.a.m",
            Some(429),
            Some(codes::QUOTA_DEPLETED),
        )));
        d.handle_event(QuotaEvent::Error(error_event(
            "p.a.m",
            None,
            Some(codes::QUOTA_RECOVERY),
        )));
        let entries = d.entries();
        assert_eq!(entries[0].reason, PoolReason::Ok);
        assert!(entries[0].in_pool);
    }

    #[test]
    fn quota_recovery_opens_untracked_oauth_gate() {
        let d = daemon();
        let key = ProviderKey::new("antigravity.acc1.gemini-3-pro");
        d.gate_untracked(key.clone());
        assert!(!d.view().is_ready(&key, unix_now_ms()));

        d.handle_event(QuotaEvent::Error(error_event(
            key.as_str(),
            None,
            Some(codes::QUOTA_RECOVERY),
        )));
        assert!(d.view().is_ready(&key, unix_now_ms()));
    }

    #[test]
    fn quota_recovery_never_shortens_active_capacity_cooldown() {
        let d = daemon();
        d.handle_event(QuotaEvent::Error(error_event("p.a.m", Some(429), None)));
        assert_eq!(d.entries()[0].reason, PoolReason::Cooldown);
        let until = d.entries()[0].cooldown_until_ms;

        d.handle_event(QuotaEvent::Error(error_event(
            "p.a.m",
            None,
            Some(codes::QUOTA_RECOVERY),
        )));
        assert_eq!(d.entries()[0].reason, PoolReason::Cooldown);
        assert_eq!(d.entries()[0].cooldown_until_ms, until);
    }

    #[test]
    fn auth_failures_get_finite_fatal_cooldown() {
        let d = daemon();
        let event = error_event("p.a.m", Some(401), None);
        let now = event.timestamp_ms;
        d.handle_event(QuotaEvent::Error(event));
        let entry = &d.entries()[0];
        assert_eq!(entry.reason, PoolReason::Cooldown);
        assert_eq!(entry.cooldown_until_ms.unwrap() - now, AUTO_COOLDOWN_MAX_MS);
    }

    #[test]
    fn verification_gating_records_url() {
        let d = daemon();
        let mut event = error_event("antigravity.a.m", Some(403), None);
        event.message =
            "verify at https://accounts.google.com/signin/continue?x=1 to continue".into();
        d.handle_event(QuotaEvent::Error(event));
        let entry = &d.entries()[0];
        assert_eq!(entry.reason, PoolReason::VerificationRequired);
        assert_eq!(
            entry.verification_url.as_deref(),
            Some("https://accounts.google.com/signin/continue?x=1")
        );
    }

    #[test]
    fn generic_errors_escalate_after_threshold() {
        let d = daemon();
        for _ in 0..ERROR_SERIES_THRESHOLD {
            d.handle_event(QuotaEvent::Error(error_event("p.a.m", Some(500), None)));
        }
        let entry = &d.entries()[0];
        assert_eq!(entry.consecutive_error_count, ERROR_SERIES_THRESHOLD);
        assert_eq!(entry.reason, PoolReason::Cooldown);
        assert!(entry.cooldown_until_ms.is_some());
    }

    #[test]
    fn success_resets_error_series_and_records_tokens() {
        let d = daemon();
        d.handle_event(QuotaEvent::Error(error_event("p.a.m", Some(500), None)));
        d.handle_event(QuotaEvent::Success(ProviderSuccessEvent::new(
            ProviderKey::new("p.a.m"),
            Some(250),
            EventRuntime::default(),
        )));
        let entry = &d.entries()[0];
        assert_eq!(entry.consecutive_error_count, 0);
        assert!(entry.last_error_code.is_none());
        assert_eq!(entry.total_tokens_used, 250);
    }

    #[test]
    fn operator_blacklist_refuses_automatic_recovery() {
        let d = daemon();
        let key = ProviderKey::new("p.a.m");
        d.disable_provider(&key, DisableMode::Blacklist, Some(3_600_000));

        d.handle_event(QuotaEvent::Error(error_event(
            key.as_str(),
            None,
            Some(codes::QUOTA_RECOVERY),
        )));
        let entry = &d.entries()[0];
        assert_eq!(entry.reason, PoolReason::Blacklist);
        assert!(!entry.in_pool);

        d.recover_provider(&key);
        assert_eq!(d.entries()[0].reason, PoolReason::Ok);
    }

    #[test]
    fn operator_blacklist_is_not_capped() {
        let d = daemon();
        let key = ProviderKey::new("p.a.m");
        let now = unix_now_ms();
        d.disable_provider(&key, DisableMode::Blacklist, Some(10 * AUTO_COOLDOWN_MAX_MS));
        let until = d.entries()[0].blacklist_until_ms.unwrap();
        assert!(until - now >= 10 * AUTO_COOLDOWN_MAX_MS);
    }

    #[test]
    fn maintenance_tick_recovers_expired_cooldowns() {
        let d = daemon();
        let mut event = error_event("p.a.m", Some(429), None);
        event.cooldown_ms = Some(1);
        event.timestamp_ms = unix_now_ms().saturating_sub(10_000);
        d.handle_event(QuotaEvent::Error(event));
        assert_eq!(d.maintenance_tick(), 1);
        assert_eq!(d.entries()[0].reason, PoolReason::Ok);
    }

    #[test]
    fn protected_models_survive_maintenance_and_recovery_events() {
        let d = daemon();
        let key = ProviderKey::new("antigravity.acc1.gemini-3-pro-protected");
        d.pin_protected(key.clone());
        d.maintenance_tick();
        d.handle_event(QuotaEvent::Error(error_event(
            key.as_str(),
            None,
            Some(codes::QUOTA_RECOVERY),
        )));
        let entry = &d.entries()[0];
        assert_eq!(entry.reason, PoolReason::Protected);
        assert!(!entry.in_pool);
    }

    #[test]
    fn view_penalty_respects_error_window() {
        let d = daemon();
        let key = ProviderKey::new("p.a.m");
        d.handle_event(QuotaEvent::Error(error_event(key.as_str(), Some(500), None)));
        let now = unix_now_ms();
        assert_eq!(d.view().selection_penalty(&key, now), 1);
        // Outside the window the penalty decays to zero.
        assert_eq!(
            d.view().selection_penalty(&key, now + 601_000),
            0
        );
    }

    #[test]
    fn soonest_recovery_hint_is_minimum_over_keys() {
        let d = daemon();
        let a = ProviderKey::new("p.a.m1");
        let b = ProviderKey::new("p.a.m2");
        d.disable_provider(&a, DisableMode::Cooldown, Some(50_000));
        d.disable_provider(&b, DisableMode::Cooldown, Some(20_000));
        let hint = d
            .view()
            .soonest_recovery_ms(&[a, b], unix_now_ms())
            .unwrap();
        assert!(hint <= 20_000);
    }
}
