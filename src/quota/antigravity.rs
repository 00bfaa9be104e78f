//! Antigravity (Cloud Code Assist) quota specifics.
//!
//! Antigravity accounts carry per-alias/model quota readable through the
//! OAuth channel. The daemon keeps a dedicated snapshot of it, pins
//! protected models out of pool, and runs a periodic refresh that feeds
//! `QUOTA_DEPLETED` / `QUOTA_RECOVERY` events back into the main state
//! machine. The OAuth token lifecycle itself is external; this module only
//! reads token files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::events::{codes, EventRuntime, ProviderErrorEvent, QuotaEventBus};
use super::ProviderKey;
use crate::util::unix_now_ms;

/// Refresh cadence while the daemon is enabled.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Consecutive refresh failures before the loop self-disables.
pub const MAX_REFRESH_FAILURES: u32 = 3;

/// Snapshot of per-alias/model antigravity quota.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntigravitySnapshot {
    #[serde(default)]
    pub saved_at_ms: u64,
    /// `alias.model` -> remaining quota units.
    #[serde(default)]
    pub remaining: FxHashMap<String, i64>,
}

/// One alias's quota as reported by a refresh probe.
#[derive(Debug, Clone)]
pub struct AliasQuota {
    pub alias: String,
    pub model: String,
    pub remaining: i64,
}

/// Source of fresh antigravity quota numbers. The production probe walks
/// the OAuth channel; tests substitute a canned implementation.
pub trait QuotaProbe: Send + Sync {
    /// Fetch current quota for every known alias/model pair.
    ///
    /// # Errors
    ///
    /// Returns an error string; three consecutive failures disable the loop.
    fn fetch(&self) -> Result<Vec<AliasQuota>, String>;
}

/// Probe that reads per-model quota numbers out of the antigravity token
/// files themselves (the OAuth refresh daemon that keeps those files fresh
/// is external). Files without a `quota` section contribute nothing; a
/// missing file is skipped, since token files are consumed, not owned.
pub struct TokenFileQuotaProbe {
    /// (alias, token file path) pairs.
    pub files: Vec<(String, PathBuf)>,
}

impl QuotaProbe for TokenFileQuotaProbe {
    fn fetch(&self) -> Result<Vec<AliasQuota>, String> {
        let mut out = Vec::new();
        for (alias, path) in &self.files {
            let raw = match std::fs::read(path) {
                Ok(raw) => raw,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(format!("{}: {err}", path.display())),
            };
            let value: serde_json::Value = serde_json::from_slice(&raw)
                .map_err(|err| format!("{}: {err}", path.display()))?;
            let Some(quota) = value.get("quota").and_then(serde_json::Value::as_object) else {
                continue;
            };
            for (model, remaining) in quota {
                if let Some(remaining) = remaining.as_i64() {
                    out.push(AliasQuota {
                        alias: alias.clone(),
                        model: model.clone(),
                        remaining,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Reason a snapshot interaction failed; session pins are cleared for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFailure {
    Missing,
    LoadError,
    SaveError,
}

impl SnapshotFailure {
    #[must_use]
    fn as_str(self) -> &'static str {
        match self {
            SnapshotFailure::Missing => "missing",
            SnapshotFailure::LoadError => "load_error",
            SnapshotFailure::SaveError => "save_error",
        }
    }
}

/// Antigravity quota bookkeeping: snapshot, session-alias pins, refresh
/// health.
pub struct AntigravityQuota {
    provider_id: String,
    snapshot_path: Option<PathBuf>,
    snapshot: Mutex<AntigravitySnapshot>,
    /// Session id -> pinned alias.
    session_pins: Mutex<FxHashMap<String, String>>,
    consecutive_failures: AtomicU32,
    refresh_disabled: AtomicBool,
    last_clear_reason: Mutex<Option<&'static str>>,
}

impl AntigravityQuota {
    #[must_use]
    pub fn new(provider_id: impl Into<String>, snapshot_path: Option<PathBuf>) -> Arc<Self> {
        let this = Arc::new(Self {
            provider_id: provider_id.into(),
            snapshot_path,
            snapshot: Mutex::new(AntigravitySnapshot::default()),
            session_pins: Mutex::new(FxHashMap::default()),
            consecutive_failures: AtomicU32::new(0),
            refresh_disabled: AtomicBool::new(false),
            last_clear_reason: Mutex::new(None),
        });
        this.load_snapshot();
        this
    }

    /// Protected model names listed in an antigravity token file.
    #[must_use]
    pub fn protected_models_from_token_file(path: &Path) -> Vec<String> {
        let Ok(raw) = std::fs::read(path) else {
            return Vec::new();
        };
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) else {
            return Vec::new();
        };
        value
            .get("protected_models")
            .and_then(serde_json::Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pin a session to an alias; cleared wholesale on snapshot failures.
    pub fn pin_session(&self, session_id: &str, alias: &str) {
        self.session_pins
            .lock()
            .insert(session_id.to_string(), alias.to_string());
    }

    #[must_use]
    pub fn pinned_alias(&self, session_id: &str) -> Option<String> {
        self.session_pins.lock().get(session_id).cloned()
    }

    /// Clear all session pins with a single-reason log line; repeated
    /// failures with the same reason stay quiet to avoid flooding.
    fn clear_session_pins(&self, failure: SnapshotFailure) {
        let mut pins = self.session_pins.lock();
        let had_pins = !pins.is_empty();
        pins.clear();
        drop(pins);

        let mut last = self.last_clear_reason.lock();
        if *last != Some(failure.as_str()) {
            *last = Some(failure.as_str());
            tracing::warn!(
                provider = %self.provider_id,
                reason = failure.as_str(),
                had_pins,
                "antigravity snapshot unavailable, session-alias pins cleared"
            );
        }
    }

    fn load_snapshot(&self) {
        let Some(path) = self.snapshot_path.as_deref() else {
            return;
        };
        match std::fs::read(path) {
            Ok(raw) => match serde_json::from_slice::<AntigravitySnapshot>(&raw) {
                Ok(snapshot) => {
                    *self.snapshot.lock() = snapshot;
                    *self.last_clear_reason.lock() = None;
                }
                Err(_) => self.clear_session_pins(SnapshotFailure::LoadError),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.clear_session_pins(SnapshotFailure::Missing);
            }
            Err(_) => self.clear_session_pins(SnapshotFailure::LoadError),
        }
    }

    fn save_snapshot(&self) {
        let Some(path) = self.snapshot_path.as_deref() else {
            return;
        };
        let snapshot = self.snapshot.lock().clone();
        let result = (|| -> io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = serde_json::to_vec_pretty(&snapshot)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, body)?;
            std::fs::rename(&tmp, path)
        })();
        if result.is_err() {
            self.clear_session_pins(SnapshotFailure::SaveError);
        }
    }

    /// Whether the refresh loop has self-disabled.
    #[must_use]
    pub fn refresh_disabled(&self) -> bool {
        self.refresh_disabled.load(Ordering::Acquire)
    }

    /// Manual re-arm after self-disable.
    pub fn refresh_now(&self, probe: &dyn QuotaProbe, bus: &QuotaEventBus) {
        self.refresh_disabled.store(false, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.refresh_once(probe, bus);
    }

    /// One refresh pass: probe quota, update the snapshot, emit
    /// depletion/recovery events.
    pub fn refresh_once(&self, probe: &dyn QuotaProbe, bus: &QuotaEventBus) {
        if self.refresh_disabled() {
            return;
        }
        match probe.fetch() {
            Ok(quotas) => {
                self.consecutive_failures.store(0, Ordering::Release);
                let mut snapshot = self.snapshot.lock();
                snapshot.saved_at_ms = unix_now_ms();
                for quota in &quotas {
                    let slot = format!("{}.{}", quota.alias, quota.model);
                    snapshot.remaining.insert(slot, quota.remaining);

                    let key = ProviderKey::new(format!(
                        "{}.{}.{}",
                        self.provider_id, quota.alias, quota.model
                    ));
                    let code = if quota.remaining > 0 {
                        codes::QUOTA_RECOVERY
                    } else {
                        codes::QUOTA_DEPLETED
                    };
                    bus.emit_error(ProviderErrorEvent {
                        provider_key: key,
                        status: None,
                        code: Some(code.to_string()),
                        stage: None,
                        message: format!("antigravity refresh: {} remaining", quota.remaining),
                        recoverable: true,
                        cooldown_ms: None,
                        details: None,
                        timestamp_ms: unix_now_ms(),
                        runtime: EventRuntime::default(),
                    });
                }
                drop(snapshot);
                self.save_snapshot();
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::warn!(
                    provider = %self.provider_id,
                    failures,
                    error = %err,
                    "antigravity quota refresh failed"
                );
                if failures >= MAX_REFRESH_FAILURES {
                    self.refresh_disabled.store(true, Ordering::Release);
                    tracing::warn!(
                        provider = %self.provider_id,
                        "antigravity refresh self-disabled until refresh_now()"
                    );
                }
            }
        }
    }

    /// Background loop driving [`Self::refresh_once`] on the fixed cadence.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        probe: Arc<dyn QuotaProbe>,
        bus: QuotaEventBus,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_once(probe.as_ref(), &bus),
                _ = shutdown.changed() => break,
            }
        }
    }
}
