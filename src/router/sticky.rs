//! Best-effort session stickiness.
//!
//! A bounded LRU maps session ids to the provider key that served them
//! last. Bindings are advisory: an unready target clears the binding rather
//! than pinning the session to a cooled-down provider. Safe to disable
//! entirely (`ROUTECODEX_ENABLE_STICKY` unset) with no correctness loss.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::quota::ProviderKey;
use crate::util::unix_now_ms;

pub const ENV_ENABLE_STICKY: &str = "ROUTECODEX_ENABLE_STICKY";

const DEFAULT_CAPACITY: usize = 4096;
const DEFAULT_TTL_MS: u64 = 30 * 60 * 1000;

#[derive(Debug, Clone)]
struct StickyEntry {
    provider_key: ProviderKey,
    last_used_ms: u64,
}

/// Bounded, TTL-pruned session -> provider-key bindings.
pub struct StickySessions {
    entries: Mutex<FxHashMap<String, StickyEntry>>,
    capacity: usize,
    ttl_ms: u64,
}

impl StickySessions {
    #[must_use]
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            capacity: capacity.max(1),
            ttl_ms,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL_MS)
    }

    /// Whether stickiness is enabled for this process.
    #[must_use]
    pub fn enabled_by_env() -> bool {
        std::env::var(ENV_ENABLE_STICKY)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }

    /// Look up a live binding, refreshing its recency.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<ProviderKey> {
        let now = unix_now_ms();
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(session_id)?;
        if now.saturating_sub(entry.last_used_ms) > self.ttl_ms {
            entries.remove(session_id);
            return None;
        }
        entry.last_used_ms = now;
        Some(entry.provider_key.clone())
    }

    /// Bind (or rebind) a session to a provider key.
    pub fn bind(&self, session_id: &str, provider_key: ProviderKey) {
        let now = unix_now_ms();
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(session_id) {
            prune(&mut entries, now, self.ttl_ms);
            if entries.len() >= self.capacity {
                evict_oldest(&mut entries);
            }
        }
        entries.insert(
            session_id.to_string(),
            StickyEntry {
                provider_key,
                last_used_ms: now,
            },
        );
    }

    /// Drop a binding (target became unready).
    pub fn clear(&self, session_id: &str) {
        self.entries.lock().remove(session_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn prune(entries: &mut FxHashMap<String, StickyEntry>, now: u64, ttl_ms: u64) {
    entries.retain(|_, entry| now.saturating_sub(entry.last_used_ms) <= ttl_ms);
}

fn evict_oldest(entries: &mut FxHashMap<String, StickyEntry>) {
    if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_used_ms)
        .map(|(session, _)| session.clone())
    {
        entries.remove(&oldest);
    }
}
