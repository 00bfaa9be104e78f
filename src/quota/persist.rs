//! Quota snapshot persistence.
//!
//! The snapshot is a single JSON document written atomically (temp file,
//! then rename) so concurrent readers see either the old or the new
//! contents. Legacy `fatal` entries are migrated to `cooldown` on load,
//! keeping the longer of the two timers and defaulting to the automatic
//! cap when both are null.

use std::io;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::cooldown::AUTO_COOLDOWN_MAX_MS;
use super::{PoolReason, ProviderKey, QuotaState};
use crate::util::unix_now_ms;

const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    version: u32,
    saved_at_ms: u64,
    entries: Vec<QuotaState>,
}

/// Save the full state map atomically.
///
/// # Errors
///
/// Propagates filesystem errors; callers treat them as soft failures.
pub fn save_snapshot(
    path: &Path,
    states: &FxHashMap<ProviderKey, QuotaState>,
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut entries: Vec<QuotaState> = states.values().cloned().collect();
    entries.sort_by(|a, b| a.provider_key.as_str().cmp(b.provider_key.as_str()));
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        saved_at_ms: unix_now_ms(),
        entries,
    };
    let body = serde_json::to_vec_pretty(&file)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

/// Load and migrate a snapshot. A missing or unreadable file yields an
/// empty map; rehydration must never block startup.
#[must_use]
pub fn load_snapshot(path: &Path) -> FxHashMap<ProviderKey, QuotaState> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "quota snapshot unreadable, starting empty");
            }
            return FxHashMap::default();
        }
    };

    let file: SnapshotFile = match serde_json::from_slice(&raw) {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "quota snapshot corrupt, starting empty");
            return FxHashMap::default();
        }
    };

    let now = unix_now_ms();
    let mut out = FxHashMap::default();
    for mut state in file.entries {
        // Keys are re-canonicalized on load: old snapshots may carry the
        // legacy numeric-prefix alias form.
        state.provider_key = ProviderKey::new(state.provider_key.as_str());
        migrate_legacy_fatal(&mut state, now);
        out.insert(state.provider_key.clone(), state);
    }
    out
}

/// `fatal` is an import-only state: convert to a finite cooldown keeping
/// the longer of the two timers.
fn migrate_legacy_fatal(state: &mut QuotaState, now_ms: u64) {
    if state.reason != PoolReason::Fatal {
        return;
    }
    let until = match (state.cooldown_until_ms, state.blacklist_until_ms) {
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => now_ms + AUTO_COOLDOWN_MAX_MS,
    };
    state.reason = PoolReason::Cooldown;
    state.in_pool = false;
    state.cooldown_until_ms = Some(until);
    state.blacklist_until_ms = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(key: &str) -> QuotaState {
        QuotaState::new_ok(ProviderKey::new(key), 1_000)
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota/quota-manager.json");

        let mut states = FxHashMap::default();
        let mut depleted = state("p.a.m");
        depleted.in_pool = false;
        depleted.reason = PoolReason::QuotaDepleted;
        depleted.cooldown_until_ms = Some(9_999_999);
        depleted.total_tokens_used = 42;
        states.insert(depleted.provider_key.clone(), depleted);

        save_snapshot(&path, &states).unwrap();
        let loaded = load_snapshot(&path);
        let entry = loaded.get(&ProviderKey::new("p.a.m")).unwrap();
        assert_eq!(entry.reason, PoolReason::QuotaDepleted);
        assert_eq!(entry.cooldown_until_ms, Some(9_999_999));
        assert_eq!(entry.total_tokens_used, 42);
        // No stray temp file survives the rename.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(&dir.path().join("missing.json")).is_empty());
    }

    #[test]
    fn corrupt_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota-manager.json");
        std::fs::write(&path, b"{broken").unwrap();
        assert!(load_snapshot(&path).is_empty());
    }

    #[test]
    fn legacy_fatal_migrates_to_cooldown_with_longer_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota-manager.json");

        let mut states = FxHashMap::default();
        let mut fatal = state("p.a.m");
        fatal.in_pool = false;
        fatal.reason = PoolReason::Fatal;
        fatal.cooldown_until_ms = Some(5_000);
        fatal.blacklist_until_ms = Some(8_000);
        states.insert(fatal.provider_key.clone(), fatal);
        save_snapshot(&path, &states).unwrap();

        let loaded = load_snapshot(&path);
        let entry = loaded.get(&ProviderKey::new("p.a.m")).unwrap();
        assert_eq!(entry.reason, PoolReason::Cooldown);
        assert_eq!(entry.cooldown_until_ms, Some(8_000));
        assert!(entry.blacklist_until_ms.is_none());
    }

    #[test]
    fn legacy_fatal_without_timers_gets_capped_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota-manager.json");

        let mut states = FxHashMap::default();
        let mut fatal = state("p.a.m");
        fatal.in_pool = false;
        fatal.reason = PoolReason::Fatal;
        states.insert(fatal.provider_key.clone(), fatal);
        save_snapshot(&path, &states).unwrap();

        let before = unix_now_ms();
        let loaded = load_snapshot(&path);
        let entry = loaded.get(&ProviderKey::new("p.a.m")).unwrap();
        assert_eq!(entry.reason, PoolReason::Cooldown);
        let until = entry.cooldown_until_ms.unwrap();
        assert!(until >= before + AUTO_COOLDOWN_MAX_MS - 1_000);
        assert!(until <= before + AUTO_COOLDOWN_MAX_MS + 60_000);
    }

    #[test]
    fn legacy_keys_are_canonicalized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota-manager.json");

        let mut states = FxHashMap::default();
        let legacy = QuotaState::new_ok(
            // Bypass canonicalization to simulate an old snapshot.
            ProviderKey(String::from("antigravity.3-acc.gemini-3-pro")),
            0,
        );
        states.insert(legacy.provider_key.clone(), legacy);
        save_snapshot(&path, &states).unwrap();

        let loaded = load_snapshot(&path);
        assert!(loaded.contains_key(&ProviderKey::new("antigravity.acc.gemini-3-pro")));
    }
}
