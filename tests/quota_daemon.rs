//! Quota daemon end-to-end scenarios: depletion with parsed reset hints,
//! operator blacklists, persistence, and the cooldown ceiling.

use routecodex::quota::cooldown::AUTO_COOLDOWN_MAX_MS;
use routecodex::quota::events::{codes, EventRuntime, ProviderErrorEvent, QuotaEvent};
use routecodex::quota::{
    DisableMode, PoolReason, ProviderKey, QuotaDaemon, QuotaDaemonConfig,
};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn error_event(key: &str, status: Option<u16>, message: &str) -> ProviderErrorEvent {
    ProviderErrorEvent {
        provider_key: ProviderKey::new(key),
        status,
        code: None,
        stage: None,
        message: message.to_string(),
        recoverable: true,
        cooldown_ms: None,
        details: None,
        timestamp_ms: now_ms(),
        runtime: EventRuntime::default(),
    }
}

#[test]
fn reset_after_message_sets_quota_depletion_with_parsed_ttl() {
    // S3: HTTP 429 carrying "reset after 1h30m".
    let daemon = QuotaDaemon::new(QuotaDaemonConfig::default());
    let key = ProviderKey::new("openai.default.gpt-4");
    let before = now_ms();
    daemon.handle_event(QuotaEvent::Error(error_event(
        key.as_str(),
        Some(429),
        "quota exceeded, reset after 1h30m",
    )));

    let entry = daemon
        .entries()
        .into_iter()
        .find(|e| e.provider_key == key)
        .unwrap();
    assert_eq!(entry.reason, PoolReason::QuotaDepleted);
    assert!(!entry.in_pool);
    let ttl = entry.cooldown_until_ms.unwrap() - before;
    assert!((5_390_000..=5_410_000).contains(&ttl), "ttl was {ttl}");

    // The router view refuses the target until the window lapses.
    assert!(!daemon.view().is_ready(&key, now_ms()));
    assert!(daemon
        .view()
        .is_ready(&key, now_ms() + 5_400_000 + 1_000));
}

#[test]
fn cooldown_ceiling_holds_for_any_hinted_ttl() {
    let daemon = QuotaDaemon::new(QuotaDaemonConfig::default());
    for (idx, hint) in ["reset after 99h", "reset after 4h", "reset after 10s"]
        .iter()
        .enumerate()
    {
        let key = format!("p.a.m{idx}");
        let before = now_ms();
        daemon.handle_event(QuotaEvent::Error(error_event(&key, Some(429), hint)));
        let entry = daemon
            .entries()
            .into_iter()
            .find(|e| e.provider_key == ProviderKey::new(&key))
            .unwrap();
        let ttl = entry.cooldown_until_ms.unwrap().saturating_sub(before);
        assert!(
            ttl <= AUTO_COOLDOWN_MAX_MS + 1_000,
            "automatic cooldown exceeded the ceiling: {ttl}"
        );
    }
}

#[test]
fn operator_blacklist_blocks_quota_recovery_until_recovered() {
    // S6: blacklist overrides automatic recovery.
    let daemon = QuotaDaemon::new(QuotaDaemonConfig::default());
    let key = ProviderKey::new("glm.default.glm-4-plus");
    daemon.disable_provider(&key, DisableMode::Blacklist, Some(3_600_000));

    let mut recovery = error_event(key.as_str(), None, "quota back");
    recovery.code = Some(codes::QUOTA_RECOVERY.to_string());
    daemon.handle_event(QuotaEvent::Error(recovery));

    let entry = daemon
        .entries()
        .into_iter()
        .find(|e| e.provider_key == key)
        .unwrap();
    assert_eq!(entry.reason, PoolReason::Blacklist);
    assert!(!entry.in_pool);
    assert!(!daemon.view().is_ready(&key, now_ms()));

    daemon.recover_provider(&key);
    assert!(daemon.view().is_ready(&key, now_ms()));
}

#[test]
fn snapshot_survives_restart_with_key_canonicalization() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota/quota-manager.json");

    {
        let config = QuotaDaemonConfig {
            state_path: Some(path.clone()),
            ..QuotaDaemonConfig::default()
        };
        let daemon = QuotaDaemon::new(config);
        daemon.handle_event(QuotaEvent::Error(error_event(
            "antigravity.7-acc.gemini-3-pro",
            Some(429),
            "quota exceeded, reset after 2h",
        )));
        daemon.persist_now().unwrap();
    }

    let config = QuotaDaemonConfig {
        state_path: Some(path),
        ..QuotaDaemonConfig::default()
    };
    let daemon = QuotaDaemon::new(config);
    let entry = daemon
        .entries()
        .into_iter()
        .find(|e| e.provider_key == ProviderKey::new("antigravity.acc.gemini-3-pro"))
        .expect("canonical key survives reload");
    assert_eq!(entry.reason, PoolReason::QuotaDepleted);
}

#[test]
fn antigravity_reset_delay_format_is_honored() {
    let daemon = QuotaDaemon::new(QuotaDaemonConfig::default());
    let key = ProviderKey::new("antigravity.acc1.gemini-3-pro");
    let mut event = error_event(key.as_str(), Some(429), "resource exhausted");
    event.details = Some(serde_json::json!({"quotaResetDelay": "3h22m41s"}));
    let before = now_ms();
    daemon.handle_event(QuotaEvent::Error(event));

    let entry = daemon
        .entries()
        .into_iter()
        .find(|e| e.provider_key == key)
        .unwrap();
    assert_eq!(entry.reason, PoolReason::QuotaDepleted);
    // 3h22m41s exceeds the 3h ceiling, so the cap applies.
    let ttl = entry.cooldown_until_ms.unwrap() - before;
    assert!(ttl <= AUTO_COOLDOWN_MAX_MS + 1_000);
}
