//! Virtual router: classify a canonical request into a logical route, then
//! select a ready provider+model target from that route's tier list.
//!
//! Pool-state authority lives in the quota daemon; the router only reads
//! the [`QuotaView`] at selection time and keeps local round-robin cursors.
//! Recovery from cooldown is lazy: readiness is recomputed on every
//! `route()` call.

pub mod classify;
pub mod sticky;

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::protocol::canonical::ChatRequest;
use crate::providers::Target;
use crate::quota::{ProviderKey, QuotaView};
use crate::util::unix_now_ms;

pub use classify::{ClassifierConfig, RouteSelection, DEFAULT_ROUTE};
pub use sticky::StickySessions;

/// Tier selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierMode {
    #[default]
    Priority,
    Weighted,
    RoundRobin,
}

/// One ordered group of targets within a route.
#[derive(Debug, Clone)]
pub struct RouteTier {
    pub id: String,
    pub priority: i32,
    pub backup: bool,
    pub mode: TierMode,
    pub targets: Vec<ProviderKey>,
}

/// The router's answer for one attempt.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub route_name: String,
    pub pool_id: String,
    pub provider_key: ProviderKey,
    pub target: Arc<Target>,
}

/// Route classification + tiered target selection.
pub struct VirtualRouter {
    routes: FxHashMap<String, Vec<RouteTier>>,
    targets: FxHashMap<ProviderKey, Arc<Target>>,
    classifier: ClassifierConfig,
    cursors: Mutex<FxHashMap<String, usize>>,
    sticky: Option<StickySessions>,
}

impl VirtualRouter {
    #[must_use]
    pub fn new(
        routes: FxHashMap<String, Vec<RouteTier>>,
        targets: FxHashMap<ProviderKey, Arc<Target>>,
        classifier: ClassifierConfig,
        sticky: Option<StickySessions>,
    ) -> Self {
        let mut routes = routes;
        for tiers in routes.values_mut() {
            // Primary tiers are always exhausted before backup tiers.
            tiers.sort_by_key(|tier| (tier.backup, tier.priority));
        }
        Self {
            routes,
            targets,
            classifier,
            cursors: Mutex::new(FxHashMap::default()),
            sticky,
        }
    }

    #[must_use]
    pub fn target(&self, key: &ProviderKey) -> Option<Arc<Target>> {
        self.targets.get(key).cloned()
    }

    /// Classify and select a target, skipping `exclude` (targets already
    /// attempted for this request).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoAvailableProvider`] when no ready target
    /// remains; a request is never queued.
    pub fn route(
        &self,
        request: &ChatRequest,
        quota: &QuotaView,
        exclude: &[ProviderKey],
    ) -> Result<RouteDecision, GatewayError> {
        let now = unix_now_ms();

        match classify::classify(request, &self.classifier) {
            RouteSelection::Forced(key) => self.route_forced(&key, quota, exclude, now),
            RouteSelection::Named(name) => self.route_named(&name, request, quota, exclude, now),
        }
    }

    fn route_forced(
        &self,
        key: &ProviderKey,
        quota: &QuotaView,
        exclude: &[ProviderKey],
        now: u64,
    ) -> Result<RouteDecision, GatewayError> {
        let ready = self.targets.contains_key(key)
            && !exclude.contains(key)
            && quota.is_ready(key, now);
        if !ready {
            return Err(GatewayError::NoAvailableProvider {
                route: format!("directive:{key}"),
                retry_after_ms: quota.soonest_recovery_ms(std::slice::from_ref(key), now),
            });
        }
        Ok(RouteDecision {
            route_name: "directive".to_string(),
            pool_id: "directive".to_string(),
            provider_key: key.clone(),
            target: Arc::clone(&self.targets[key]),
        })
    }

    fn route_named(
        &self,
        name: &str,
        request: &ChatRequest,
        quota: &QuotaView,
        exclude: &[ProviderKey],
        now: u64,
    ) -> Result<RouteDecision, GatewayError> {
        let (route_name, tiers) = match self.routes.get(name) {
            Some(tiers) => (name, tiers),
            // Unknown route names (bad hints, unconfigured heuristic routes)
            // fall back to the default route.
            None => match self.routes.get(DEFAULT_ROUTE) {
                Some(tiers) => (DEFAULT_ROUTE, tiers),
                None => {
                    return Err(GatewayError::NoAvailableProvider {
                        route: name.to_string(),
                        retry_after_ms: None,
                    })
                }
            },
        };

        // Sticky binding first, subject to current readiness and membership
        // in this route.
        if let (Some(sticky), Some(session_id)) = (
            self.sticky.as_ref(),
            request.metadata.session_id.as_deref(),
        ) {
            if let Some(bound) = sticky.get(session_id) {
                let in_route = tiers.iter().any(|tier| tier.targets.contains(&bound));
                if in_route && !exclude.contains(&bound) && quota.is_ready(&bound, now) {
                    if let Some(target) = self.targets.get(&bound) {
                        return Ok(RouteDecision {
                            route_name: route_name.to_string(),
                            pool_id: "sticky".to_string(),
                            provider_key: bound,
                            target: Arc::clone(target),
                        });
                    }
                }
                sticky.clear(session_id);
            }
        }

        for tier in tiers {
            let ready: Vec<&ProviderKey> = tier
                .targets
                .iter()
                .filter(|key| {
                    self.targets.contains_key(*key)
                        && !exclude.contains(key)
                        && quota.is_ready(key, now)
                })
                .collect();
            if ready.is_empty() {
                continue;
            }

            let cursor_key = format!("{route_name}:{}", tier.id);
            let cursor = self.advance_cursor(&cursor_key);
            let selected = match tier.mode {
                TierMode::Priority => select_priority(&ready, quota, now, cursor),
                TierMode::RoundRobin => ready[cursor % ready.len()],
                TierMode::Weighted => select_weighted(&ready, quota, now),
            };

            if let (Some(sticky), Some(session_id)) = (
                self.sticky.as_ref(),
                request.metadata.session_id.as_deref(),
            ) {
                sticky.bind(session_id, selected.clone());
            }

            return Ok(RouteDecision {
                route_name: route_name.to_string(),
                pool_id: tier.id.clone(),
                provider_key: selected.clone(),
                target: Arc::clone(&self.targets[selected]),
            });
        }

        let all_keys: Vec<ProviderKey> = tiers
            .iter()
            .flat_map(|tier| tier.targets.iter().cloned())
            .collect();
        Err(GatewayError::NoAvailableProvider {
            route: route_name.to_string(),
            retry_after_ms: quota.soonest_recovery_ms(&all_keys, now),
        })
    }

    /// Record a failed attempt: rotate the pool cursor so the next selection
    /// starts past the failed target. Authoritative pool-state changes
    /// arrive via the quota daemon.
    pub fn note_failure(&self, decision: &RouteDecision) {
        let cursor_key = format!("{}:{}", decision.route_name, decision.pool_id);
        self.advance_cursor(&cursor_key);
    }

    fn advance_cursor(&self, cursor_key: &str) -> usize {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(cursor_key.to_string()).or_insert(0);
        let current = *cursor;
        *cursor = cursor.wrapping_add(1);
        current
    }
}

/// Priority mode: order by (priority tier, selection penalty, rotated
/// position); ties fall back to insertion order via the stable scan.
fn select_priority<'a>(
    ready: &[&'a ProviderKey],
    quota: &QuotaView,
    now: u64,
    cursor: usize,
) -> &'a ProviderKey {
    let len = ready.len();
    let mut best: Option<(&'a ProviderKey, (u32, u32, usize))> = None;
    for (idx, key) in ready.iter().enumerate() {
        let key: &'a ProviderKey = key;
        let entry_tier = quota.entry(key).map_or(0, |e| e.priority_tier);
        let penalty = quota.selection_penalty(key, now);
        let rotated = (idx + len - (cursor % len)) % len;
        let score = (entry_tier, penalty, rotated);
        match &best {
            Some((_, best_score)) if *best_score <= score => {}
            _ => best = Some((key, score)),
        }
    }
    best.map(|(key, _)| key).unwrap_or(ready[0])
}

/// Weighted mode: weights derive from the priority tier (lower is better)
/// with the selection penalty as an additive handicap.
fn select_weighted<'a>(
    ready: &[&'a ProviderKey],
    quota: &QuotaView,
    now: u64,
) -> &'a ProviderKey {
    let weights: Vec<u64> = ready
        .iter()
        .map(|key| {
            let tier = quota.entry(key).map_or(0, |e| e.priority_tier) as u64;
            let penalty = quota.selection_penalty(key, now) as u64;
            1000 / (1 + tier + penalty)
        })
        .collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return ready[0];
    }
    let mut pick = fastrand::u64(..total);
    for (key, weight) in ready.iter().zip(&weights) {
        if pick < *weight {
            return *key;
        }
        pick -= *weight;
    }
    ready[ready.len() - 1]
}
