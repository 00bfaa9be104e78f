//! Route classification.
//!
//! Applied in order, first match wins: explicit hint metadata, inline
//! `<**…**>` directive in the last user message (route name or full
//! provider key), the long-context threshold, thinking/background keyword
//! heuristics, then `default`.

use regex_lite::Regex;

use crate::protocol::canonical::ChatRequest;
use crate::quota::ProviderKey;
use crate::util::approx_token_count;

pub const DEFAULT_ROUTE: &str = "default";
pub const LONG_CONTEXT_ROUTE: &str = "longcontext";
pub const THINKING_ROUTE: &str = "thinking";
pub const BACKGROUND_ROUTE: &str = "background";

/// Result of classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSelection {
    /// A named logical route.
    Named(String),
    /// A specific provider target forced by directive, still subject to
    /// readiness.
    Forced(ProviderKey),
}

/// Classifier tuning, from config.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub long_context_threshold_tokens: u64,
    pub thinking_keywords: Vec<String>,
    pub background_keywords: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            long_context_threshold_tokens: 180_000,
            thinking_keywords: Vec::new(),
            background_keywords: Vec::new(),
        }
    }
}

fn directive_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<\*\*([^*]+)\*\*>").expect("static pattern"))
}

/// Classify a canonical request into a route selection.
#[must_use]
pub fn classify(request: &ChatRequest, config: &ClassifierConfig) -> RouteSelection {
    if let Some(hint) = request
        .metadata
        .route_hint
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
    {
        return selection_from_directive(hint);
    }

    let last_user = request.last_user_text();
    if let Some(text) = last_user.as_deref() {
        if let Some(caps) = directive_pattern().captures(text) {
            return selection_from_directive(caps[1].trim());
        }
    }

    let tokens = approx_token_count(request.text_char_count());
    if tokens >= config.long_context_threshold_tokens {
        return RouteSelection::Named(LONG_CONTEXT_ROUTE.to_string());
    }

    if let Some(text) = last_user.as_deref() {
        let lower = text.to_ascii_lowercase();
        if matches_keyword(&lower, &config.thinking_keywords) {
            return RouteSelection::Named(THINKING_ROUTE.to_string());
        }
        if matches_keyword(&lower, &config.background_keywords) {
            return RouteSelection::Named(BACKGROUND_ROUTE.to_string());
        }
    }

    RouteSelection::Named(DEFAULT_ROUTE.to_string())
}

/// A directive with a full dotted `provider.alias.model` spelling forces a
/// target; anything else names a route.
fn selection_from_directive(directive: &str) -> RouteSelection {
    if directive.splitn(3, '.').count() == 3 {
        RouteSelection::Forced(ProviderKey::new(directive))
    } else {
        RouteSelection::Named(directive.to_string())
    }
}

fn matches_keyword(text: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && text.contains(&keyword.to_ascii_lowercase()))
}
