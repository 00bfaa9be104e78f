//! Client-side authentication: the `x-api-key` allow-list.

use http::header::{HeaderName, AUTHORIZATION};
use rustc_hash::FxHashSet;

use crate::error::GatewayError;
use crate::protocol::canonical::EntryProtocol;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Compact key index used in hot-path authentication.
pub enum AllowedClientKeys {
    /// No keys configured: authentication is disabled (local use).
    Open,
    Single(Box<str>),
    Multiple(FxHashSet<String>),
}

impl AllowedClientKeys {
    #[must_use]
    pub fn from_keys(keys: &[String]) -> Self {
        let filtered: Vec<&String> = keys.iter().filter(|k| !k.is_empty()).collect();
        match filtered.as_slice() {
            [] => AllowedClientKeys::Open,
            [single] => AllowedClientKeys::Single(single.as_str().into()),
            many => AllowedClientKeys::Multiple(
                many.iter().map(|k| (*k).clone()).collect(),
            ),
        }
    }

    #[must_use]
    fn contains(&self, key: &str) -> bool {
        match self {
            AllowedClientKeys::Open => true,
            AllowedClientKeys::Single(single) => single.as_ref() == key,
            AllowedClientKeys::Multiple(keys) => keys.contains(key),
        }
    }
}

/// Extract the client API key from request headers.
///
/// `x-api-key` is honored on every endpoint; the OpenAI-style
/// `Authorization: Bearer` spelling is accepted as a fallback on the
/// OpenAI-shaped endpoints.
#[must_use]
pub fn extract_api_key(entry: EntryProtocol, headers: &http::HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(X_API_KEY).and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    match entry {
        EntryProtocol::OpenAiChat | EntryProtocol::OpenAiResponses => headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer ")),
        EntryProtocol::AnthropicMessages => None,
    }
}

/// Authenticate a request against the allow-list.
///
/// # Errors
///
/// Returns [`GatewayError::Auth`] for a missing or unknown key.
pub fn authenticate<'a>(
    allowed: &AllowedClientKeys,
    entry: EntryProtocol,
    headers: &'a http::HeaderMap,
) -> Result<Option<&'a str>, GatewayError> {
    let key = extract_api_key(entry, headers);
    if matches!(allowed, AllowedClientKeys::Open) {
        return Ok(key);
    }
    let key = key.ok_or_else(|| GatewayError::Auth("missing API key".to_string()))?;
    if allowed.contains(key) {
        Ok(Some(key))
    } else {
        Err(GatewayError::Auth("invalid API key".to_string()))
    }
}
