//! Authentication injection for provider requests.
//!
//! Three shapes: a static API key, an OAuth bearer read from a token file
//! at send time (the token daemon refreshing that file is external), and
//! the Antigravity project-scoped variant that also resolves a Cloud
//! project id. Token files are JSON with an `access_token` field.

use std::path::{Path, PathBuf};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::GatewayError;

use super::ProviderType;

/// Auth material reference from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSpec {
    None,
    ApiKey(String),
    OAuthTokenFile { path: PathBuf },
    AntigravityOAuth { path: PathBuf, project: Option<String> },
}

impl AuthSpec {
    /// Whether this target authenticates via OAuth, for quota bookkeeping.
    #[must_use]
    pub fn is_oauth(&self) -> bool {
        matches!(
            self,
            AuthSpec::OAuthTokenFile { .. } | AuthSpec::AntigravityOAuth { .. }
        )
    }
}

/// Resolved auth context for one send: headers plus the Antigravity project
/// id when applicable.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub headers: HeaderMap,
    pub project: Option<String>,
}

/// Resolve auth material into request headers.
///
/// Token files are re-read on every send so externally refreshed tokens are
/// picked up without a restart.
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamAuth`] when a token file is missing or
/// unreadable.
pub fn resolve_auth(
    auth: &AuthSpec,
    provider_type: ProviderType,
) -> Result<ResolvedAuth, GatewayError> {
    let mut headers = HeaderMap::new();

    match auth {
        AuthSpec::None => {}
        AuthSpec::ApiKey(key) => {
            insert_key_header(&mut headers, provider_type, key)?;
        }
        AuthSpec::OAuthTokenFile { path } => {
            let token = read_access_token(path)?;
            insert_bearer(&mut headers, &token)?;
        }
        AuthSpec::AntigravityOAuth { path, project } => {
            let contents = read_token_file(path)?;
            let token = access_token_from(&contents, path)?;
            insert_bearer(&mut headers, &token)?;
            let project = project.clone().or_else(|| {
                contents
                    .get("project")
                    .or_else(|| contents.get("project_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
            if provider_type == ProviderType::Anthropic {
                insert_anthropic_version(&mut headers);
            }
            return Ok(ResolvedAuth { headers, project });
        }
    }

    if provider_type == ProviderType::Anthropic {
        insert_anthropic_version(&mut headers);
    }
    Ok(ResolvedAuth {
        headers,
        project: None,
    })
}

fn insert_key_header(
    headers: &mut HeaderMap,
    provider_type: ProviderType,
    key: &str,
) -> Result<(), GatewayError> {
    match provider_type {
        ProviderType::Anthropic => {
            headers.insert(
                HeaderName::from_static("x-api-key"),
                header_value(key)?,
            );
        }
        ProviderType::Gemini | ProviderType::Antigravity => {
            headers.insert(
                HeaderName::from_static("x-goog-api-key"),
                header_value(key)?,
            );
        }
        _ => {
            headers.insert(
                http::header::AUTHORIZATION,
                header_value(&format!("Bearer {key}"))?,
            );
        }
    }
    Ok(())
}

fn insert_bearer(headers: &mut HeaderMap, token: &str) -> Result<(), GatewayError> {
    headers.insert(
        http::header::AUTHORIZATION,
        header_value(&format!("Bearer {token}"))?,
    );
    Ok(())
}

fn insert_anthropic_version(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("anthropic-version"),
        HeaderValue::from_static("2023-06-01"),
    );
}

fn header_value(raw: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(raw)
        .map_err(|_| GatewayError::Auth("auth material contains invalid header bytes".to_string()))
}

fn read_token_file(path: &Path) -> Result<Value, GatewayError> {
    let raw = std::fs::read(path).map_err(|err| GatewayError::UpstreamAuth {
        status: 401,
        message: format!("token file {} unreadable: {err}", path.display()),
    })?;
    serde_json::from_slice(&raw).map_err(|err| GatewayError::UpstreamAuth {
        status: 401,
        message: format!("token file {} is not valid JSON: {err}", path.display()),
    })
}

fn access_token_from(contents: &Value, path: &Path) -> Result<String, GatewayError> {
    contents
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::UpstreamAuth {
            status: 401,
            message: format!("token file {} has no access_token", path.display()),
        })
}

fn read_access_token(path: &Path) -> Result<String, GatewayError> {
    let contents = read_token_file(path)?;
    access_token_from(&contents, path)
}
