pub mod validation;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::protocol::canonical::TargetProtocol;
use crate::providers::auth::AuthSpec;
use crate::providers::{ProviderType, Target};
use crate::quota::ProviderKey;
use crate::router::classify::ClassifierConfig;
use crate::router::{RouteTier, TierMode};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-attempt unary deadline, seconds.
    pub unary_timeout_secs: u64,
    /// Streaming idle deadline, seconds.
    pub stream_idle_timeout_secs: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5506,
            unary_timeout_secs: 120,
            stream_idle_timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

/// One credential under a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderKeyConfig {
    pub api_key: Option<String>,
    pub oauth_token_file: Option<PathBuf>,
    /// Antigravity Cloud project override; otherwise read from the token
    /// file.
    pub project: Option<String>,
}

/// One upstream provider and its credential aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub base_url: String,
    /// Alias -> credential. BTreeMap keeps bootstrap order deterministic.
    #[serde(default)]
    pub keys: BTreeMap<String, ProviderKeyConfig>,
    #[serde(default)]
    pub models: Vec<String>,
    /// Wire-protocol override; defaults per provider type.
    #[serde(default)]
    pub outbound_profile: Option<String>,
    #[serde(default)]
    pub compatibility_profile: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

/// One tier inside a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTierConfig {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub mode: TierMode,
    pub targets: Vec<String>,
}

/// Router heuristics tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub long_context_threshold_tokens: u64,
    pub thinking_keywords: Vec<String>,
    pub background_keywords: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            long_context_threshold_tokens: 180_000,
            thinking_keywords: Vec::new(),
            background_keywords: Vec::new(),
        }
    }
}

/// Client authentication section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientAuthConfig {
    pub allowed_keys: Vec<String>,
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub routes: BTreeMap<String, Vec<RouteTierConfig>>,
    pub routing: RoutingConfig,
    pub client_authentication: ClientAuthConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: BTreeMap::new(),
            routes: BTreeMap::new(),
            routing: RoutingConfig::default(),
            client_authentication: ClientAuthConfig::default(),
        }
    }
}

/// Load and validate configuration from a YAML file.
///
/// # Errors
///
/// Returns [`ConfigError`] on I/O, parse, or validation failures.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

impl AppConfig {
    /// Build the target runtime table: one [`Target`] per
    /// provider × alias × model. Built once at bootstrap and reused.
    #[must_use]
    pub fn build_targets(&self) -> FxHashMap<ProviderKey, Arc<Target>> {
        let mut targets = FxHashMap::default();
        for (provider_id, provider) in &self.providers {
            let profile = provider
                .outbound_profile
                .as_deref()
                .and_then(TargetProtocol::parse)
                .unwrap_or_else(|| provider.provider_type.default_outbound_profile());
            for (alias, key_config) in &provider.keys {
                let auth = key_config.auth_spec(provider.provider_type);
                for model in &provider.models {
                    let provider_key =
                        ProviderKey::new(format!("{provider_id}.{alias}.{model}"));
                    targets.insert(
                        provider_key.clone(),
                        Arc::new(Target {
                            provider_key,
                            provider_type: provider.provider_type,
                            outbound_profile: profile,
                            compatibility_profile: provider.compatibility_profile.clone(),
                            runtime_key: format!("{provider_id}.{alias}"),
                            endpoint: provider.base_url.clone(),
                            auth: auth.clone(),
                            default_model: model.clone(),
                            proxy: provider.proxy.clone(),
                        }),
                    );
                }
            }
        }
        targets
    }

    /// Build the route table for the router.
    #[must_use]
    pub fn build_routes(&self) -> FxHashMap<String, Vec<RouteTier>> {
        self.routes
            .iter()
            .map(|(name, tiers)| {
                let tiers = tiers
                    .iter()
                    .map(|tier| RouteTier {
                        id: tier.id.clone(),
                        priority: tier.priority,
                        backup: tier.backup,
                        mode: tier.mode,
                        targets: tier.targets.iter().map(ProviderKey::new).collect(),
                    })
                    .collect();
                (name.clone(), tiers)
            })
            .collect()
    }

    #[must_use]
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            long_context_threshold_tokens: self.routing.long_context_threshold_tokens,
            thinking_keywords: self.routing.thinking_keywords.clone(),
            background_keywords: self.routing.background_keywords.clone(),
        }
    }
}

impl ProviderKeyConfig {
    #[must_use]
    pub fn auth_spec(&self, provider_type: ProviderType) -> AuthSpec {
        if let Some(path) = &self.oauth_token_file {
            if provider_type == ProviderType::Antigravity {
                return AuthSpec::AntigravityOAuth {
                    path: path.clone(),
                    project: self.project.clone(),
                };
            }
            return AuthSpec::OAuthTokenFile { path: path.clone() };
        }
        match &self.api_key {
            Some(key) => AuthSpec::ApiKey(key.clone()),
            None => AuthSpec::None,
        }
    }
}
