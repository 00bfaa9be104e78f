//! Startup configuration validation. Failures here exit with code 1;
//! nothing is worth serving with a broken target table.

use crate::protocol::canonical::TargetProtocol;
use crate::providers::ProviderType;

use super::{AppConfig, ConfigError};

/// Validate the parsed configuration.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] on the first violation.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(validation("server.port must be nonzero"));
    }

    for (provider_id, provider) in &config.providers {
        if provider_id.contains('.') {
            return Err(validation(format!(
                "provider id '{provider_id}' must not contain '.'"
            )));
        }
        if provider.provider_type != ProviderType::Mock {
            url::Url::parse(&provider.base_url).map_err(|e| {
                validation(format!("provider '{provider_id}' base_url invalid: {e}"))
            })?;
        }
        if provider.models.is_empty() {
            return Err(validation(format!(
                "provider '{provider_id}' declares no models"
            )));
        }
        if provider.keys.is_empty() {
            return Err(validation(format!(
                "provider '{provider_id}' declares no keys"
            )));
        }
        for (alias, key) in &provider.keys {
            if alias.contains('.') {
                return Err(validation(format!(
                    "provider '{provider_id}' key alias '{alias}' must not contain '.'"
                )));
            }
            if key.api_key.is_some() && key.oauth_token_file.is_some() {
                return Err(validation(format!(
                    "provider '{provider_id}' key '{alias}' sets both api_key and oauth_token_file"
                )));
            }
        }
        if let Some(profile) = provider.outbound_profile.as_deref() {
            if TargetProtocol::parse(profile).is_none() {
                return Err(validation(format!(
                    "provider '{provider_id}' outbound_profile '{profile}' is unknown"
                )));
            }
        }
        // The mock provider fabricates OpenAI-shaped replies only.
        if provider.provider_type == ProviderType::Mock {
            let profile = provider
                .outbound_profile
                .as_deref()
                .and_then(TargetProtocol::parse)
                .unwrap_or(TargetProtocol::OpenAiChat);
            if profile != TargetProtocol::OpenAiChat {
                return Err(validation(format!(
                    "provider '{provider_id}' is mock and must use the openai-chat profile"
                )));
            }
        }
    }

    let targets = config.build_targets();
    if config.routes.is_empty() {
        return Err(validation("no routes configured"));
    }
    if !config.routes.contains_key("default") {
        return Err(validation("routes must include a 'default' route"));
    }
    for (route_name, tiers) in &config.routes {
        if tiers.is_empty() {
            return Err(validation(format!("route '{route_name}' has no tiers")));
        }
        for tier in tiers {
            if tier.targets.is_empty() {
                return Err(validation(format!(
                    "route '{route_name}' tier '{}' has no targets",
                    tier.id
                )));
            }
            for target in &tier.targets {
                let key = crate::quota::ProviderKey::new(target.as_str());
                if !targets.contains_key(&key) {
                    return Err(validation(format!(
                        "route '{route_name}' tier '{}' references unknown target '{target}'",
                        tier.id
                    )));
                }
            }
        }
    }

    Ok(())
}

fn validation(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn parse(yaml: &str) -> AppConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    const VALID: &str = r#"
providers:
  mockp:
    type: mock
    base_url: mock://local
    keys:
      default: {}
    models: [gpt-4]
routes:
  default:
    - id: primary-1
      targets: [mockp.default.gpt-4]
"#;

    #[test]
    fn valid_config_passes() {
        assert!(validate_config(&parse(VALID)).is_ok());
    }

    #[test]
    fn unknown_route_target_fails() {
        let yaml = VALID.replace("mockp.default.gpt-4", "missing.alias.model");
        let err = validate_config(&parse(&yaml)).unwrap_err();
        assert!(err.to_string().contains("unknown target"));
    }

    #[test]
    fn missing_default_route_fails() {
        let yaml = VALID.replace("  default:\n", "  other:\n");
        let err = validate_config(&parse(&yaml)).unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn provider_without_models_fails() {
        let yaml = VALID.replace("models: [gpt-4]", "models: []");
        assert!(validate_config(&parse(&yaml)).is_err());
    }

    #[test]
    fn dotted_provider_id_fails() {
        let yaml = VALID.replace("  mockp:", "  \"mock.p\":");
        let result = validate_config(&parse(&yaml));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_base_url_fails_for_real_providers() {
        let yaml = r#"
providers:
  openai:
    type: openai
    base_url: "not a url"
    keys:
      default:
        api_key: k
    models: [gpt-4]
routes:
  default:
    - id: primary-1
      targets: [openai.default.gpt-4]
"#;
        assert!(validate_config(&parse(yaml)).is_err());
    }
}
