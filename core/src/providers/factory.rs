use crate::config::Config;
use crate::providers::{AnthropicModel, OpenAIModel};
use crate::traits::Model;
use anyhow::{Result, anyhow};
use std::sync::Arc;

pub fn create_model(config: &Config) -> Result<Arc<dyn Model>> {
    create_model_with_env(config, |name| std::env::var(name).ok())
}

/// Like [`create_model`], reading API key variables through `env`.
pub fn create_model_with_env(
    config: &Config,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn Model>> {
    let provider_name = config.provider.as_deref().unwrap_or("anthropic");

    match provider_name.to_lowercase().as_str() {
        "anthropic" | "claude" => {
            let api_key = resolve_api_key_with_fallback(
                &["ANTHROPIC_API_KEY", "API_KEY", "DATABOT_API_KEY"],
                &config.api_key,
                &env,
            )?;
            let mut model = AnthropicModel::new(api_key).with_model(config.model.clone());
            if let Some(base_url) = &config.base_url {
                model = model.with_base_url(base_url.clone());
            }
            Ok(Arc::new(model))
        }
        "openai" => {
            let api_key = resolve_api_key_with_fallback(
                &["OPENAI_API_KEY", "DATABOT_API_KEY"],
                &config.api_key,
                &env,
            )?;
            let mut model = OpenAIModel::new(api_key).with_model(config.model.clone());
            if let Some(base_url) = &config.base_url {
                model = model.with_base_url(base_url.clone());
            }
            Ok(Arc::new(model))
        }
        _ => Err(anyhow!(
            "Unknown provider: {}. Available: anthropic, openai",
            provider_name
        )),
    }
}

fn resolve_api_key_with_fallback(
    env_vars: &[&str],
    config_key: &str,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<String> {
    for var_name in env_vars {
        if let Some(key) = env(var_name)
            && !key.is_empty()
        {
            return Ok(key);
        }
    }
    if !config_key.is_empty() {
        Ok(config_key.to_string())
    } else {
        Err(anyhow!(
            "No API key found. Set {} or run 'databot onboard'.",
            env_vars.join(" / ")
        ))
    }
}
