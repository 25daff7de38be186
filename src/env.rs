//! Mapping from the external configuration record to the gateway's environment
//!
//! The gateway process expects its own variable names. Operators configure the
//! service with generic names (e.g. `MOLTBOT_GATEWAY_TOKEN`), and this module
//! renames and merges them. Everything here is pure: same input, same output.

use std::collections::BTreeMap;
use thiserror::Error;

/// External configuration record: process environment merged with the `[env]` table
pub type ExternalConfig = BTreeMap<String, String>;

/// Variables handed to the gateway process
pub type BackendEnv = BTreeMap<String, String>;

/// Required configuration was not supplied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing configuration: {}", .missing.join(", "))]
pub struct MissingConfiguration {
    /// Every key (or key group, `A|B`) that is absent
    pub missing: Vec<String>,
}

/// AI provider selected for the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Requests routed through an AI gateway that fronts the Anthropic API
    GatewayAnthropic,
    /// Requests routed through an AI gateway that fronts the OpenAI API
    GatewayOpenAi,
    Anthropic,
    OpenAi,
}

/// Precedence order for provider credentials. The first source present wins.
const PROVIDER_SOURCES: &[&str] = &["AI_GATEWAY_API_KEY", "ANTHROPIC_API_KEY", "OPENAI_API_KEY"];

/// Variables passed through under the same name when set
const PASSTHROUGH: &[&str] = &[
    "TELEGRAM_BOT_TOKEN",
    "TELEGRAM_DM_POLICY",
    "DISCORD_BOT_TOKEN",
    "DISCORD_DM_POLICY",
    "SLACK_BOT_TOKEN",
    "SLACK_APP_TOKEN",
    "CDP_SECRET",
    "WORKER_URL",
];

/// Renamed variables: (external name, gateway name)
const RENAMES: &[(&str, &str)] = &[
    ("MOLTBOT_GATEWAY_TOKEN", "CLAWDBOT_GATEWAY_TOKEN"),
    ("DEV_MODE", "CLAWDBOT_DEV_MODE"),
    ("CLAWDBOT_BIND_MODE", "CLAWDBOT_BIND_MODE"),
];

fn lookup<'a>(config: &'a ExternalConfig, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Pick the provider from the first matching credential source
pub fn select_provider(config: &ExternalConfig) -> Result<Provider, MissingConfiguration> {
    for source in PROVIDER_SOURCES {
        if lookup(config, source).is_none() {
            continue;
        }
        return match *source {
            "AI_GATEWAY_API_KEY" => match lookup(config, "AI_GATEWAY_BASE_URL") {
                Some(url) if url.trim_end_matches('/').ends_with("/openai") => {
                    Ok(Provider::GatewayOpenAi)
                }
                Some(_) => Ok(Provider::GatewayAnthropic),
                None => Err(MissingConfiguration {
                    missing: vec!["AI_GATEWAY_BASE_URL".to_string()],
                }),
            },
            "ANTHROPIC_API_KEY" => Ok(Provider::Anthropic),
            _ => Ok(Provider::OpenAi),
        };
    }

    Err(MissingConfiguration {
        missing: vec![PROVIDER_SOURCES.join("|")],
    })
}

/// Build the gateway's variable set.
///
/// `require_token` is false only in dev mode, where the gateway runs without
/// its token check.
pub fn build_backend_env(
    config: &ExternalConfig,
    require_token: bool,
) -> Result<BackendEnv, MissingConfiguration> {
    let mut missing = Vec::new();
    let mut env = BackendEnv::new();

    match select_provider(config) {
        Ok(provider) => apply_provider(config, provider, &mut env),
        Err(e) => missing.extend(e.missing),
    }

    if require_token && lookup(config, "MOLTBOT_GATEWAY_TOKEN").is_none() {
        missing.push("MOLTBOT_GATEWAY_TOKEN".to_string());
    }

    if !missing.is_empty() {
        return Err(MissingConfiguration { missing });
    }

    for (from, to) in RENAMES {
        if let Some(value) = lookup(config, from) {
            env.insert((*to).to_string(), value.to_string());
        }
    }

    for key in PASSTHROUGH {
        if let Some(value) = lookup(config, key) {
            env.insert((*key).to_string(), value.to_string());
        }
    }

    Ok(env)
}

fn apply_provider(config: &ExternalConfig, provider: Provider, env: &mut BackendEnv) {
    let base_url = lookup(config, "AI_GATEWAY_BASE_URL").map(|u| u.trim_end_matches('/').to_string());

    match provider {
        Provider::GatewayAnthropic | Provider::GatewayOpenAi => {
            let key = lookup(config, "AI_GATEWAY_API_KEY").unwrap_or_default().to_string();
            let url = base_url.unwrap_or_default();
            if provider == Provider::GatewayOpenAi {
                env.insert("OPENAI_API_KEY".to_string(), key);
                env.insert("OPENAI_BASE_URL".to_string(), url);
            } else {
                env.insert("ANTHROPIC_API_KEY".to_string(), key);
                env.insert("ANTHROPIC_BASE_URL".to_string(), url);
            }
        }
        Provider::Anthropic => {
            if let Some(key) = lookup(config, "ANTHROPIC_API_KEY") {
                env.insert("ANTHROPIC_API_KEY".to_string(), key.to_string());
            }
            if let Some(url) = lookup(config, "ANTHROPIC_BASE_URL") {
                env.insert("ANTHROPIC_BASE_URL".to_string(), url.to_string());
            }
        }
        Provider::OpenAi => {
            if let Some(key) = lookup(config, "OPENAI_API_KEY") {
                env.insert("OPENAI_API_KEY".to_string(), key.to_string());
            }
        }
    }
}
