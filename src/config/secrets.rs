//! Secret map construction
//!
//! Everything sensitive about an instance is collected into a [`SecretMap`]
//! of environment entries. The cluster backend stores it as a Kubernetes
//! Secret wired into the pod via `envFrom`; the host-pool backend passes it
//! as container environment at create time. Either way the values never
//! touch the config document or a log line.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::config::InstanceConfig;

/// Environment variable carrying the gateway auth token
pub const GATEWAY_TOKEN_ENV: &str = "GATEWAY_TOKEN";

/// Provider name that routes all model traffic through the platform gateway
pub const ROUTED_PROVIDER: &str = "ai-gateway";

/// Environment variable carrying the routed gateway credential
pub const ROUTED_PROVIDER_ENV: &str = "AI_GATEWAY_API_KEY";

/// Known model providers and the environment variable each credential maps
/// to. `google` and `gemini` are aliases for the same runtime key.
const PROVIDERS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("google", "GEMINI_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("xai", "XAI_API_KEY"),
];

/// Environment variable a provider credential maps to, if the provider is
/// known.
pub fn provider_env_key(provider: &str) -> Option<&'static str> {
    if provider == ROUTED_PROVIDER {
        return Some(ROUTED_PROVIDER_ENV);
    }
    PROVIDERS
        .iter()
        .find(|(name, _)| *name == provider)
        .map(|(_, env)| *env)
}

/// Environment variable a channel's bot token maps to.
pub fn channel_token_env(channel: &str) -> String {
    format!("{}_BOT_TOKEN", channel.to_ascii_uppercase())
}

/// Sensitive environment entries for one instance.
///
/// Values are redacted from `Debug` output; only the keys print.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SecretMap(BTreeMap<String, String>);

impl SecretMap {
    /// Entry count
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map carries no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up one entry's value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Borrow the underlying key-to-value map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Consume the map, yielding the underlying entries
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl fmt::Debug for SecretMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for key in self.0.keys() {
            map.entry(key, &"<redacted>");
        }
        map.finish()
    }
}

/// Collect the secret environment entries for one instance.
///
/// Only non-empty credentials are emitted. A non-empty `ai-gateway`
/// credential means model traffic is routed through the platform gateway,
/// and every per-provider credential is suppressed in its favor. Unknown
/// provider names are skipped with a warning rather than failing the
/// provision.
pub fn build_secret_map(config: &InstanceConfig) -> SecretMap {
    let mut map = BTreeMap::new();

    if !config.gateway_token.is_empty() {
        map.insert(GATEWAY_TOKEN_ENV.to_string(), config.gateway_token.clone());
    }

    let routed = config
        .providers
        .get(ROUTED_PROVIDER)
        .filter(|credential| !credential.is_empty());

    if let Some(credential) = routed {
        map.insert(ROUTED_PROVIDER_ENV.to_string(), credential.clone());
        let suppressed = config
            .providers
            .keys()
            .filter(|name| name.as_str() != ROUTED_PROVIDER)
            .count();
        if suppressed > 0 {
            debug!(
                suppressed,
                "routed gateway credential set, suppressing per-provider credentials"
            );
        }
    } else {
        for (provider, credential) in &config.providers {
            if credential.is_empty() {
                continue;
            }
            match provider_env_key(provider) {
                Some(env_key) => {
                    map.insert(env_key.to_string(), credential.clone());
                }
                None => {
                    warn!(provider = %provider, "unknown provider, skipping credential");
                }
            }
        }
    }

    for (channel, binding) in &config.channels {
        if let Some(token) = binding.token.as_deref().filter(|t| !t.is_empty()) {
            map.insert(channel_token_env(channel), token.to_string());
        }
    }

    SecretMap(map)
}
