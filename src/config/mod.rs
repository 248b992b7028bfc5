//! Instance configuration and the pure builders derived from it
//!
//! [`InstanceConfig`] is the immutable value object a caller hands to
//! `provision`. Two pure functions turn it into backend-ready material:
//!
//! - [`build_config_document`] renders the JSON document the agent runtime
//!   reads. It is allocated fresh on every call and never contains a secret.
//! - [`build_secret_map`] collects the sensitive environment entries. Only
//!   non-empty credentials are emitted, and a routed gateway credential
//!   suppresses the per-provider ones.
//!
//! Optionality is explicit throughout: an absent field means "inherit the
//! shared default", never "disabled". The builders must not emit a
//! disabled-but-present stanza that could be mistaken for an explicit off.

mod document;
mod secrets;

pub use document::{build_config_document, DOCUMENT_SCHEMA_VERSION};
pub use secrets::{
    build_secret_map, channel_token_env, provider_env_key, SecretMap, GATEWAY_TOKEN_ENV,
    ROUTED_PROVIDER, ROUTED_PROVIDER_ENV,
};

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::{Error, Result};

/// Declarative configuration for one agent instance.
///
/// Credential-bearing fields are redacted from `Debug` output; the struct is
/// safe to log as-is.
#[derive(Clone, PartialEq, Deserialize)]
pub struct InstanceConfig {
    /// Token the agent gateway requires from callers. Travels only through
    /// the secret map, never through the config document.
    pub gateway_token: String,

    /// Primary model override. Absent means the runtime default.
    #[serde(default)]
    pub model: Option<String>,

    /// Provider credential map, provider name to secret. An absent entry
    /// inherits the shared platform credential.
    #[serde(default)]
    pub providers: BTreeMap<String, String>,

    /// Messaging-channel bindings, channel name to binding.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelBinding>,

    /// Free-form system instructions mounted next to the config document.
    #[serde(default)]
    pub instructions: Option<String>,

    /// Resource sizing hints.
    #[serde(default)]
    pub sizing: Sizing,
}

impl InstanceConfig {
    /// Minimal valid config carrying only the required gateway token.
    pub fn new(gateway_token: impl Into<String>) -> Self {
        Self {
            gateway_token: gateway_token.into(),
            model: None,
            providers: BTreeMap::new(),
            channels: BTreeMap::new(),
            instructions: None,
            sizing: Sizing::default(),
        }
    }

    /// Validate the parts of the config the builders rely on.
    ///
    /// The gateway token must be non-empty (it is the instance's only
    /// authentication), and channel names must be lowercase alphanumerics
    /// because they are uppercased into environment variable names.
    pub fn validate(&self) -> Result<()> {
        if self.gateway_token.is_empty() {
            return Err(Error::validation("gateway token must not be empty"));
        }
        for name in self.channels.keys() {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return Err(Error::validation(format!(
                    "channel name '{name}' must be lowercase alphanumeric"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("gateway_token", &"<redacted>")
            .field("model", &self.model)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("channels", &self.channels)
            .field("instructions", &self.instructions.as_deref().map(str::len))
            .field("sizing", &self.sizing)
            .finish()
    }
}

/// Binding of one messaging channel to this instance.
#[derive(Clone, PartialEq, Deserialize)]
pub struct ChannelBinding {
    /// Channel auth token, where the channel uses one. Travels through the
    /// secret map as `{CHANNEL}_BOT_TOKEN`.
    #[serde(default)]
    pub token: Option<String>,

    /// Identities allowed to message the agent. `None` means the channel is
    /// open (`["*"]`); an explicitly empty list locks the channel down.
    #[serde(default)]
    pub allow_from: Option<Vec<String>>,
}

impl fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBinding")
            .field("token", &self.token.as_deref().map(|_| "<redacted>"))
            .field("allow_from", &self.allow_from)
            .finish()
    }
}

/// Resource sizing hints for the compute workload and its workspace.
///
/// The cluster backend derives requests as a quarter of the limits; the
/// host-pool backend translates limits into Docker cgroup settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Sizing {
    /// CPU limit in millicores
    #[serde(default = "default_cpu_limit_millis")]
    pub cpu_limit_millis: u32,
    /// Memory limit in mebibytes
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Persistent workspace size in gibibytes
    #[serde(default = "default_storage_gb")]
    pub storage_gb: u32,
}

impl Default for Sizing {
    fn default() -> Self {
        Self {
            cpu_limit_millis: default_cpu_limit_millis(),
            memory_limit_mb: default_memory_limit_mb(),
            storage_gb: default_storage_gb(),
        }
    }
}

fn default_cpu_limit_millis() -> u32 {
    1000
}

fn default_memory_limit_mb() -> u64 {
    2048
}

fn default_storage_gb() -> u32 {
    2
}
