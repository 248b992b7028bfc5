//! Config document rendering
//!
//! The config document is the non-sensitive half of an instance's material.
//! It is mounted into the agent container as `agent.json` and read by the
//! runtime on boot. Credentials never appear here; they travel through the
//! secret map and reach the runtime as environment variables.

use serde_json::{json, Value};

use crate::config::InstanceConfig;
use crate::naming::APP_NAME;
use crate::{DEFAULT_CONTEXT_WINDOW, DEFAULT_GATEWAY_PORT};

/// Schema marker written into `meta.schema` so the runtime can detect
/// documents produced by an incompatible control plane.
pub const DOCUMENT_SCHEMA_VERSION: u32 = 1;

/// Render the JSON config document for one instance.
///
/// Builds a fresh document on every call; nothing is shared or mutated
/// between instances. Optional stanzas are omitted entirely when unset so
/// the runtime falls back to its own defaults, never handed an explicit
/// "off".
pub fn build_config_document(config: &InstanceConfig) -> Value {
    let mut agent = json!({
        "contextWindow": DEFAULT_CONTEXT_WINDOW,
        "thinking": "low",
        "memoryFlush": true,
    });
    if let Some(model) = &config.model {
        agent["model"] = json!({ "primary": model });
    }

    let mut doc = json!({
        "meta": {
            "schema": DOCUMENT_SCHEMA_VERSION,
            "generatedBy": APP_NAME,
        },
        "agent": agent,
        "gateway": {
            "mode": "local",
            "port": DEFAULT_GATEWAY_PORT,
            "auth": { "mode": "token" },
        },
        "tools": {
            "profile": "full",
            "webSearch": true,
            "webFetch": true,
            "imageInput": true,
        },
    });

    if !config.channels.is_empty() {
        let mut channels = serde_json::Map::new();
        let mut plugins = Vec::new();
        for (name, binding) in &config.channels {
            // None means open; an explicitly empty list stays empty
            let allow_from = binding
                .allow_from
                .clone()
                .unwrap_or_else(|| vec!["*".to_string()]);
            channels.insert(
                name.clone(),
                json!({
                    "allowFrom": allow_from,
                    "dmPolicy": "allowlist",
                }),
            );
            plugins.push(Value::String(name.clone()));
        }
        doc["channels"] = Value::Object(channels);
        doc["plugins"] = Value::Array(plugins);
    }

    doc
}
