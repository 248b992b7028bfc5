//! Canonical resource names and label sets for tenant instances
//!
//! Every bundle member an instance owns (workload, config, secret, storage,
//! endpoint, policy) carries the same canonical name and the same label set,
//! on both backends. That derivation is a stable contract: resources created
//! by one code path must remain discoverable and removable by every other, so
//! nothing here may depend on randomness, clocks, or process state.
//!
//! Identities are deliberately restricted to lowercase alphanumerics. With
//! hyphens banned from the ids themselves, `agent-{tenant}-{instance}` is
//! injective: no two distinct identity pairs can collide after joining.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{Error, Result};

/// Label key carrying the product marker
pub const LABEL_APP: &str = "app";
/// Label key carrying the component marker
pub const LABEL_COMPONENT: &str = "component";
/// Label key carrying the owning tenant id
pub const LABEL_TENANT: &str = "tenant-id";
/// Label key carrying the instance id
pub const LABEL_INSTANCE: &str = "instance-id";

/// Value of the [`LABEL_APP`] label on every managed resource
pub const APP_NAME: &str = "perch";
/// Value of the [`LABEL_COMPONENT`] label on agent bundle members
pub const COMPONENT_AGENT: &str = "agent";

/// Prefix of every canonical resource name
const NAME_PREFIX: &str = "agent";

/// Maximum length of a tenant or instance id.
///
/// 28 + 28 plus the prefix and separators lands exactly on the 63-character
/// DNS label limit, the tightest naming rule either backend imposes.
pub const MAX_ID_LEN: usize = 28;

/// A validated tenant instance identity with its derived canonical name.
///
/// Constructed only through [`InstanceIdentity::resolve`], so holding one
/// proves both ids passed validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceIdentity {
    tenant_id: String,
    instance_id: String,
    name: String,
}

impl InstanceIdentity {
    /// Validate an identity pair and derive the canonical resource name.
    ///
    /// Fails with [`Error::InvalidIdentity`] if either id is empty, longer
    /// than [`MAX_ID_LEN`], or contains anything outside `[a-z0-9]`.
    pub fn resolve(tenant_id: &str, instance_id: &str) -> Result<Self> {
        validate_id("tenant id", tenant_id)?;
        validate_id("instance id", instance_id)?;
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            instance_id: instance_id.to_string(),
            name: format!("{NAME_PREFIX}-{tenant_id}-{instance_id}"),
        })
    }

    /// The owning tenant id
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The instance id within the tenant
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Canonical name shared by every bundle member of this instance
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full label set stamped on every bundle member
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), APP_NAME.to_string()),
            (LABEL_COMPONENT.to_string(), COMPONENT_AGENT.to_string()),
            (LABEL_TENANT.to_string(), self.tenant_id.clone()),
            (LABEL_INSTANCE.to_string(), self.instance_id.clone()),
        ])
    }

    /// Label selector matching exactly this instance's resources
    pub fn selector(&self) -> String {
        format!(
            "{LABEL_TENANT}={},{LABEL_INSTANCE}={}",
            self.tenant_id, self.instance_id
        )
    }
}

/// Validate a bare tenant id, for tenant-scoped operations that take no
/// instance id.
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    validate_id("tenant id", tenant_id)
}

/// Label selector matching every agent resource belonging to one tenant
pub fn tenant_selector(tenant_id: &str) -> String {
    format!("{LABEL_APP}={APP_NAME},{LABEL_COMPONENT}={COMPONENT_AGENT},{LABEL_TENANT}={tenant_id}")
}

/// Label selector matching every agent resource this orchestrator manages
pub fn app_selector() -> String {
    format!("{LABEL_APP}={APP_NAME},{LABEL_COMPONENT}={COMPONENT_AGENT}")
}

/// Name of the shared per-tenant container network on the host-pool backend.
///
/// Tenant-scoped, not instance-scoped: it outlives individual instances and
/// is only removed by a full tenant deprovision.
pub fn tenant_network_name(tenant_id: &str) -> String {
    format!("{APP_NAME}-net-{tenant_id}")
}

fn validate_id(what: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_identity(format!("{what} must not be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::invalid_identity(format!(
            "{what} '{id}' exceeds {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(Error::invalid_identity(format!(
            "{what} '{id}' contains characters outside [a-z0-9]"
        )));
    }
    Ok(())
}
