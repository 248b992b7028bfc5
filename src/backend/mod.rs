//! Backend abstraction over the two provisioning substrates
//!
//! A [`Backend`] owns every substrate-specific detail of one bundle kind:
//! how it is created, replaced, removed, and observed. The client layer
//! sequences these calls and never touches a Kubernetes or Docker API
//! directly, so the orchestration logic is written once and exercised
//! against mocks.
//!
//! Two implementations exist:
//!
//! - [`ClusterBackend`]: one Kubernetes namespace, bundles are API objects
//!   (ConfigMap, Secret, PVC, Deployment, Service, CiliumNetworkPolicy)
//! - [`HostPoolBackend`]: a static pool of Docker hosts, bundles are
//!   host directories, containers, and per-tenant bridge networks
//!
//! The backend is selected once from settings at composition time via
//! [`create_backend`]; nothing downstream branches on the substrate again.

pub mod cluster;
pub mod hostpool;

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::config::{SecretMap, Sizing};
use crate::naming::InstanceIdentity;
use crate::settings::{BackendSettings, Settings};
use crate::status::RuntimeUnit;
use crate::Result;

pub use cluster::ClusterBackend;
pub use hostpool::HostPoolBackend;

/// The resource kinds making up one instance bundle.
///
/// Every bundle is applied in [`APPLY_ORDER`] and torn down in
/// [`REMOVE_ORDER`]; partial-failure errors name these kinds so operators
/// can read off exactly which parts of a bundle are live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Non-sensitive config material (document + instructions)
    Config,
    /// Sensitive environment entries
    Secret,
    /// Persistent workspace
    Storage,
    /// The compute unit running the agent
    Workload,
    /// Stable in-platform address for the agent gateway
    Endpoint,
    /// Tenant isolation rules
    Policy,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Config => "config",
            ResourceKind::Secret => "secret",
            ResourceKind::Storage => "storage",
            ResourceKind::Workload => "workload",
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::Policy => "policy",
        };
        f.write_str(s)
    }
}

/// Apply order for a bundle. Dependencies first: the workload consumes
/// config, secret, and storage, so those exist before it starts; endpoint
/// and policy attach to a workload that exists.
pub const APPLY_ORDER: [ResourceKind; 6] = [
    ResourceKind::Config,
    ResourceKind::Secret,
    ResourceKind::Storage,
    ResourceKind::Workload,
    ResourceKind::Endpoint,
    ResourceKind::Policy,
];

/// Teardown order for a single instance, the exact reverse of
/// [`APPLY_ORDER`]. Bulk teardown by label does not use this; collection
/// deletes are unordered.
pub const REMOVE_ORDER: [ResourceKind; 6] = [
    ResourceKind::Policy,
    ResourceKind::Endpoint,
    ResourceKind::Workload,
    ResourceKind::Storage,
    ResourceKind::Secret,
    ResourceKind::Config,
];

/// Substrate-independent inputs for the compute workload.
///
/// The container image and substrate topology live in operator settings
/// held by the backend; this carries only the per-instance parts.
#[derive(Clone, Debug)]
pub struct WorkloadSpec {
    /// Secret environment entries the agent process receives
    pub env: SecretMap,
    /// Resource limits
    pub sizing: Sizing,
    /// Whether an instructions file was written alongside the config
    /// document and must be mounted too
    pub mount_instructions: bool,
}

/// Where a workload landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Pool worker name; `None` on the cluster backend, where the
    /// scheduler decides
    pub worker: Option<String>,
}

/// One managed instance found by a listing call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Owning tenant, read back from bundle labels
    pub tenant_id: String,
    /// Instance within the tenant
    pub instance_id: String,
    /// Canonical bundle name
    pub name: String,
    /// Pool worker hosting the workload, host-pool only
    pub worker: Option<String>,
}

/// Substrate operations for one bundle.
///
/// Contract shared by all implementations:
///
/// - `apply_*` is create-or-replace and therefore idempotent, with one
///   exception: storage is create-if-absent. An existing workspace is
///   never replaced or resized, whatever the new sizing says; the backend
///   logs a warning and keeps it.
/// - `remove_*` is delete-if-exists: removing something absent is `Ok`.
/// - Observation calls never mutate.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Resolve where the instance's bundle will live, before any apply
    /// call.
    ///
    /// On the cluster the scheduler owns placement: this returns
    /// `Placement { worker: None }` and a pin only draws a warning. On
    /// the host pool it settles the worker the whole bundle lands on
    /// (config files included), preferring the worker already hosting
    /// the instance's container, then an explicit pin, then the
    /// least-loaded reachable worker. Naming a worker outside the pool
    /// is an error, not a fallback.
    async fn resolve_placement<'a>(
        &self,
        identity: &InstanceIdentity,
        pinned: Option<&'a str>,
    ) -> Result<Placement>;

    /// Apply the config bundle: the rendered document plus the optional
    /// instructions file.
    async fn apply_config<'a>(
        &self,
        identity: &InstanceIdentity,
        document: &Value,
        instructions: Option<&'a str>,
    ) -> Result<()>;

    /// Apply the secret bundle.
    ///
    /// On the host pool this records nothing: Docker has no secret object
    /// and the entries travel in [`WorkloadSpec::env`] at container create.
    async fn apply_secret(&self, identity: &InstanceIdentity, secrets: &SecretMap) -> Result<()>;

    /// Ensure the persistent workspace exists. Never replaces or resizes
    /// an existing one.
    async fn apply_storage(&self, identity: &InstanceIdentity, sizing: &Sizing) -> Result<()>;

    /// Apply the compute workload and report where it landed.
    async fn apply_workload(
        &self,
        identity: &InstanceIdentity,
        spec: &WorkloadSpec,
    ) -> Result<Placement>;

    /// Apply the stable endpoint for the agent gateway.
    ///
    /// A no-op on the host pool, where the port is published at container
    /// create.
    async fn apply_endpoint(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Apply the tenant isolation policy.
    async fn apply_policy(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Remove the config bundle if present.
    async fn remove_config(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Remove the secret bundle if present.
    async fn remove_secret(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Remove the persistent workspace if present. Only single-instance
    /// teardown destroys data, and only through this call.
    async fn remove_storage(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Remove the compute workload if present.
    async fn remove_workload(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Remove the endpoint if present.
    async fn remove_endpoint(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Remove the isolation policy if present.
    async fn remove_policy(&self, identity: &InstanceIdentity) -> Result<()>;

    /// Remove every bundle belonging to a tenant, matched by label, in no
    /// particular order.
    async fn remove_tenant_bundles(&self, tenant_id: &str) -> Result<()>;

    /// Remove tenant-shared substrate left after the last bundle is gone:
    /// the tenant network on the host pool, nothing on the cluster.
    async fn remove_tenant_shared(&self, tenant_id: &str) -> Result<()>;

    /// Whether the instance's workload exists at all. `false` is a
    /// complete answer; callers must not probe further.
    async fn workload_exists(&self, identity: &InstanceIdentity) -> Result<bool>;

    /// The runtime units currently backing the instance.
    async fn runtime_units(&self, identity: &InstanceIdentity) -> Result<Vec<RuntimeUnit>>;

    /// Stable address for the instance's gateway, when resolvable.
    async fn endpoint_address(&self, identity: &InstanceIdentity) -> Result<Option<String>>;

    /// List managed instances, optionally restricted to one tenant.
    async fn list_instances<'a>(&self, tenant_id: Option<&'a str>)
        -> Result<Vec<InstanceDescriptor>>;

    /// Fetch recent log output from the instance's workload.
    async fn logs(&self, identity: &InstanceIdentity, tail: Option<i64>) -> Result<String>;
}

/// Build the backend selected by the settings file.
pub async fn create_backend(settings: &Settings) -> Result<Box<dyn Backend>> {
    match &settings.backend {
        BackendSettings::Cluster(cluster) => Ok(Box::new(
            ClusterBackend::connect(cluster.clone(), settings.image.clone()).await?,
        )),
        BackendSettings::HostPool(pool) => Ok(Box::new(HostPoolBackend::new(
            pool.clone(),
            settings.image.clone(),
        )?)),
    }
}
