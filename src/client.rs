//! Top-level provisioning client
//!
//! [`ProvisioningClient`] sequences bundle operations against whichever
//! [`Backend`] the settings selected. It owns everything substrate
//! independent: identity validation, document and secret rendering, apply
//! and teardown ordering, partial-failure reporting, and status
//! derivation. Everything substrate specific stays behind the backend
//! trait, which is what makes the orchestration testable against mocks.
//!
//! Provisioning is a client-side reconciliation. Every apply call is
//! create-or-replace (storage excepted), so re-invoking `provision` after
//! a partial failure converges instead of erroring; nothing here blocks
//! waiting for the workload to come up. Callers that want readiness use
//! [`ProvisioningClient::wait_until_running`].

use std::future::Future;

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{create_backend, Backend, Placement, ResourceKind, WorkloadSpec, REMOVE_ORDER};
use crate::config::{build_config_document, build_secret_map, InstanceConfig};
use crate::naming::{self, InstanceIdentity};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::settings::Settings;
use crate::status::{derive_status, InstanceStatus, ListStatusEntry};
use crate::{Error, Result};

/// What a successful provision settled on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProvisionReceipt {
    /// Owning tenant
    pub tenant_id: String,
    /// Instance within the tenant
    pub instance_id: String,
    /// Canonical bundle name
    pub name: String,
    /// Worker the workload landed on, host-pool only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Gateway endpoint, when already resolvable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Client provisioning and managing tenant agent instances.
pub struct ProvisioningClient {
    backend: Box<dyn Backend>,
}

impl ProvisioningClient {
    /// Build a client over an already constructed backend.
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Build a client from operator settings, connecting the selected
    /// backend.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(create_backend(settings).await?))
    }

    /// Provision an instance bundle, or reconcile an existing one.
    ///
    /// Applies every resource kind in dependency order. A mid-sequence
    /// failure surfaces as [`Error::PartialBundleFailure`] naming the
    /// kinds already live; re-invoking with the same arguments re-applies
    /// idempotently and converges.
    pub async fn provision(
        &self,
        tenant_id: &str,
        instance_id: &str,
        config: &InstanceConfig,
        worker: Option<&str>,
    ) -> Result<ProvisionReceipt> {
        let identity = InstanceIdentity::resolve(tenant_id, instance_id)?;
        config.validate()?;

        let document = build_config_document(config);
        let secrets = build_secret_map(config);
        let spec = WorkloadSpec {
            env: secrets.clone(),
            sizing: config.sizing,
            mount_instructions: config.instructions.is_some(),
        };

        // settles the worker everything below lands on; a pin outside the
        // pool fails here, before anything is applied
        self.backend.resolve_placement(&identity, worker).await?;

        let mut applied = Vec::new();
        step(
            &mut applied,
            ResourceKind::Config,
            self.backend
                .apply_config(&identity, &document, config.instructions.as_deref()),
        )
        .await?;
        step(
            &mut applied,
            ResourceKind::Secret,
            self.backend.apply_secret(&identity, &secrets),
        )
        .await?;
        step(
            &mut applied,
            ResourceKind::Storage,
            self.backend.apply_storage(&identity, &config.sizing),
        )
        .await?;
        let placement: Placement = step(
            &mut applied,
            ResourceKind::Workload,
            self.backend.apply_workload(&identity, &spec),
        )
        .await?;
        step(
            &mut applied,
            ResourceKind::Endpoint,
            self.backend.apply_endpoint(&identity),
        )
        .await?;
        step(
            &mut applied,
            ResourceKind::Policy,
            self.backend.apply_policy(&identity),
        )
        .await?;

        // failing to read the endpoint back must not fail a provision
        // that just succeeded
        let endpoint = match self.backend.endpoint_address(&identity).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(name = %identity.name(), error = %e, "could not resolve endpoint after provisioning");
                None
            }
        };

        match &placement.worker {
            Some(worker) => {
                info!(name = %identity.name(), worker = %worker, "instance provisioned");
            }
            None => info!(name = %identity.name(), "instance provisioned"),
        }
        Ok(ProvisionReceipt {
            tenant_id: tenant_id.to_string(),
            instance_id: instance_id.to_string(),
            name: identity.name().to_string(),
            worker: placement.worker,
            endpoint,
        })
    }

    /// Re-render and re-apply only the config and secret kinds.
    ///
    /// Compute, storage, endpoint, and policy stay untouched; a running
    /// workload picks the new config up on its own schedule.
    pub async fn update_config(
        &self,
        tenant_id: &str,
        instance_id: &str,
        config: &InstanceConfig,
    ) -> Result<()> {
        let identity = InstanceIdentity::resolve(tenant_id, instance_id)?;
        config.validate()?;

        let document = build_config_document(config);
        let secrets = build_secret_map(config);

        // settle on the worker currently hosting the instance before
        // touching any files
        self.backend.resolve_placement(&identity, None).await?;

        let mut applied = Vec::new();
        step(
            &mut applied,
            ResourceKind::Config,
            self.backend
                .apply_config(&identity, &document, config.instructions.as_deref()),
        )
        .await?;
        step(
            &mut applied,
            ResourceKind::Secret,
            self.backend.apply_secret(&identity, &secrets),
        )
        .await?;

        info!(name = %identity.name(), "configuration updated");
        Ok(())
    }

    /// Tear down one instance bundle, kind by kind in reverse apply
    /// order. Absent resources are skipped silently; the workspace is
    /// destroyed.
    pub async fn deprovision(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        let identity = InstanceIdentity::resolve(tenant_id, instance_id)?;
        for kind in REMOVE_ORDER {
            match kind {
                ResourceKind::Policy => self.backend.remove_policy(&identity).await?,
                ResourceKind::Endpoint => self.backend.remove_endpoint(&identity).await?,
                ResourceKind::Workload => self.backend.remove_workload(&identity).await?,
                ResourceKind::Storage => self.backend.remove_storage(&identity).await?,
                ResourceKind::Secret => self.backend.remove_secret(&identity).await?,
                ResourceKind::Config => self.backend.remove_config(&identity).await?,
            }
        }
        info!(name = %identity.name(), "instance deprovisioned");
        Ok(())
    }

    /// Tear down every bundle a tenant owns, plus tenant-shared substrate
    /// like the host-pool network. Bundle removal is label-matched and
    /// unordered.
    pub async fn deprovision_all(&self, tenant_id: &str) -> Result<()> {
        naming::validate_tenant_id(tenant_id)?;
        self.backend.remove_tenant_bundles(tenant_id).await?;
        self.backend.remove_tenant_shared(tenant_id).await?;
        info!(tenant = %tenant_id, "tenant deprovisioned");
        Ok(())
    }

    /// Current status of one instance.
    ///
    /// An absent workload answers immediately with
    /// [`InstanceStatus::absent`]; nothing else gets probed.
    pub async fn get_status(&self, tenant_id: &str, instance_id: &str) -> Result<InstanceStatus> {
        let identity = InstanceIdentity::resolve(tenant_id, instance_id)?;
        self.status_for(&identity).await
    }

    /// Status of every managed instance, optionally scoped to a tenant.
    ///
    /// Per-instance status failures degrade that entry to
    /// [`InstanceStatus::unknown`] instead of failing the whole listing.
    pub async fn list_status(&self, tenant_id: Option<&str>) -> Result<Vec<ListStatusEntry>> {
        if let Some(tenant) = tenant_id {
            naming::validate_tenant_id(tenant)?;
        }
        let descriptors = self.backend.list_instances(tenant_id).await?;
        let mut entries = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let status =
                match InstanceIdentity::resolve(&descriptor.tenant_id, &descriptor.instance_id) {
                    Ok(identity) => match self.status_for(&identity).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(name = %descriptor.name, error = %e, "status read failed, reporting unknown");
                            InstanceStatus::unknown()
                        }
                    },
                    Err(e) => {
                        warn!(name = %descriptor.name, error = %e, "descriptor carries an invalid identity");
                        InstanceStatus::unknown()
                    }
                };
            entries.push(ListStatusEntry {
                tenant_id: descriptor.tenant_id,
                instance_id: descriptor.instance_id,
                status,
            });
        }
        Ok(entries)
    }

    /// Recent log output from the instance's workload.
    pub async fn logs(
        &self,
        tenant_id: &str,
        instance_id: &str,
        tail: Option<i64>,
    ) -> Result<String> {
        let identity = InstanceIdentity::resolve(tenant_id, instance_id)?;
        self.backend.logs(&identity, tail).await
    }

    /// Poll status under the given retry policy until the instance
    /// reports running, returning the final status.
    pub async fn wait_until_running(
        &self,
        tenant_id: &str,
        instance_id: &str,
        retry: &RetryConfig,
    ) -> Result<InstanceStatus> {
        let identity = InstanceIdentity::resolve(tenant_id, instance_id)?;
        retry_with_backoff(retry, "wait_until_running", || async {
            let status = self.status_for(&identity).await?;
            if status.running {
                Ok(status)
            } else {
                let phase = status
                    .phase
                    .map_or_else(|| "absent".to_string(), |p| p.to_string());
                Err(Error::backend(format!(
                    "{} is not running yet (phase: {phase})",
                    identity.name()
                )))
            }
        })
        .await
    }

    async fn status_for(&self, identity: &InstanceIdentity) -> Result<InstanceStatus> {
        if !self.backend.workload_exists(identity).await? {
            // absence is a complete answer
            return Ok(InstanceStatus::absent());
        }
        let units = self.backend.runtime_units(identity).await?;
        let endpoint = self.backend.endpoint_address(identity).await?;
        Ok(derive_status(units, endpoint))
    }
}

/// Run one apply step, recording it on success and wrapping a failure
/// with everything already applied.
async fn step<T, F>(applied: &mut Vec<ResourceKind>, kind: ResourceKind, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match operation.await {
        Ok(value) => {
            applied.push(kind);
            Ok(value)
        }
        Err(source) => Err(Error::PartialBundleFailure {
            applied: applied.clone(),
            failed: kind,
            source: Box::new(source),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::Sequence;

    use super::*;
    use crate::backend::{InstanceDescriptor, MockBackend};
    use crate::status::{RuntimePhase, RuntimeUnit};

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn config() -> InstanceConfig {
        InstanceConfig::new("gw-token")
    }

    fn client(mock: MockBackend) -> ProvisioningClient {
        ProvisioningClient::new(Box::new(mock))
    }

    fn unit(phase: RuntimePhase, healthy: bool) -> RuntimeUnit {
        RuntimeUnit {
            name: "agent-acme-bot1".to_string(),
            phase,
            healthy,
            worker: None,
        }
    }

    fn descriptor(tenant: &str, instance: &str) -> InstanceDescriptor {
        InstanceDescriptor {
            tenant_id: tenant.to_string(),
            instance_id: instance.to_string(),
            name: format!("agent-{tenant}-{instance}"),
            worker: None,
        }
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    #[tokio::test]
    async fn provision_applies_the_bundle_in_dependency_order() {
        let mut mock = MockBackend::new();
        let mut seq = Sequence::new();
        mock.expect_resolve_placement()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Placement { worker: None }));
        mock.expect_apply_config()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        mock.expect_apply_secret()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_apply_storage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_apply_workload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(Placement {
                    worker: Some("worker-a".to_string()),
                })
            });
        mock.expect_apply_endpoint()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_apply_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_endpoint_address()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some("10.0.0.5:32768".to_string())));

        let receipt = client(mock)
            .provision("acme", "bot1", &config(), None)
            .await
            .unwrap();

        assert_eq!(receipt.name, "agent-acme-bot1");
        assert_eq!(receipt.worker.as_deref(), Some("worker-a"));
        assert_eq!(receipt.endpoint.as_deref(), Some("10.0.0.5:32768"));
    }

    /// The document handed to the config kind must never carry secret
    /// material; credentials travel only through the secret kind.
    #[tokio::test]
    async fn provision_keeps_credentials_out_of_the_document() {
        let mut full = config();
        full.providers
            .insert("anthropic".to_string(), "sk-ant-secret".to_string());

        let mut mock = MockBackend::new();
        mock.expect_resolve_placement()
            .returning(|_, _| Ok(Placement { worker: None }));
        mock.expect_apply_config()
            .withf(|_, document, _| {
                let rendered = document.to_string();
                !rendered.contains("gw-token") && !rendered.contains("sk-ant-secret")
            })
            .returning(|_, _, _| Ok(()));
        mock.expect_apply_secret()
            .withf(|_, secrets| {
                secrets.get("GATEWAY_TOKEN") == Some("gw-token")
                    && secrets.get("ANTHROPIC_API_KEY") == Some("sk-ant-secret")
            })
            .returning(|_, _| Ok(()));
        mock.expect_apply_storage().returning(|_, _| Ok(()));
        mock.expect_apply_workload()
            .returning(|_, _| Ok(Placement { worker: None }));
        mock.expect_apply_endpoint().returning(|_| Ok(()));
        mock.expect_apply_policy().returning(|_| Ok(()));
        mock.expect_endpoint_address().returning(|_| Ok(None));

        client(mock)
            .provision("acme", "bot1", &full, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn provision_reports_whats_applied_when_a_step_fails() {
        let mut mock = MockBackend::new();
        mock.expect_resolve_placement()
            .returning(|_, _| Ok(Placement { worker: None }));
        mock.expect_apply_config().returning(|_, _, _| Ok(()));
        mock.expect_apply_secret().returning(|_, _| Ok(()));
        mock.expect_apply_storage()
            .returning(|_, _| Err(Error::backend("storage quota exhausted")));
        mock.expect_apply_workload().never();
        mock.expect_apply_endpoint().never();
        mock.expect_apply_policy().never();

        let err = client(mock)
            .provision("acme", "bot1", &config(), None)
            .await
            .unwrap_err();

        match err {
            Error::PartialBundleFailure {
                applied,
                failed,
                source,
            } => {
                assert_eq!(applied, vec![ResourceKind::Config, ResourceKind::Secret]);
                assert_eq!(failed, ResourceKind::Storage);
                assert!(source.to_string().contains("storage quota exhausted"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn provision_validates_before_touching_the_backend() {
        // no expectations set: any backend call would panic the test
        let bad_identity = client(MockBackend::new())
            .provision("Acme!", "bot1", &config(), None)
            .await
            .unwrap_err();
        assert!(matches!(bad_identity, Error::InvalidIdentity(_)));

        let bad_config = client(MockBackend::new())
            .provision("acme", "bot1", &InstanceConfig::new(""), None)
            .await
            .unwrap_err();
        assert!(matches!(bad_config, Error::Validation(_)));
    }

    #[tokio::test]
    async fn endpoint_read_failure_does_not_fail_provision() {
        let mut mock = MockBackend::new();
        mock.expect_resolve_placement()
            .returning(|_, _| Ok(Placement { worker: None }));
        mock.expect_apply_config().returning(|_, _, _| Ok(()));
        mock.expect_apply_secret().returning(|_, _| Ok(()));
        mock.expect_apply_storage().returning(|_, _| Ok(()));
        mock.expect_apply_workload()
            .returning(|_, _| Ok(Placement { worker: None }));
        mock.expect_apply_endpoint().returning(|_| Ok(()));
        mock.expect_apply_policy().returning(|_| Ok(()));
        mock.expect_endpoint_address()
            .returning(|_| Err(Error::unreachable("gateway timeout")));

        let receipt = client(mock)
            .provision("acme", "bot1", &config(), None)
            .await
            .unwrap();
        assert_eq!(receipt.endpoint, None);
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    #[tokio::test]
    async fn deprovision_removes_in_reverse_apply_order() {
        let mut mock = MockBackend::new();
        let mut seq = Sequence::new();
        mock.expect_remove_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_remove_endpoint()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_remove_workload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_remove_storage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_remove_secret()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_remove_config()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        client(mock).deprovision("acme", "bot1").await.unwrap();
    }

    #[tokio::test]
    async fn tenant_teardown_sweeps_bundles_then_shared_substrate() {
        let mut mock = MockBackend::new();
        let mut seq = Sequence::new();
        mock.expect_remove_tenant_bundles()
            .withf(|tenant| tenant == "acme")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_remove_tenant_shared()
            .withf(|tenant| tenant == "acme")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        client(mock).deprovision_all("acme").await.unwrap();
    }

    // =========================================================================
    // Status
    // =========================================================================

    #[tokio::test]
    async fn absent_status_probes_nothing_further() {
        let mut mock = MockBackend::new();
        mock.expect_workload_exists()
            .times(1)
            .returning(|_| Ok(false));
        mock.expect_runtime_units().never();
        mock.expect_endpoint_address().never();

        let status = client(mock).get_status("acme", "bot1").await.unwrap();
        assert_eq!(status, InstanceStatus::absent());
    }

    #[tokio::test]
    async fn one_broken_instance_does_not_poison_the_listing() {
        let mut mock = MockBackend::new();
        mock.expect_list_instances()
            .returning(|_| Ok(vec![descriptor("acme", "bot1"), descriptor("acme", "bot2")]));
        mock.expect_workload_exists().returning(|identity| {
            if identity.instance_id() == "bot1" {
                Ok(true)
            } else {
                Err(Error::unreachable("daemon down"))
            }
        });
        mock.expect_runtime_units()
            .returning(|_| Ok(vec![unit(RuntimePhase::Running, true)]));
        mock.expect_endpoint_address().returning(|_| Ok(None));

        let entries = client(mock).list_status(Some("acme")).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries[0].status.running);
        assert_eq!(entries[1].status, InstanceStatus::unknown());
    }

    #[tokio::test]
    async fn config_update_touches_only_config_and_secret() {
        let mut mock = MockBackend::new();
        let mut seq = Sequence::new();
        mock.expect_resolve_placement()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Placement { worker: None }));
        mock.expect_apply_config()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        mock.expect_apply_secret()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_apply_storage().never();
        mock.expect_apply_workload().never();
        mock.expect_apply_endpoint().never();
        mock.expect_apply_policy().never();

        client(mock)
            .update_config("acme", "bot1", &config())
            .await
            .unwrap();
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn wait_until_running_polls_status_until_ready() {
        let mut mock = MockBackend::new();
        let mut seq = Sequence::new();
        mock.expect_workload_exists().times(3).returning(|_| Ok(true));
        mock.expect_runtime_units()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![unit(RuntimePhase::Pending, false)]));
        mock.expect_runtime_units()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![unit(RuntimePhase::Running, true)]));
        mock.expect_endpoint_address()
            .times(3)
            .returning(|_| Ok(Some("10.0.0.5:32768".to_string())));

        let status = client(mock)
            .wait_until_running("acme", "bot1", &fast_retry(5))
            .await
            .unwrap();

        assert!(status.running);
        assert_eq!(status.endpoint.as_deref(), Some("10.0.0.5:32768"));
    }

    #[tokio::test]
    async fn wait_until_running_gives_up_after_max_attempts() {
        let mut mock = MockBackend::new();
        mock.expect_workload_exists().times(2).returning(|_| Ok(true));
        mock.expect_runtime_units()
            .times(2)
            .returning(|_| Ok(vec![unit(RuntimePhase::Pending, false)]));
        mock.expect_endpoint_address().times(2).returning(|_| Ok(None));

        let err = client(mock)
            .wait_until_running("acme", "bot1", &fast_retry(2))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not running yet"));
    }
}
