//! Kubernetes cluster backend
//!
//! One operator-owned namespace holds every bundle. Each resource kind maps
//! onto a native API object sharing the bundle's canonical name:
//!
//! - config: ConfigMap (`agent.json` + optional `INSTRUCTIONS.md`)
//! - secret: Opaque Secret wired into the pod via `envFrom`
//! - storage: PersistentVolumeClaim mounted at the workspace path
//! - workload: single-replica Deployment
//! - endpoint: ClusterIP Service on the gateway port
//! - policy: CiliumNetworkPolicy, applied as a `DynamicObject` since the
//!   CRD is not part of `k8s-openapi`
//!
//! Apply is create-or-replace: create first, and on a 409 fetch the live
//! object's resourceVersion and replace. Storage is the exception and is
//! never replaced once created.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::{Backend, InstanceDescriptor, Placement, WorkloadSpec};
use crate::config::{SecretMap, Sizing};
use crate::naming::{self, InstanceIdentity};
use crate::policy::tenant_isolation_policy;
use crate::settings::ClusterSettings;
use crate::status::{RuntimePhase, RuntimeUnit};
use crate::{
    Error, Result, AGENT_CONFIG_DIR, AGENT_WORKSPACE_DIR, CONFIG_DOCUMENT_FILE,
    DEFAULT_GATEWAY_PORT, INSTRUCTIONS_FILE,
};

/// Backend provisioning bundles as Kubernetes objects in one namespace.
pub struct ClusterBackend {
    client: Client,
    namespace: String,
    image: String,
    image_pull_secret: Option<String>,
}

impl ClusterBackend {
    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn connect(settings: ClusterSettings, image: String) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, settings, image))
    }

    /// Build against an existing client, used by integration tests.
    pub fn new(client: Client, settings: ClusterSettings, image: String) -> Self {
        Self {
            client,
            namespace: settings.namespace,
            image,
            image_pull_secret: settings.image_pull_secret,
        }
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn policies(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind {
            group: "cilium.io".to_string(),
            version: "v2".to_string(),
            kind: "CiliumNetworkPolicy".to_string(),
        };
        let resource = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
    }

    /// Create the object, or on a name conflict replace the live one.
    ///
    /// Replace needs the live resourceVersion, so a conflict costs one
    /// extra read. Losing a race between the get and the replace surfaces
    /// as a retryable conflict to the caller.
    async fn create_or_replace<K>(&self, api: &Api<K>, name: &str, mut desired: K) -> Result<()>
    where
        K: kube::Resource + Clone + fmt::Debug + Serialize + DeserializeOwned,
    {
        match api.create(&PostParams::default(), &desired).await {
            Ok(_) => {
                debug!(name = %name, "created");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                let existing = api.get(name).await?;
                desired.meta_mut().resource_version = existing.resource_version();
                api.replace(name, &PostParams::default(), &desired).await?;
                debug!(name = %name, "replaced");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create the object, keeping any existing one untouched on conflict.
    async fn create_if_absent<K>(&self, api: &Api<K>, name: &str, desired: K) -> Result<()>
    where
        K: kube::Resource + Clone + fmt::Debug + Serialize + DeserializeOwned,
    {
        match api.create(&PostParams::default(), &desired).await {
            Ok(_) => {
                debug!(name = %name, "created");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(name = %name, "workspace claim exists, keeping it unchanged");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the named object, treating absence as success.
    async fn delete_if_exists<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: kube::Resource + Clone + fmt::Debug + DeserializeOwned,
    {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(name = %name, "deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    async fn resolve_placement<'a>(
        &self,
        _identity: &InstanceIdentity,
        pinned: Option<&'a str>,
    ) -> Result<Placement> {
        if let Some(worker) = pinned {
            warn!(worker = %worker, "worker pinning has no effect on the cluster backend");
        }
        Ok(Placement { worker: None })
    }

    async fn apply_config<'a>(
        &self,
        identity: &InstanceIdentity,
        document: &serde_json::Value,
        instructions: Option<&'a str>,
    ) -> Result<()> {
        let config_map = build_config_map(identity, document, instructions)?;
        self.create_or_replace(&self.config_maps(), identity.name(), config_map)
            .await
    }

    async fn apply_secret(&self, identity: &InstanceIdentity, secrets: &SecretMap) -> Result<()> {
        let secret = build_secret(identity, secrets);
        self.create_or_replace(&self.secrets(), identity.name(), secret)
            .await
    }

    async fn apply_storage(&self, identity: &InstanceIdentity, sizing: &Sizing) -> Result<()> {
        let claim = build_storage(identity, sizing)?;
        self.create_if_absent(&self.claims(), identity.name(), claim)
            .await
    }

    async fn apply_workload(
        &self,
        identity: &InstanceIdentity,
        spec: &WorkloadSpec,
    ) -> Result<Placement> {
        let deployment = build_workload(
            identity,
            spec,
            &self.image,
            self.image_pull_secret.as_deref(),
        )?;
        self.create_or_replace(&self.deployments(), identity.name(), deployment)
            .await?;
        Ok(Placement { worker: None })
    }

    async fn apply_endpoint(&self, identity: &InstanceIdentity) -> Result<()> {
        let service = build_endpoint(identity)?;
        self.create_or_replace(&self.services(), identity.name(), service)
            .await
    }

    async fn apply_policy(&self, identity: &InstanceIdentity) -> Result<()> {
        let policy = tenant_isolation_policy(identity, &self.namespace);
        let object: DynamicObject = serde_json::from_value(serde_json::to_value(&policy)?)?;
        self.create_or_replace(&self.policies(), identity.name(), object)
            .await
    }

    async fn remove_config(&self, identity: &InstanceIdentity) -> Result<()> {
        self.delete_if_exists(&self.config_maps(), identity.name())
            .await
    }

    async fn remove_secret(&self, identity: &InstanceIdentity) -> Result<()> {
        self.delete_if_exists(&self.secrets(), identity.name()).await
    }

    async fn remove_storage(&self, identity: &InstanceIdentity) -> Result<()> {
        self.delete_if_exists(&self.claims(), identity.name()).await
    }

    async fn remove_workload(&self, identity: &InstanceIdentity) -> Result<()> {
        self.delete_if_exists(&self.deployments(), identity.name())
            .await
    }

    async fn remove_endpoint(&self, identity: &InstanceIdentity) -> Result<()> {
        self.delete_if_exists(&self.services(), identity.name())
            .await
    }

    async fn remove_policy(&self, identity: &InstanceIdentity) -> Result<()> {
        self.delete_if_exists(&self.policies(), identity.name())
            .await
    }

    async fn remove_tenant_bundles(&self, tenant_id: &str) -> Result<()> {
        let selector = naming::tenant_selector(tenant_id);
        let delete = DeleteParams::default();
        let list = ListParams::default().labels(&selector);

        let _ = self.policies().delete_collection(&delete, &list).await?;
        let _ = self.services().delete_collection(&delete, &list).await?;
        let _ = self.deployments().delete_collection(&delete, &list).await?;
        let _ = self.claims().delete_collection(&delete, &list).await?;
        let _ = self.secrets().delete_collection(&delete, &list).await?;
        let _ = self.config_maps().delete_collection(&delete, &list).await?;
        debug!(tenant = %tenant_id, "tenant bundles deleted");
        Ok(())
    }

    async fn remove_tenant_shared(&self, _tenant_id: &str) -> Result<()> {
        // The namespace is operator-owned; bundles leave nothing shared
        Ok(())
    }

    async fn workload_exists(&self, identity: &InstanceIdentity) -> Result<bool> {
        Ok(self.deployments().get_opt(identity.name()).await?.is_some())
    }

    async fn runtime_units(&self, identity: &InstanceIdentity) -> Result<Vec<RuntimeUnit>> {
        let list = ListParams::default().labels(&identity.selector());
        let pods = self.pods().list(&list).await?;
        Ok(pods.items.iter().map(pod_to_unit).collect())
    }

    async fn endpoint_address(&self, identity: &InstanceIdentity) -> Result<Option<String>> {
        match self.services().get_opt(identity.name()).await? {
            Some(_) => Ok(Some(cluster_endpoint(identity.name(), &self.namespace))),
            None => Ok(None),
        }
    }

    async fn list_instances<'a>(
        &self,
        tenant_id: Option<&'a str>,
    ) -> Result<Vec<InstanceDescriptor>> {
        let selector = match tenant_id {
            Some(tenant) => naming::tenant_selector(tenant),
            None => naming::app_selector(),
        };
        let list = ListParams::default().labels(&selector);
        let deployments = self.deployments().list(&list).await?;

        let mut found = Vec::new();
        for deployment in deployments.items {
            let labels = deployment.labels();
            match (
                labels.get(naming::LABEL_TENANT),
                labels.get(naming::LABEL_INSTANCE),
            ) {
                (Some(tenant), Some(instance)) => found.push(InstanceDescriptor {
                    tenant_id: tenant.clone(),
                    instance_id: instance.clone(),
                    name: deployment.name_any(),
                    worker: None,
                }),
                _ => {
                    warn!(name = %deployment.name_any(), "managed deployment missing identity labels, skipping");
                }
            }
        }
        Ok(found)
    }

    async fn logs(&self, identity: &InstanceIdentity, tail: Option<i64>) -> Result<String> {
        let list = ListParams::default().labels(&identity.selector());
        let pods = self.pods().list(&list).await?;
        let mut names: Vec<String> = pods.items.iter().map(|p| p.name_any()).collect();
        names.sort();

        let Some(pod_name) = names.first() else {
            return Err(Error::backend(format!(
                "no runtime units for {}",
                identity.name()
            )));
        };

        let params = LogParams {
            tail_lines: tail,
            ..LogParams::default()
        };
        Ok(self.pods().logs(pod_name, &params).await?)
    }
}

/// In-cluster DNS address of the instance's gateway service.
fn cluster_endpoint(name: &str, namespace: &str) -> String {
    format!(
        "{}.{}.svc.cluster.local:{}",
        name, namespace, DEFAULT_GATEWAY_PORT
    )
}

fn build_config_map(
    identity: &InstanceIdentity,
    document: &serde_json::Value,
    instructions: Option<&str>,
) -> Result<ConfigMap> {
    let mut data = BTreeMap::new();
    data.insert(
        CONFIG_DOCUMENT_FILE.to_string(),
        serde_json::to_string_pretty(document)?,
    );
    if let Some(instructions) = instructions {
        data.insert(INSTRUCTIONS_FILE.to_string(), instructions.to_string());
    }

    Ok(ConfigMap {
        metadata: kube::api::ObjectMeta {
            name: Some(identity.name().to_string()),
            labels: Some(identity.labels()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

fn build_secret(identity: &InstanceIdentity, secrets: &SecretMap) -> Secret {
    Secret {
        metadata: kube::api::ObjectMeta {
            name: Some(identity.name().to_string()),
            labels: Some(identity.labels()),
            ..Default::default()
        },
        string_data: Some(secrets.as_map().clone()),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

fn build_storage(identity: &InstanceIdentity, sizing: &Sizing) -> Result<PersistentVolumeClaim> {
    let claim = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": identity.name(),
            "labels": identity.labels(),
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": {
                "requests": { "storage": format!("{}Gi", sizing.storage_gb) }
            }
        }
    }))?;
    Ok(claim)
}

fn build_workload(
    identity: &InstanceIdentity,
    spec: &WorkloadSpec,
    image: &str,
    image_pull_secret: Option<&str>,
) -> Result<Deployment> {
    let name = identity.name();
    let sizing = &spec.sizing;

    let mut volume_mounts = vec![json!({
        "name": "config",
        "mountPath": format!("{}/{}", AGENT_CONFIG_DIR, CONFIG_DOCUMENT_FILE),
        "subPath": CONFIG_DOCUMENT_FILE,
        "readOnly": true,
    })];
    if spec.mount_instructions {
        volume_mounts.push(json!({
            "name": "config",
            "mountPath": format!("{}/{}", AGENT_CONFIG_DIR, INSTRUCTIONS_FILE),
            "subPath": INSTRUCTIONS_FILE,
            "readOnly": true,
        }));
    }
    volume_mounts.push(json!({
        "name": "workspace",
        "mountPath": AGENT_WORKSPACE_DIR,
    }));

    let image_pull_secrets = image_pull_secret
        .map(|secret| json!([{ "name": secret }]))
        .unwrap_or_else(|| json!([]));

    let deployment = serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "labels": identity.labels(),
        },
        "spec": {
            "replicas": 1,
            "selector": {
                "matchLabels": {
                    (naming::LABEL_TENANT): identity.tenant_id(),
                    (naming::LABEL_INSTANCE): identity.instance_id(),
                }
            },
            "template": {
                "metadata": { "labels": identity.labels() },
                "spec": {
                    // Volume writes happen as the agent's unprivileged group
                    "securityContext": { "fsGroup": 1000 },
                    "imagePullSecrets": image_pull_secrets,
                    "containers": [{
                        "name": "agent",
                        "image": image,
                        "envFrom": [{ "secretRef": { "name": name } }],
                        "ports": [{
                            "name": "gateway",
                            "containerPort": DEFAULT_GATEWAY_PORT,
                        }],
                        "resources": {
                            "limits": {
                                "cpu": format!("{}m", sizing.cpu_limit_millis),
                                "memory": format!("{}Mi", sizing.memory_limit_mb),
                            },
                            "requests": {
                                "cpu": format!("{}m", sizing.cpu_limit_millis / 4),
                                "memory": format!("{}Mi", sizing.memory_limit_mb / 4),
                            },
                        },
                        "readinessProbe": {
                            "tcpSocket": { "port": DEFAULT_GATEWAY_PORT },
                            "initialDelaySeconds": 5,
                            "periodSeconds": 10,
                        },
                        "volumeMounts": volume_mounts,
                    }],
                    "volumes": [
                        { "name": "config", "configMap": { "name": name } },
                        { "name": "workspace", "persistentVolumeClaim": { "claimName": name } },
                    ],
                }
            }
        }
    }))?;
    Ok(deployment)
}

fn build_endpoint(identity: &InstanceIdentity) -> Result<Service> {
    let service = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": identity.name(),
            "labels": identity.labels(),
        },
        "spec": {
            "type": "ClusterIP",
            "selector": {
                (naming::LABEL_TENANT): identity.tenant_id(),
                (naming::LABEL_INSTANCE): identity.instance_id(),
            },
            "ports": [{
                "name": "gateway",
                "port": DEFAULT_GATEWAY_PORT,
                "targetPort": DEFAULT_GATEWAY_PORT,
                "protocol": "TCP",
            }],
        }
    }))?;
    Ok(service)
}

/// Translate one pod into a runtime unit.
///
/// Phase mapping: Running, Pending, and Failed map directly; Succeeded is
/// Failed because a long-running agent pod has no successful exit; anything
/// else is Unknown. Health is the pod's Ready condition.
fn pod_to_unit(pod: &Pod) -> RuntimeUnit {
    let status = pod.status.as_ref();
    let phase = match status.and_then(|s| s.phase.as_deref()) {
        Some("Running") => RuntimePhase::Running,
        Some("Pending") => RuntimePhase::Pending,
        Some("Failed") | Some("Succeeded") => RuntimePhase::Failed,
        _ => RuntimePhase::Unknown,
    };
    let healthy = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    RuntimeUnit {
        name: pod.name_any(),
        phase,
        healthy,
        worker: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
    }
}
