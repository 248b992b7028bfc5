//! Docker host-pool backend
//!
//! Bundles are provisioned onto a statically configured pool of Docker
//! hosts, reached only through their daemon APIs:
//!
//! - config: files under `{data_root}/{tenant}/{instance}/config` on the
//!   chosen worker, written by a short-lived helper container
//! - secret: nothing stored, the entries travel as container environment
//!   at create time
//! - storage: `{data_root}/{tenant}/{instance}/workspace`, never wiped
//!   once created
//! - workload: one container carrying the canonical bundle name
//! - endpoint: the gateway port published to an ephemeral host port at
//!   create, read back from the container inspect
//! - policy: membership in the shared per-tenant bridge network
//!
//! Placement settles once per bundle: the worker already hosting the
//! instance's container wins, then an explicit pin, then the least-loaded
//! reachable worker. The whole bundle, config files included, lands on
//! that one worker.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerState, ContainerStateStatusEnum,
    HealthStatusEnum, HostConfig, NetworkCreateRequest, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptions, ListContainersOptionsBuilder, ListNetworksOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder, WaitContainerOptions,
};
use bollard::Docker;
use futures::{future, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{Backend, InstanceDescriptor, Placement, WorkloadSpec};
use crate::config::{SecretMap, Sizing};
use crate::naming::{self, InstanceIdentity};
use crate::pool::{self, WorkerProbe};
use crate::settings::HostPoolSettings;
use crate::status::{RuntimePhase, RuntimeUnit};
use crate::{
    Error, Result, AGENT_CONFIG_DIR, AGENT_WORKSPACE_DIR, CONFIG_DOCUMENT_FILE,
    DEFAULT_GATEWAY_PORT, INSTRUCTIONS_FILE,
};

/// Image for the short-lived file helper containers.
const HELPER_IMAGE: &str = "busybox:1.36";

/// Mount point of the pool data root inside helper containers.
const HELPER_DATA_DIR: &str = "/data";

/// Component label for helper containers, distinct from the agent
/// component so listings never match them.
const COMPONENT_HELPER: &str = "helper";

/// Daemon socket bound into agent containers for sandbox spawning.
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Exit status the workspace helper uses to report a pre-existing
/// directory, which must be kept as is.
const EXIT_WORKSPACE_EXISTS: i64 = 42;

/// CFS scheduler period paired with the quota derived from the cpu limit.
const CPU_PERIOD_MICROS: i64 = 100_000;

/// Connection timeout for remote daemons, in seconds.
const DAEMON_TIMEOUT_SECS: u64 = 120;

/// A configured worker plus its live daemon connection.
struct PoolWorker {
    spec: pool::Worker,
    docker: Docker,
}

/// Backend provisioning bundles onto a pool of Docker hosts.
pub struct HostPoolBackend {
    workers: Vec<PoolWorker>,
    data_root: String,
    image: String,
    /// Bundle name to worker name, settled by [`Backend::resolve_placement`]
    /// so every apply call of one provision run lands on the same worker.
    placements: Mutex<HashMap<String, String>>,
}

impl HostPoolBackend {
    /// Connect to every configured worker daemon.
    ///
    /// Connections are lazy in bollard; an unreachable worker surfaces at
    /// the first call against it, not here.
    pub fn new(settings: HostPoolSettings, image: String) -> Result<Self> {
        if settings.workers.is_empty() {
            return Err(Error::settings("host pool needs at least one worker"));
        }
        let mut workers = Vec::with_capacity(settings.workers.len());
        for spec in settings.workers {
            let docker = connect_worker(&spec.address)?;
            workers.push(PoolWorker { spec, docker });
        }
        Ok(Self {
            workers,
            data_root: settings.data_root,
            image,
            placements: Mutex::new(HashMap::new()),
        })
    }

    /// Look up a configured worker by name.
    ///
    /// A name outside the pool is [`Error::UnknownWorker`], never a
    /// fallback to automatic selection.
    fn worker(&self, name: &str) -> Result<&PoolWorker> {
        self.workers
            .iter()
            .find(|worker| worker.spec.name == name)
            .ok_or_else(|| Error::UnknownWorker(name.to_string()))
    }

    /// Probe every worker concurrently for reachability and load.
    ///
    /// Load is the count of all running containers on the worker, managed
    /// or not. The snapshot is taken fresh per call, never cached.
    async fn probe(&self) -> Vec<WorkerProbe> {
        future::join_all(self.workers.iter().map(|worker| async move {
            match worker
                .docker
                .list_containers(None::<ListContainersOptions>)
                .await
            {
                Ok(running) => WorkerProbe::reachable(&worker.spec.name, running.len()),
                Err(e) => {
                    debug!(worker = %worker.spec.name, error = %e, "worker probe failed");
                    WorkerProbe::unreachable(&worker.spec.name)
                }
            }
        }))
        .await
    }

    /// Find the worker hosting a container with the given name.
    ///
    /// A worker that fails with anything other than not-found aborts the
    /// search; absence cannot be proven without an answer from every
    /// worker.
    async fn find_container(
        &self,
        name: &str,
    ) -> Result<Option<(&PoolWorker, ContainerInspectResponse)>> {
        for worker in &self.workers {
            match worker
                .docker
                .inspect_container(name, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => return Ok(Some((worker, inspect))),
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// The worker this instance's bundle lands on.
    ///
    /// Resolution order: the placement settled by `resolve_placement`,
    /// then the worker already hosting the container, then a fresh
    /// least-loaded selection.
    async fn placed_worker(&self, identity: &InstanceIdentity) -> Result<&PoolWorker> {
        if let Some(name) = self.placements.lock().await.get(identity.name()).cloned() {
            return self.worker(&name);
        }
        if let Some((worker, _)) = self.find_container(identity.name()).await? {
            self.remember(identity.name(), &worker.spec.name).await;
            return Ok(worker);
        }
        let probes = self.probe().await;
        let chosen = pool::select_worker(&probes)?;
        let worker = self.worker(&chosen.name)?;
        self.remember(identity.name(), &worker.spec.name).await;
        Ok(worker)
    }

    async fn remember(&self, name: &str, worker: &str) {
        self.placements
            .lock()
            .await
            .insert(name.to_string(), worker.to_string());
    }

    async fn forget(&self, name: &str) {
        self.placements.lock().await.remove(name);
    }

    /// Make sure an image is present on the worker, pulling it if not.
    async fn ensure_image(&self, worker: &PoolWorker, image: &str) -> Result<()> {
        if worker.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image = %image, worker = %worker.spec.name, "pulling image");
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut pull = worker.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let update = progress?;
            if let Some(status) = update.status {
                debug!(image = %image, status = %status, "pull progress");
            }
        }
        Ok(())
    }

    /// Make sure the tenant's bridge network exists on the worker.
    async fn ensure_tenant_network(&self, worker: &PoolWorker, tenant_id: &str) -> Result<()> {
        let name = naming::tenant_network_name(tenant_id);
        let filters = HashMap::from([("name".to_string(), vec![name.clone()])]);
        let options = ListNetworksOptionsBuilder::default().filters(&filters).build();
        let networks = worker.docker.list_networks(Some(options)).await?;
        // the name filter matches substrings, check for the exact network
        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(name.as_str()))
        {
            return Ok(());
        }
        let request = NetworkCreateRequest {
            name: name.clone(),
            driver: Some("bridge".to_string()),
            labels: Some(HashMap::from([
                (naming::LABEL_APP.to_string(), naming::APP_NAME.to_string()),
                (naming::LABEL_TENANT.to_string(), tenant_id.to_string()),
            ])),
            ..Default::default()
        };
        match worker.docker.create_network(request).await {
            Ok(_) => {
                debug!(network = %name, worker = %worker.spec.name, "created tenant network");
                Ok(())
            }
            // lost a create race, the network exists now
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run a throwaway helper container with the data root mounted at
    /// [`HELPER_DATA_DIR`] and return the script's exit status.
    async fn run_helper(&self, worker: &PoolWorker, task: &str, script: &str) -> Result<i64> {
        self.ensure_image(worker, HELPER_IMAGE).await?;
        let suffix: u32 = rand::thread_rng().gen();
        let name = format!("{}-helper-{suffix:08x}", naming::APP_NAME);
        let body = ContainerCreateBody {
            image: Some(HELPER_IMAGE.to_string()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]),
            labels: Some(HashMap::from([
                (naming::LABEL_APP.to_string(), naming::APP_NAME.to_string()),
                (
                    naming::LABEL_COMPONENT.to_string(),
                    COMPONENT_HELPER.to_string(),
                ),
            ])),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{HELPER_DATA_DIR}", self.data_root)]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        worker.docker.create_container(Some(options), body).await?;

        let started = worker
            .docker
            .start_container(&name, None::<StartContainerOptions>)
            .await;
        let outcome = match started {
            Ok(()) => {
                worker
                    .docker
                    .wait_container(&name, None::<WaitContainerOptions>)
                    .next()
                    .await
            }
            Err(e) => Some(Err(e)),
        };

        let remove = RemoveContainerOptionsBuilder::default().force(true).v(true).build();
        if let Err(e) = worker.docker.remove_container(&name, Some(remove)).await {
            warn!(helper = %name, worker = %worker.spec.name, error = %e, "failed to remove helper container");
        }

        match outcome {
            Some(Ok(response)) => Ok(response.status_code),
            // wait reports a nonzero script exit as an error variant
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::backend(format!(
                "{task} helper on {} ended without an exit status",
                worker.spec.name
            ))),
        }
    }

    /// Run a removal script on every worker.
    ///
    /// Instance directories live on at most one worker and removing an
    /// absent path succeeds, so sweeping the whole pool is the reliable
    /// way to delete without knowing the placement.
    async fn sweep_helper(&self, task: &str, script: &str) -> Result<()> {
        for worker in &self.workers {
            let status = self.run_helper(worker, task, script).await?;
            if status != 0 {
                return Err(Error::backend(format!(
                    "{task} helper exited {status} on {}",
                    worker.spec.name
                )));
            }
        }
        Ok(())
    }

    /// Stop a container, then force-remove it with its anonymous volumes.
    async fn stop_and_remove(&self, worker: &PoolWorker, name: &str) -> Result<()> {
        let stop = StopContainerOptionsBuilder::default().t(10).build();
        if let Err(e) = worker.docker.stop_container(name, Some(stop)).await {
            warn!(name = %name, worker = %worker.spec.name, error = %e, "stop failed, removing anyway");
        }
        let remove = RemoveContainerOptionsBuilder::default().force(true).v(true).build();
        match worker.docker.remove_container(name, Some(remove)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Backend for HostPoolBackend {
    async fn resolve_placement<'a>(
        &self,
        identity: &InstanceIdentity,
        pinned: Option<&'a str>,
    ) -> Result<Placement> {
        if let Some((worker, _)) = self.find_container(identity.name()).await? {
            if let Some(pin) = pinned {
                if pin != worker.spec.name {
                    warn!(
                        name = %identity.name(),
                        pinned = %pin,
                        worker = %worker.spec.name,
                        "instance already lives on another worker, keeping it there"
                    );
                }
            }
            self.remember(identity.name(), &worker.spec.name).await;
            return Ok(Placement {
                worker: Some(worker.spec.name.clone()),
            });
        }
        let worker = match pinned {
            Some(pin) => self.worker(pin)?,
            None => {
                let probes = self.probe().await;
                let chosen = pool::select_worker(&probes)?;
                self.worker(&chosen.name)?
            }
        };
        self.remember(identity.name(), &worker.spec.name).await;
        debug!(name = %identity.name(), worker = %worker.spec.name, "placed instance");
        Ok(Placement {
            worker: Some(worker.spec.name.clone()),
        })
    }

    async fn apply_config<'a>(
        &self,
        identity: &InstanceIdentity,
        document: &Value,
        instructions: Option<&'a str>,
    ) -> Result<()> {
        let worker = self.placed_worker(identity).await?;
        let document = overlay_sandbox_network(document, identity.tenant_id());
        let rendered = serde_json::to_string_pretty(&document)?;
        let mut files = vec![(CONFIG_DOCUMENT_FILE, rendered)];
        if let Some(text) = instructions {
            files.push((INSTRUCTIONS_FILE, text.to_string()));
        }
        let script = config_write_script(identity, &files);
        let status = self.run_helper(worker, "config write", &script).await?;
        if status != 0 {
            return Err(Error::backend(format!(
                "config write helper exited {status} on {}",
                worker.spec.name
            )));
        }
        debug!(name = %identity.name(), worker = %worker.spec.name, "wrote config files");
        Ok(())
    }

    async fn apply_secret(&self, identity: &InstanceIdentity, _secrets: &SecretMap) -> Result<()> {
        // no secret object on a Docker host, the entries travel with the
        // container at create time
        debug!(name = %identity.name(), "secret entries travel with the workload");
        Ok(())
    }

    async fn apply_storage(&self, identity: &InstanceIdentity, _sizing: &Sizing) -> Result<()> {
        // a plain directory carries no quota, the size request is advisory
        let worker = self.placed_worker(identity).await?;
        let script = workspace_create_script(identity);
        let status = self.run_helper(worker, "workspace create", &script).await?;
        match status {
            0 => {
                debug!(name = %identity.name(), worker = %worker.spec.name, "created workspace");
                Ok(())
            }
            EXIT_WORKSPACE_EXISTS => {
                warn!(name = %identity.name(), worker = %worker.spec.name, "workspace exists, keeping it unchanged");
                Ok(())
            }
            other => Err(Error::backend(format!(
                "workspace helper exited {other} on {}",
                worker.spec.name
            ))),
        }
    }

    async fn apply_workload(
        &self,
        identity: &InstanceIdentity,
        spec: &WorkloadSpec,
    ) -> Result<Placement> {
        let worker = self.placed_worker(identity).await?;
        self.ensure_image(worker, &self.image).await?;
        // the container joins the tenant network at create time
        self.ensure_tenant_network(worker, identity.tenant_id()).await?;

        let body = build_container_body(identity, spec, &self.image, &self.data_root);
        let options = CreateContainerOptionsBuilder::default()
            .name(identity.name())
            .build();
        match worker.docker.create_container(Some(options), body.clone()).await {
            Ok(_) => {}
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(name = %identity.name(), worker = %worker.spec.name, "replacing existing container");
                self.stop_and_remove(worker, identity.name()).await?;
                let options = CreateContainerOptionsBuilder::default()
                    .name(identity.name())
                    .build();
                worker.docker.create_container(Some(options), body).await?;
            }
            Err(e) => return Err(e.into()),
        }
        worker
            .docker
            .start_container(identity.name(), None::<StartContainerOptions>)
            .await?;
        info!(name = %identity.name(), worker = %worker.spec.name, "workload started");
        Ok(Placement {
            worker: Some(worker.spec.name.clone()),
        })
    }

    async fn apply_endpoint(&self, identity: &InstanceIdentity) -> Result<()> {
        // the gateway port was published at container create
        debug!(name = %identity.name(), "endpoint is the published container port");
        Ok(())
    }

    async fn apply_policy(&self, identity: &InstanceIdentity) -> Result<()> {
        let worker = self.placed_worker(identity).await?;
        self.ensure_tenant_network(worker, identity.tenant_id()).await
    }

    async fn remove_config(&self, identity: &InstanceIdentity) -> Result<()> {
        self.sweep_helper("config remove", &remove_config_script(identity))
            .await
    }

    async fn remove_secret(&self, identity: &InstanceIdentity) -> Result<()> {
        debug!(name = %identity.name(), "no secret object to remove");
        Ok(())
    }

    async fn remove_storage(&self, identity: &InstanceIdentity) -> Result<()> {
        self.sweep_helper("workspace remove", &remove_workspace_script(identity))
            .await
    }

    async fn remove_workload(&self, identity: &InstanceIdentity) -> Result<()> {
        match self.find_container(identity.name()).await? {
            Some((worker, _)) => {
                self.stop_and_remove(worker, identity.name()).await?;
                self.forget(identity.name()).await;
                info!(name = %identity.name(), worker = %worker.spec.name, "workload removed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn remove_endpoint(&self, identity: &InstanceIdentity) -> Result<()> {
        debug!(name = %identity.name(), "no endpoint object to remove");
        Ok(())
    }

    async fn remove_policy(&self, identity: &InstanceIdentity) -> Result<()> {
        // the tenant network is shared across instances and falls with
        // remove_tenant_shared, not with one instance
        debug!(name = %identity.name(), "tenant network outlives the instance");
        Ok(())
    }

    /// Per-instance data directories sit under the tenant data dir and
    /// fall with it in [`Backend::remove_tenant_shared`].
    async fn remove_tenant_bundles(&self, tenant_id: &str) -> Result<()> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{}={}", naming::LABEL_APP, naming::APP_NAME),
                format!("{}={}", naming::LABEL_COMPONENT, naming::COMPONENT_AGENT),
                format!("{}={tenant_id}", naming::LABEL_TENANT),
            ],
        )]);
        for worker in &self.workers {
            let options = ListContainersOptionsBuilder::default()
                .all(true)
                .filters(&filters)
                .build();
            for summary in worker.docker.list_containers(Some(options)).await? {
                let Some(name) = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|name| name.trim_start_matches('/').to_string())
                else {
                    continue;
                };
                self.stop_and_remove(worker, &name).await?;
                self.forget(&name).await;
                info!(name = %name, worker = %worker.spec.name, "removed tenant workload");
            }
        }
        Ok(())
    }

    async fn remove_tenant_shared(&self, tenant_id: &str) -> Result<()> {
        let network = naming::tenant_network_name(tenant_id);
        let script = remove_tenant_dir_script(tenant_id);
        for worker in &self.workers {
            match worker.docker.remove_network(&network).await {
                Ok(()) => {
                    debug!(network = %network, worker = %worker.spec.name, "removed tenant network");
                }
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
            let status = self.run_helper(worker, "tenant data remove", &script).await?;
            if status != 0 {
                return Err(Error::backend(format!(
                    "tenant data remove helper exited {status} on {}",
                    worker.spec.name
                )));
            }
        }
        Ok(())
    }

    async fn workload_exists(&self, identity: &InstanceIdentity) -> Result<bool> {
        Ok(self.find_container(identity.name()).await?.is_some())
    }

    async fn runtime_units(&self, identity: &InstanceIdentity) -> Result<Vec<RuntimeUnit>> {
        match self.find_container(identity.name()).await? {
            Some((worker, inspect)) => Ok(vec![container_unit(
                identity.name(),
                inspect.state.as_ref(),
                &worker.spec.name,
            )]),
            None => Ok(Vec::new()),
        }
    }

    async fn endpoint_address(&self, identity: &InstanceIdentity) -> Result<Option<String>> {
        match self.find_container(identity.name()).await? {
            Some((worker, inspect)) => Ok(published_gateway_port(&inspect)
                .map(|port| format!("{}:{port}", worker_host(&worker.spec.address)))),
            None => Ok(None),
        }
    }

    async fn list_instances<'a>(
        &self,
        tenant_id: Option<&'a str>,
    ) -> Result<Vec<InstanceDescriptor>> {
        let mut labels = vec![
            format!("{}={}", naming::LABEL_APP, naming::APP_NAME),
            format!("{}={}", naming::LABEL_COMPONENT, naming::COMPONENT_AGENT),
        ];
        if let Some(tenant) = tenant_id {
            labels.push(format!("{}={tenant}", naming::LABEL_TENANT));
        }
        let filters = HashMap::from([("label".to_string(), labels)]);

        let mut instances = Vec::new();
        for worker in &self.workers {
            let options = ListContainersOptionsBuilder::default()
                .all(true)
                .filters(&filters)
                .build();
            for summary in worker.docker.list_containers(Some(options)).await? {
                let labels = summary.labels.unwrap_or_default();
                let (Some(tenant), Some(instance)) = (
                    labels.get(naming::LABEL_TENANT),
                    labels.get(naming::LABEL_INSTANCE),
                ) else {
                    warn!(worker = %worker.spec.name, "skipping agent container without identity labels");
                    continue;
                };
                let Some(name) = summary.names.as_ref().and_then(|names| names.first()) else {
                    continue;
                };
                instances.push(InstanceDescriptor {
                    tenant_id: tenant.clone(),
                    instance_id: instance.clone(),
                    name: name.trim_start_matches('/').to_string(),
                    worker: Some(worker.spec.name.clone()),
                });
            }
        }
        // stable output across the per-worker union
        instances.sort_by(|a, b| {
            (&a.tenant_id, &a.instance_id).cmp(&(&b.tenant_id, &b.instance_id))
        });
        Ok(instances)
    }

    async fn logs(&self, identity: &InstanceIdentity, tail: Option<i64>) -> Result<String> {
        let Some((worker, _)) = self.find_container(identity.name()).await? else {
            return Err(Error::backend(format!(
                "no runtime units for {}",
                identity.name()
            )));
        };
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .tail(&tail)
            .build();
        let mut stream = worker.docker.logs(identity.name(), Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(output)
    }
}

/// Connect to one worker daemon by address scheme.
fn connect_worker(address: &str) -> Result<Docker> {
    let docker = if address == "unix:///var/run/docker.sock" || address == DOCKER_SOCKET {
        Docker::connect_with_socket_defaults()?
    } else if let Some(path) = address.strip_prefix("unix://") {
        Docker::connect_with_socket(path, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
    } else if address.starts_with("tcp://") || address.starts_with("http://") {
        Docker::connect_with_http(address, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
    } else {
        return Err(Error::settings(format!(
            "unsupported worker address: {address}"
        )));
    };
    Ok(docker)
}

/// Dial host for endpoint addresses, derived from the worker address.
fn worker_host(address: &str) -> String {
    let stripped = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("http://"));
    match stripped {
        Some(rest) => match rest.split([':', '/']).next() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => rest.to_string(),
        },
        // unix sockets are local to the operator host
        None => "localhost".to_string(),
    }
}

fn instance_rel_path(identity: &InstanceIdentity) -> String {
    format!("{}/{}", identity.tenant_id(), identity.instance_id())
}

/// Host-side config directory for the container bind.
fn config_host_dir(data_root: &str, identity: &InstanceIdentity) -> String {
    format!("{data_root}/{}/config", instance_rel_path(identity))
}

/// Host-side workspace directory for the container bind.
fn workspace_host_dir(data_root: &str, identity: &InstanceIdentity) -> String {
    format!("{data_root}/{}/workspace", instance_rel_path(identity))
}

/// Overlay the sandbox network onto the rendered document so the agent
/// spawns its sandbox containers into the tenant network. The document
/// builder itself stays substrate-agnostic.
fn overlay_sandbox_network(document: &Value, tenant_id: &str) -> Value {
    let mut document = document.clone();
    if let Some(agent) = document.get_mut("agent").and_then(Value::as_object_mut) {
        agent.insert(
            "sandbox".to_string(),
            json!({ "docker": { "network": naming::tenant_network_name(tenant_id) } }),
        );
    }
    document
}

/// Helper script creating the config directory and decoding each file
/// into it. Contents travel base64-encoded so no quoting in them can
/// escape the shell command.
fn config_write_script(identity: &InstanceIdentity, files: &[(&str, String)]) -> String {
    let dir = format!("{HELPER_DATA_DIR}/{}/config", instance_rel_path(identity));
    let mut script = format!("set -e\nmkdir -p {dir}");
    for (name, content) in files {
        let encoded = STANDARD.encode(content.as_bytes());
        script.push_str(&format!(
            "\nprintf '%s' '{encoded}' | base64 -d > {dir}/{name}"
        ));
    }
    script.push_str(&format!("\nchown -R 1000:1000 {dir}"));
    script
}

/// Helper script creating the workspace directory, reporting
/// [`EXIT_WORKSPACE_EXISTS`] instead of touching one that already exists.
fn workspace_create_script(identity: &InstanceIdentity) -> String {
    let dir = format!(
        "{HELPER_DATA_DIR}/{}/workspace",
        instance_rel_path(identity)
    );
    format!(
        "set -e\nif [ -d {dir} ]; then exit {EXIT_WORKSPACE_EXISTS}; fi\nmkdir -p {dir}\nchown 1000:1000 {dir}"
    )
}

/// Removal script for the config directory. Empty parent directories are
/// pruned opportunistically; a parent still holding the workspace stays.
fn remove_config_script(identity: &InstanceIdentity) -> String {
    let rel = instance_rel_path(identity);
    format!(
        "rm -rf {HELPER_DATA_DIR}/{rel}/config\nrmdir {HELPER_DATA_DIR}/{rel} 2>/dev/null || true\nrmdir {HELPER_DATA_DIR}/{} 2>/dev/null || true",
        identity.tenant_id()
    )
}

/// Removal script for the workspace directory, pruning empty parents the
/// same way.
fn remove_workspace_script(identity: &InstanceIdentity) -> String {
    let rel = instance_rel_path(identity);
    format!(
        "rm -rf {HELPER_DATA_DIR}/{rel}/workspace\nrmdir {HELPER_DATA_DIR}/{rel} 2>/dev/null || true\nrmdir {HELPER_DATA_DIR}/{} 2>/dev/null || true",
        identity.tenant_id()
    )
}

fn remove_tenant_dir_script(tenant_id: &str) -> String {
    format!("rm -rf {HELPER_DATA_DIR}/{tenant_id}")
}

fn env_lines(env: &SecretMap) -> Vec<String> {
    env.as_map()
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Container create body for the agent workload.
fn build_container_body(
    identity: &InstanceIdentity,
    spec: &WorkloadSpec,
    image: &str,
    data_root: &str,
) -> ContainerCreateBody {
    let gateway_port = format!("{DEFAULT_GATEWAY_PORT}/tcp");
    let port_bindings: PortMap = HashMap::from([(
        gateway_port.clone(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            // host port 0 asks the daemon for an ephemeral port
            host_port: Some("0".to_string()),
        }]),
    )]);
    let exposed_ports = HashMap::from([(gateway_port, HashMap::new())]);

    ContainerCreateBody {
        image: Some(image.to_string()),
        env: Some(env_lines(&spec.env)),
        labels: Some(identity.labels().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            binds: Some(vec![
                format!(
                    "{}:{AGENT_CONFIG_DIR}:ro",
                    config_host_dir(data_root, identity)
                ),
                format!(
                    "{}:{AGENT_WORKSPACE_DIR}",
                    workspace_host_dir(data_root, identity)
                ),
                format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}"),
            ]),
            memory: Some((spec.sizing.memory_limit_mb * 1024 * 1024) as i64),
            cpu_period: Some(CPU_PERIOD_MICROS),
            cpu_quota: Some(i64::from(spec.sizing.cpu_limit_millis) * 100),
            network_mode: Some(naming::tenant_network_name(identity.tenant_id())),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Map a container state onto the shared runtime phase vocabulary.
fn map_container_phase(status: Option<&ContainerStateStatusEnum>) -> RuntimePhase {
    match status {
        Some(
            ContainerStateStatusEnum::CREATED
            | ContainerStateStatusEnum::RESTARTING
            | ContainerStateStatusEnum::REMOVING,
        ) => RuntimePhase::Pending,
        Some(ContainerStateStatusEnum::RUNNING) => RuntimePhase::Running,
        Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => {
            RuntimePhase::Failed
        }
        // paused, empty, or no state at all
        _ => RuntimePhase::Unknown,
    }
}

/// Runtime unit for a container, folding in its healthcheck when one is
/// configured. Without a healthcheck, health follows the phase.
fn container_unit(name: &str, state: Option<&ContainerState>, worker: &str) -> RuntimeUnit {
    let phase = map_container_phase(state.and_then(|s| s.status.as_ref()));
    let healthy = match state
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status.as_ref())
    {
        Some(HealthStatusEnum::HEALTHY) => true,
        Some(HealthStatusEnum::STARTING | HealthStatusEnum::UNHEALTHY) => false,
        Some(HealthStatusEnum::NONE | HealthStatusEnum::EMPTY) | None => {
            phase == RuntimePhase::Running
        }
    };
    RuntimeUnit {
        name: name.to_string(),
        phase,
        healthy,
        worker: Some(worker.to_string()),
    }
}

/// Host port the gateway was published to, from the container inspect.
fn published_gateway_port(inspect: &ContainerInspectResponse) -> Option<String> {
    let key = format!("{DEFAULT_GATEWAY_PORT}/tcp");
    inspect
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&key)?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.clone())
}
