//! Operator settings file
//!
//! One YAML document selects the backend and carries everything the
//! orchestrator needs to reach it. The backend choice is made here once;
//! nothing else in the crate branches on the substrate.
//!
//! ```yaml
//! image: ghcr.io/example/agent:1.4.2
//! backend:
//!   kind: host-pool
//!   data_root: /var/lib/perch
//!   workers:
//!     - name: worker-a
//!       address: unix:///var/run/docker.sock
//!     - name: worker-b
//!       address: tcp://10.0.0.5:2375
//! ```
//!
//! ```yaml
//! image: ghcr.io/example/agent:1.4.2
//! backend:
//!   kind: cluster
//!   namespace: perch-agents
//!   image_pull_secret: regcred
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::pool::Worker;
use crate::{Error, Result};

/// Top-level operator settings.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Agent container image, shared by both backends
    pub image: String,
    /// Which substrate to provision onto, and how to reach it
    pub backend: BackendSettings,
}

/// Backend selection, tagged by `kind` in the settings file.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendSettings {
    /// Kubernetes cluster backend
    Cluster(ClusterSettings),
    /// Docker host-pool backend
    HostPool(HostPoolSettings),
}

/// Settings for the Kubernetes cluster backend.
///
/// Cluster credentials are not configured here; the client uses the
/// ambient kubeconfig or in-cluster service account.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterSettings {
    /// Namespace holding every bundle this orchestrator manages
    pub namespace: String,
    /// Pull secret name referenced by workloads, for private registries
    #[serde(default)]
    pub image_pull_secret: Option<String>,
}

/// Settings for the Docker host-pool backend.
#[derive(Clone, Debug, Deserialize)]
pub struct HostPoolSettings {
    /// Workers in placement-preference order; ties in load go to the
    /// earlier entry
    pub workers: Vec<Worker>,
    /// Root of the per-tenant data directories on every worker
    #[serde(default = "default_data_root")]
    pub data_root: String,
}

fn default_data_root() -> String {
    "/var/lib/perch".to_string()
}

impl Settings {
    /// Load and validate settings from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .map_err(|e| Error::settings(format!("failed to parse settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the invariants parsing alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::settings("image must not be empty"));
        }
        match &self.backend {
            BackendSettings::Cluster(cluster) => {
                if cluster.namespace.trim().is_empty() {
                    return Err(Error::settings("cluster namespace must not be empty"));
                }
            }
            BackendSettings::HostPool(pool) => {
                if pool.workers.is_empty() {
                    return Err(Error::settings("host pool needs at least one worker"));
                }
                let mut seen = HashSet::new();
                for worker in &pool.workers {
                    if worker.name.trim().is_empty() || worker.address.trim().is_empty() {
                        return Err(Error::settings(
                            "every worker needs a name and an address",
                        ));
                    }
                    if !seen.insert(worker.name.as_str()) {
                        return Err(Error::settings(format!(
                            "duplicate worker name: {}",
                            worker.name
                        )));
                    }
                }
                // helper scripts interpolate this path on remote hosts
                if !pool.data_root.starts_with('/') {
                    return Err(Error::settings(format!(
                        "data_root must be an absolute path, got {}",
                        pool.data_root
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Settings {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn cluster_settings_parse_from_yaml() {
        let settings = parse(
            r#"
image: ghcr.io/example/agent:1.4.2
backend:
  kind: cluster
  namespace: perch-agents
  image_pull_secret: regcred
"#,
        );
        settings.validate().unwrap();

        let BackendSettings::Cluster(cluster) = &settings.backend else {
            panic!("expected cluster backend");
        };
        assert_eq!(cluster.namespace, "perch-agents");
        assert_eq!(cluster.image_pull_secret.as_deref(), Some("regcred"));
    }

    #[test]
    fn host_pool_settings_default_the_data_root() {
        let settings = parse(
            r#"
image: ghcr.io/example/agent:1.4.2
backend:
  kind: host-pool
  workers:
    - name: worker-a
      address: unix:///var/run/docker.sock
"#,
        );
        settings.validate().unwrap();

        let BackendSettings::HostPool(pool) = &settings.backend else {
            panic!("expected host-pool backend");
        };
        assert_eq!(pool.data_root, "/var/lib/perch");
        assert_eq!(pool.workers[0].name, "worker-a");
    }

    #[test]
    fn duplicate_worker_names_are_rejected() {
        let settings = parse(
            r#"
image: agent:dev
backend:
  kind: host-pool
  workers:
    - name: worker-a
      address: tcp://10.0.0.4:2375
    - name: worker-a
      address: tcp://10.0.0.5:2375
"#,
        );
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate worker name"));
    }

    #[test]
    fn empty_pools_and_relative_roots_are_rejected() {
        let empty = parse(
            r#"
image: agent:dev
backend:
  kind: host-pool
  workers: []
"#,
        );
        assert!(empty.validate().is_err());

        let relative = parse(
            r#"
image: agent:dev
backend:
  kind: host-pool
  data_root: var/lib/perch
  workers:
    - name: worker-a
      address: unix:///var/run/docker.sock
"#,
        );
        let err = relative.validate().unwrap_err();
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn unknown_backend_kinds_fail_to_parse() {
        let result: std::result::Result<Settings, _> = serde_yaml::from_str(
            r#"
image: agent:dev
backend:
  kind: nomad
  address: nomad.example.com
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn blank_image_is_rejected() {
        let settings = parse(
            r#"
image: "  "
backend:
  kind: cluster
  namespace: perch-agents
"#,
        );
        assert!(settings.validate().is_err());
    }
}
