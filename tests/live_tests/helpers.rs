//! Shared fixtures for the live suites

use perch::client::ProvisioningClient;
use perch::config::InstanceConfig;
use perch::pool::Worker;
use perch::settings::{BackendSettings, ClusterSettings, HostPoolSettings, Settings};

/// Image the live workloads run. Overridable so CI can point at a
/// preloaded image.
pub fn agent_image() -> String {
    std::env::var("PERCH_TEST_IMAGE").unwrap_or_else(|_| "busybox:1.36".to_string())
}

/// Settings treating the local Docker daemon as a one-worker pool.
pub fn hostpool_settings() -> Settings {
    Settings {
        image: agent_image(),
        backend: BackendSettings::HostPool(HostPoolSettings {
            workers: vec![Worker {
                name: "local".to_string(),
                address: "unix:///var/run/docker.sock".to_string(),
            }],
            data_root: "/tmp/perch-live-tests".to_string(),
        }),
    }
}

/// Settings for the cluster the active kubeconfig points at. The namespace
/// must already exist.
pub fn cluster_settings() -> Settings {
    Settings {
        image: agent_image(),
        backend: BackendSettings::Cluster(ClusterSettings {
            namespace: std::env::var("PERCH_TEST_NAMESPACE")
                .unwrap_or_else(|_| "perch-test".to_string()),
            image_pull_secret: None,
        }),
    }
}

pub async fn hostpool_client() -> ProvisioningClient {
    ProvisioningClient::from_settings(&hostpool_settings())
        .await
        .expect("failed to connect the local Docker daemon")
}

pub async fn cluster_client() -> ProvisioningClient {
    ProvisioningClient::from_settings(&cluster_settings())
        .await
        .expect("failed to connect the cluster")
}

/// Minimal valid instance config for live runs.
pub fn sample_config() -> InstanceConfig {
    let mut config = InstanceConfig::new("live-test-token");
    config.instructions = Some("You are a live-suite smoke instance.".to_string());
    config
}

/// Tenant id namespaced to this test process, so parallel stories and
/// stale leftovers from other runs do not collide.
pub fn test_tenant(prefix: &str) -> String {
    format!("{prefix}{}", std::process::id() % 100_000)
}
