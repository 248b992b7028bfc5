//! Live lifecycle stories against a real cluster
//!
//! These stories use the active kubeconfig context and the namespace named
//! by `PERCH_TEST_NAMESPACE` (default `perch-test`), which must already
//! exist. The policy step applies a CiliumNetworkPolicy; on clusters
//! without the Cilium CRD the provision story fails at that step.

use super::helpers::{cluster_client, sample_config, test_tenant};

/// Story: a bundle provisions into the namespace, reports status, and
/// tears down completely.
#[tokio::test]
#[ignore = "requires a reachable cluster - run with: cargo test --test live -- --ignored"]
async fn story_cluster_bundle_lifecycle() {
    let client = cluster_client().await;
    let tenant = test_tenant("cla");
    let _ = client.deprovision_all(&tenant).await;

    let receipt = client
        .provision(&tenant, "smoke", &sample_config(), None)
        .await
        .expect("provision failed");
    assert_eq!(receipt.worker, None, "the scheduler owns placement");
    assert!(receipt.endpoint.is_some(), "service DNS should resolve");

    let status = client
        .get_status(&tenant, "smoke")
        .await
        .expect("status failed");
    assert!(status.exists);

    client
        .deprovision(&tenant, "smoke")
        .await
        .expect("deprovision failed");
    let gone = client
        .get_status(&tenant, "smoke")
        .await
        .expect("status failed");
    assert!(!gone.exists);

    client
        .deprovision_all(&tenant)
        .await
        .expect("tenant teardown failed");
}

/// Story: a config-only update lands without disturbing the workload.
#[tokio::test]
#[ignore = "requires a reachable cluster - run with: cargo test --test live -- --ignored"]
async fn story_cluster_config_update_leaves_the_workload_alone() {
    let client = cluster_client().await;
    let tenant = test_tenant("clb");
    let _ = client.deprovision_all(&tenant).await;

    client
        .provision(&tenant, "smoke", &sample_config(), None)
        .await
        .expect("provision failed");

    let mut updated = sample_config();
    updated.model = Some("claude-sonnet-4".to_string());
    client
        .update_config(&tenant, "smoke", &updated)
        .await
        .expect("config update failed");

    let status = client
        .get_status(&tenant, "smoke")
        .await
        .expect("status failed");
    assert!(status.exists, "the workload must survive a config update");

    client.deprovision_all(&tenant).await.expect("teardown failed");
}
