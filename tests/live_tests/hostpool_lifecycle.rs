//! Live lifecycle stories against the local Docker daemon
//!
//! The daemon acts as a one-worker pool named `local`. Stories create real
//! containers, networks, and host directories under `/tmp/perch-live-tests`,
//! and sweep their tenant on both sides of the run.

use perch::Error;

use super::helpers::{hostpool_client, sample_config, test_tenant};

/// Story: a bundle provisions onto the single local worker, shows up in
/// status and listings, and tears down without leftovers.
#[tokio::test]
#[ignore = "requires a local Docker daemon - run with: cargo test --test live -- --ignored"]
async fn story_hostpool_bundle_lifecycle() {
    let client = hostpool_client().await;
    let tenant = test_tenant("hpa");
    let _ = client.deprovision_all(&tenant).await;

    let receipt = client
        .provision(&tenant, "smoke", &sample_config(), None)
        .await
        .expect("provision failed");
    assert_eq!(receipt.worker.as_deref(), Some("local"));
    assert!(receipt.endpoint.is_some(), "published port should resolve");

    let status = client
        .get_status(&tenant, "smoke")
        .await
        .expect("status failed");
    assert!(status.exists);

    let listed = client.list_status(Some(&tenant)).await.expect("list failed");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].instance_id, "smoke");

    client.deprovision_all(&tenant).await.expect("teardown failed");
    let after = client.list_status(Some(&tenant)).await.expect("list failed");
    assert!(after.is_empty(), "teardown left instances behind");
    let gone = client
        .get_status(&tenant, "smoke")
        .await
        .expect("status failed");
    assert!(!gone.exists);
}

/// Story: provisioning the same instance twice converges on one container
/// instead of stacking a second one.
#[tokio::test]
#[ignore = "requires a local Docker daemon - run with: cargo test --test live -- --ignored"]
async fn story_hostpool_reprovision_converges() {
    let client = hostpool_client().await;
    let tenant = test_tenant("hpb");
    let _ = client.deprovision_all(&tenant).await;

    client
        .provision(&tenant, "smoke", &sample_config(), None)
        .await
        .expect("first provision failed");
    client
        .provision(&tenant, "smoke", &sample_config(), None)
        .await
        .expect("second provision failed");

    let listed = client.list_status(Some(&tenant)).await.expect("list failed");
    assert_eq!(listed.len(), 1, "reprovision must replace, not stack");

    client.deprovision_all(&tenant).await.expect("teardown failed");
}

/// Story: pinning to a worker the pool does not know fails before any
/// resource is created.
#[tokio::test]
#[ignore = "requires a local Docker daemon - run with: cargo test --test live -- --ignored"]
async fn story_pin_outside_the_pool_fails_before_any_apply() {
    let client = hostpool_client().await;
    let tenant = test_tenant("hpc");

    let err = client
        .provision(&tenant, "smoke", &sample_config(), Some("nonexistent"))
        .await
        .expect_err("pin to an unknown worker should fail");
    assert!(matches!(err, Error::UnknownWorker(_)));

    let listed = client.list_status(Some(&tenant)).await.expect("list failed");
    assert!(listed.is_empty(), "nothing should have been created");
}
