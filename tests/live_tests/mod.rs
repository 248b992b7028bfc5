//! Live integration tests for the provisioning client
//!
//! These tests tell the story of operating real tenant bundles on real
//! substrates:
//!
//! - `hostpool_lifecycle`: the local Docker daemon as a one-worker pool
//!   (containers, per-tenant networks, host directories)
//!
//! - `cluster_lifecycle`: the cluster the active kubeconfig points at
//!   (namespaced objects, label-selector teardown)
//!
//! # Running These Tests
//!
//! Ignored by default because they need live backends:
//!
//! ```bash
//! # Local Docker daemon
//! cargo test --test live hostpool -- --ignored
//!
//! # Reachable cluster with an existing namespace (default perch-test,
//! # override with PERCH_TEST_NAMESPACE)
//! cargo test --test live cluster -- --ignored
//! ```
//!
//! Each story namespaces its tenant to the test process and sweeps it on
//! both sides, so reruns start clean even after a failed run.

mod cluster_lifecycle;
mod helpers;
mod hostpool_lifecycle;
