//! Live-backend integration tests
//!
//! These tests run against real substrates (a Kubernetes cluster or a local
//! Docker daemon). They are ignored by default and can be run with:
//!
//! ```bash
//! cargo test --test live -- --ignored
//! ```
//!
//! The host-pool stories talk to the local daemon socket; the cluster
//! stories use the active kubeconfig context.

mod live_tests;
