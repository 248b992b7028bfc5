//! Perch - per-tenant agent workload provisioning and lifecycle orchestration
//!
//! Perch provisions containerized agent instances on behalf of a multi-tenant
//! product. Each instance is a *resource bundle*: one compute workload plus its
//! configuration object, secret object, persistent workspace, exposed endpoint,
//! and network isolation policy. The same bundle contract is executed by two
//! interchangeable backends: a Kubernetes cluster, or a pool of independent
//! Docker hosts.
//!
//! # Architecture
//!
//! Provisioning is a client-side reconciliation, not a watch loop:
//! - Every apply is create-or-replace, so `provision` is idempotent and safe
//!   to re-invoke after partial failures.
//! - Bundle members share one deterministic canonical name and label set, so
//!   resources created by one code path stay discoverable by every other.
//! - Readiness is a separate read (`get_status`); nothing in provisioning
//!   blocks waiting for a workload to come up.
//!
//! # Modules
//!
//! - [`naming`] - Canonical resource names and label sets per tenant instance
//! - [`config`] - Instance configuration, config document and secret builders
//! - [`pool`] - Worker pool probing and least-loaded selection
//! - [`policy`] - CiliumNetworkPolicy types for tenant isolation
//! - [`status`] - Runtime status derivation
//! - [`backend`] - The backend contract and its cluster / host-pool implementations
//! - [`client`] - The top-level provisioning client
//! - [`settings`] - Operator settings file
//! - [`retry`] - Backoff policy for status polling
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod naming;
pub mod policy;
pub mod pool;
pub mod retry;
pub mod settings;
pub mod status;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these here keeps the backends, the config builder, and test
// fixtures agreeing on the same values.

/// Port the agent gateway listens on inside the workload
///
/// The cluster backend exposes it through a ClusterIP service; the host-pool
/// backend publishes it to an ephemeral host port at container creation.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Default context window advertised to the agent runtime
pub const DEFAULT_CONTEXT_WINDOW: u32 = 200_000;

/// Directory inside the workload where the config document is mounted
pub const AGENT_CONFIG_DIR: &str = "/etc/agent";

/// Directory inside the workload mounted on the persistent workspace
pub const AGENT_WORKSPACE_DIR: &str = "/workspace";

/// File name of the rendered config document
pub const CONFIG_DOCUMENT_FILE: &str = "agent.json";

/// File name of the optional system instructions document
pub const INSTRUCTIONS_FILE: &str = "INSTRUCTIONS.md";
