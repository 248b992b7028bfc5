//! Error types for the Perch orchestrator

use thiserror::Error;

use crate::backend::ResourceKind;

/// Main error type for provisioning operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Tenant or instance identity failed validation; rejected before any
    /// backend call is made
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Instance configuration failed validation; rejected before any backend
    /// call is made
    #[error("validation error: {0}")]
    Validation(String),

    /// The control plane or a host agent is not responding; safe to retry
    /// with backoff
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// No worker in the pool answered its health probe; fatal for this call,
    /// retry policy is the caller's decision
    #[error("no reachable worker in the pool")]
    NoReachableWorker,

    /// A pinned target worker is not part of the configured pool
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// A bundle apply failed mid-sequence. Carries which kinds are already
    /// live so callers know a retried `provision` only has to re-apply
    /// idempotently.
    #[error("bundle apply failed at {failed} (already applied: {applied:?}): {source}")]
    PartialBundleFailure {
        /// Resource kinds applied before the failure, in apply order
        applied: Vec<ResourceKind>,
        /// The resource kind whose apply failed
        failed: ResourceKind,
        /// The underlying failure
        source: Box<Error>,
    },

    /// A backend operation failed in a way the taxonomy does not classify
    /// further (helper container exited non-zero, malformed API response, ...)
    #[error("backend error: {0}")]
    Backend(String),

    /// Settings file could not be loaded or failed validation
    #[error("settings error: {0}")]
    Settings(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Docker API error
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an identity validation error with the given message
    pub fn invalid_identity(msg: impl Into<String>) -> Self {
        Self::InvalidIdentity(msg.into())
    }

    /// Create a config validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a backend-unreachable error with the given message
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::BackendUnreachable(msg.into())
    }

    /// Create a generic backend error with the given message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a settings error with the given message
    pub fn settings(msg: impl Into<String>) -> Self {
        Self::Settings(msg.into())
    }

    /// Whether retrying the failed call with backoff is a sensible strategy.
    ///
    /// Identity and placement errors need operator action and never heal on
    /// their own. Transport-level failures usually do. A partial bundle
    /// failure inherits the answer from its cause: the bundle itself is
    /// always safe to re-apply, the question is only whether the cause can
    /// clear.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::BackendUnreachable(_) => true,
            Error::PartialBundleFailure { source, .. } => source.is_retryable(),
            Error::Kube(e) => kube_retryable(e),
            Error::Docker(e) => docker_retryable(e),
            Error::InvalidIdentity(_)
            | Error::Validation(_)
            | Error::NoReachableWorker
            | Error::UnknownWorker(_)
            | Error::Backend(_)
            | Error::Settings(_)
            | Error::Serialization(_)
            | Error::Io(_) => false,
        }
    }
}

/// HTTP-status based retry classification for Kubernetes API errors.
/// Non-API variants are transport problems and worth retrying.
fn kube_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
        _ => true,
    }
}

/// Same classification for the Docker API.
fn docker_retryable(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            *status_code == 429 || *status_code >= 500
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Provisioning Operations
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the orchestrator during
    // bundle operations. Each error type represents a different failure
    // category with specific handling requirements.

    /// Story: identity validation catches bad ids before any backend call
    ///
    /// When a caller supplies a tenant or instance id that cannot be turned
    /// into a backend-legal resource name, the naming layer rejects it
    /// immediately with a message naming the offending input.
    #[test]
    fn story_identity_validation_rejects_before_backend_calls() {
        // Scenario: empty tenant id
        let err = Error::invalid_identity("tenant id must not be empty");
        assert!(err.to_string().contains("invalid identity"));
        assert!(err.to_string().contains("empty"));

        // Scenario: uppercase characters would break DNS-label naming
        let err = Error::invalid_identity("tenant id 'Acme' contains characters outside [a-z0-9]");
        assert!(err.to_string().contains("Acme"));

        // Identity errors are user errors; retrying cannot help
        assert!(!Error::invalid_identity("anything").is_retryable());
    }

    /// Story: unreachable backends are transient and worth retrying
    ///
    /// When the control plane or a host agent stops answering, the failed
    /// call surfaces as BackendUnreachable and the caller's backoff loop is
    /// the right response.
    #[test]
    fn story_unreachable_backend_is_retryable() {
        let err = Error::unreachable("docker daemon on worker-2 not answering ping");
        assert!(err.to_string().contains("backend unreachable"));
        assert!(err.to_string().contains("worker-2"));
        assert!(err.is_retryable());
    }

    /// Story: an empty reachable set is fatal for the call
    ///
    /// The selector never retries internally; the caller decides whether to
    /// try again later, so the classifier reports not-retryable.
    #[test]
    fn story_no_reachable_worker_is_fatal_for_the_call() {
        let err = Error::NoReachableWorker;
        assert!(err.to_string().contains("no reachable worker"));
        assert!(!err.is_retryable());
    }

    /// Story: partial bundle failures say exactly which kinds are live
    ///
    /// A provision that dies mid-sequence reports the kinds already applied
    /// and the kind that failed, so an operator reading the error knows the
    /// bundle state, and a retried provision converges idempotently.
    #[test]
    fn story_partial_bundle_failure_names_applied_kinds() {
        let err = Error::PartialBundleFailure {
            applied: vec![ResourceKind::Config, ResourceKind::Secret],
            failed: ResourceKind::Storage,
            source: Box::new(Error::unreachable("connection reset")),
        };

        let msg = err.to_string();
        assert!(msg.contains("failed at storage"));
        assert!(msg.contains("Config"));
        assert!(msg.contains("Secret"));
        assert!(msg.contains("connection reset"));

        // Retryability follows the cause: the bundle re-apply is always safe
        assert!(err.is_retryable());

        let err = Error::PartialBundleFailure {
            applied: vec![],
            failed: ResourceKind::Config,
            source: Box::new(Error::invalid_identity("bad")),
        };
        assert!(!err.is_retryable());
    }

    /// Story: Kubernetes API errors are classified by status code
    #[test]
    fn story_kube_errors_classified_by_status() {
        fn api_error(code: u16) -> Error {
            Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "test".to_string(),
                code,
            }))
        }

        // Server-side trouble recovers; client mistakes do not
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(!api_error(404).is_retryable());
        assert!(!api_error(409).is_retryable());
        assert!(!api_error(400).is_retryable());
    }

    /// Story: error helper functions accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let dynamic_msg = format!("worker {} gone", "pool-a-3");
        let err = Error::unreachable(dynamic_msg);
        assert!(err.to_string().contains("pool-a-3"));

        let err = Error::backend("static message");
        assert!(err.to_string().contains("static message"));

        let err = Error::settings(format!("missing field '{}'", "workers"));
        assert!(err.to_string().contains("workers"));
    }
}
