//! Error types for the Failure Informer operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error that could not be classified further
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Optimistic-concurrency version mismatch on write
    #[error("Conflict writing {kind}/{name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Lost a create race against another writer
    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    /// Resource rejected by schema or field validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Notifier filter that does not compile as a regular expression
    #[error("Invalid filter '{pattern}' on notifier {notifier}: {reason}")]
    InvalidFilter {
        notifier: String,
        pattern: String,
        reason: String,
    },

    /// Store unavailable, throttled, or timed out
    #[error("Transient error: {0}")]
    Transient(String),

    /// Notification delivery collaborator failed
    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Classify a raw kube error for the given object.
    ///
    /// API status codes map onto the error taxonomy: 404 is `NotFound`, 409
    /// with reason `AlreadyExists` is `AlreadyExists`, any other 409 is
    /// `Conflict`, 400/422 are validation failures and 429/5xx are transient.
    /// Transport failures are transient as well.
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => OperatorError::NotFound {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                },
                409 if ae.reason == "AlreadyExists" => OperatorError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                },
                409 => OperatorError::Conflict {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    message: ae.message,
                },
                400 | 422 => OperatorError::ValidationError(format!(
                    "{}/{}: {}",
                    kind, name, ae.message
                )),
                429 | 500..=599 => OperatorError::Transient(format!(
                    "{}/{}: {} ({})",
                    kind, name, ae.message, ae.code
                )),
                _ => OperatorError::KubeError(kube::Error::Api(ae)),
            },
            kube::Error::HyperError(e) => OperatorError::Transient(e.to_string()),
            kube::Error::Service(e) => OperatorError::Transient(e.to_string()),
            other => OperatorError::KubeError(other),
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict { .. })
    }

    /// Check if this error means the resource is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound { .. })
    }

    /// Check if this error means a create lost the race
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::AlreadyExists { .. })
    }

    /// Check if this error should be resolved by an immediate requeue
    pub fn requeues_immediately(&self) -> bool {
        matches!(
            self,
            OperatorError::Conflict { .. } | OperatorError::Transient(_)
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Conflict { .. }
                | OperatorError::Transient(_)
                | OperatorError::DeliveryFailed(_)
                | OperatorError::ReconcileFailed(_)
        )
    }
}
