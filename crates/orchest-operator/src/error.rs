//! Error types for the Orchest Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Object does not exist in the store
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Object already exists in the store
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A component did not report ready within its retry budget
    #[error("exceeded max retry count ({attempts}) waiting for {component} to become ready")]
    ReadinessTimeout { component: String, attempts: u32 },

    /// Writing the cluster status failed
    #[error("failed to record {phase} condition: {source}")]
    StatusUpdate {
        phase: String,
        #[source]
        source: Box<OperatorError>,
    },

    /// An operation failed; `context` names the step and its target
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<OperatorError>,
    },
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Build a not-found error for the given object identity
    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        OperatorError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Build an already-exists error for the given object identity
    pub fn already_exists(kind: &str, namespace: &str, name: &str) -> Self {
        OperatorError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Translate a kube client error into the store taxonomy.
    ///
    /// 404 responses become [`OperatorError::NotFound`] and 409 responses with
    /// reason `AlreadyExists` become [`OperatorError::AlreadyExists`]; every
    /// other failure is kept as a transport error.
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, namespace, name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::already_exists(kind, namespace, name)
            }
            _ => OperatorError::KubeError(err),
        }
    }

    /// Wrap this error with a description of the failed step
    pub fn context(self, context: impl Into<String>) -> Self {
        OperatorError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True if this error (or the error it wraps) is a not-found lookup
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True if this error (or the error it wraps) is a creation race
    pub fn is_already_exists(&self) -> bool {
        match self {
            OperatorError::AlreadyExists { .. } => true,
            OperatorError::Context { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::KubeError(_)
            | OperatorError::ReadinessTimeout { .. }
            | OperatorError::NotFound { .. }
            | OperatorError::AlreadyExists { .. } => true,
            OperatorError::StatusUpdate { source, .. } | OperatorError::Context { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }
}

/// Attach step context to fallible store calls
pub trait ResultExt<T> {
    /// Wrap the error, if any, with a lazily built context message
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}
