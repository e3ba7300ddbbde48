//! Error types for dbtunnel
//!
//! Variants carry the names of the objects involved (database, pod, secret)
//! so the CLI can print a useful message without further context.

use thiserror::Error;

/// Result type for dbtunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for resolution, tunnelling and session operations
#[derive(Debug, Error)]
pub enum Error {
    /// The database object exists but is not in the `Ready` phase
    #[error("{kind} {namespace}/{name} is not ready (phase: {phase})")]
    ResourceNotReady {
        kind: String,
        namespace: String,
        name: String,
        phase: String,
    },

    /// The database object itself does not exist
    #[error("{kind} {namespace}/{name} not found")]
    DatabaseNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// No pod matched, or the targeted pod does not exist
    #[error("pod not found in {namespace}: {name}")]
    PodNotFound { namespace: String, name: String },

    /// The named secret does not exist
    #[error("secret not found: {namespace}/{name}")]
    SecretNotFound { namespace: String, name: String },

    /// The secret exists but lacks a field the engine needs
    #[error("secret {secret} has no field {field}")]
    MissingCredentialField { secret: String, field: String },

    /// The declared topology cannot produce candidates
    #[error("invalid topology for {name}: {message}")]
    InvalidTopology { name: String, message: String },

    /// Opening or maintaining a port-forward failed
    #[error("tunnel to {pod}:{port} failed: {message}")]
    Tunnel {
        pod: String,
        port: u16,
        message: String,
    },

    /// A single candidate could not be confirmed as primary.
    ///
    /// Only raised inside the election loop and never returned from it.
    #[error("probe of {pod} failed: {message}")]
    Probe { pod: String, message: String },

    /// Every candidate was probed and none confirmed primary status
    #[error("no primary found among candidates [{}]", candidates.join(", "))]
    NoPrimaryFound { candidates: Vec<String> },

    /// The external client failed to start or exited unsuccessfully
    #[error("session failed: {message}")]
    Session { message: String, code: Option<i32> },

    /// Transport or API failure talking to the control plane
    #[error("kubernetes error: {source}")]
    Resolution {
        #[from]
        source: kube::Error,
    },

    /// The engine has no support for the requested operation
    #[error("{engine} does not support {operation}")]
    Unsupported { engine: String, operation: String },

    /// Cluster access configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid input from the caller
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn tunnel(pod: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Error::Tunnel {
            pod: pod.into(),
            port,
            message: message.into(),
        }
    }

    pub fn probe(pod: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Probe {
            pod: pod.into(),
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>, code: Option<i32>) -> Self {
        Error::Session {
            message: message.into(),
            code,
        }
    }

    pub fn unsupported(engine: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::Unsupported {
            engine: engine.into(),
            operation: operation.into(),
        }
    }

    pub fn invalid_topology(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidTopology {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Whether a kube error is a 404 from the API server
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

/// A kube API error with the given HTTP status code.
#[cfg(test)]
pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("request failed with {}", code),
        reason: "Test".to_string(),
        code,
    })
}
