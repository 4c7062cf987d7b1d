//! Error types for the volrep data path
//!
//! Errors carry enough context to be surfaced by the outer reconciler.
//! Transient conditions (endpoint not ready, credentials not propagated,
//! retryable API failures) are distinguished from validation errors via
//! [`Error::is_retryable`].

use thiserror::Error;

use crate::transport::tls::TlsError;

/// Main error type for volrep operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for transfer options or CR specs
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field, when one can be named
        field: Option<String>,
    },

    /// A TLS secret exists but lacks a required key, or has not been
    /// propagated into the namespace yet
    #[error("missing credentials: secret {namespace}/{name} has no {key}")]
    MissingCredentials {
        /// Namespace of the secret
        namespace: String,
        /// Name of the secret
        name: String,
        /// The data key that was expected
        key: String,
    },

    /// The endpoint's externally visible address has not been assigned yet
    #[error("endpoint {namespace}/{name} is not ready")]
    EndpointNotReady {
        /// Namespace of the endpoint object
        namespace: String,
        /// Name of the endpoint object
        name: String,
    },

    /// TLS material generation failed
    #[error("tls error: {source}")]
    Tls {
        /// The underlying cert-factory error
        #[from]
        source: TlsError,
    },

    /// Config template rendering failed
    #[error("template error: {source}")]
    Template {
        /// The underlying template-engine error
        #[from]
        source: minijinja::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "mover", "cleanup")
        context: String,
    },

    /// Several independent failures accumulated into one
    #[error("{}", join_errors(.errors))]
    Aggregate {
        /// The individual failures, in occurrence order
        errors: Vec<Error>,
    },
}

fn join_errors(errors: &[Error]) -> String {
    let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("{} error(s): [{}]", errors.len(), msgs.join("; "))
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a missing-credentials error
    pub fn missing_credentials(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::MissingCredentials {
            namespace: namespace.into(),
            name: name.into(),
            key: key.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse a list of errors into a single aggregate.
    ///
    /// Returns `Ok(())` when the list is empty, the sole error when it
    /// holds exactly one, and an [`Error::Aggregate`] otherwise.
    pub fn aggregate(mut errors: Vec<Error>) -> crate::Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate { errors }),
        }
    }

    /// Number of leaf errors carried by this value (1 unless aggregated)
    pub fn len(&self) -> usize {
        match self {
            Error::Aggregate { errors } => errors.len(),
            _ => 1,
        }
    }

    /// An error value is never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check if this error is retryable
    ///
    /// Validation errors require a spec fix and are not retryable.
    /// Endpoint/credential readiness is inherently transient. Kubernetes
    /// errors retry unless they are 4xx API responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::Validation { .. } => false,
            Error::MissingCredentials { .. } => true,
            Error::EndpointNotReady { .. } => true,
            Error::Tls { .. } => false,
            Error::Template { .. } => false,
            Error::Internal { .. } => true,
            Error::Aggregate { errors } => errors.iter().any(|e| e.is_retryable()),
        }
    }
}

/// Returns true when the error is a Kubernetes 409 Conflict ("already
/// exists"). Creation paths treat this as successful resumption.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Returns true when the error is a Kubernetes 404 Not Found.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
