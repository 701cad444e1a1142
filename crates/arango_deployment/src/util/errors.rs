use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

use crate::util::retry::RetryTimeout;
use crate::util::topology::TopologyMismatch;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("NotFound: {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("AlreadyExists: {kind} '{name}'")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Conflict: {kind} '{name}' was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("ValidationError: {0}")]
    ValidationError(String),

    #[error("HttpError: {0}")]
    HttpError(String),

    #[error("SerializationError: {0}")]
    SerializationError(String),

    #[error("TopologyMismatch: {0}")]
    TopologyMismatch(#[source] TopologyMismatch),

    #[error("Timeout: {0}")]
    Timeout(#[source] Box<RetryTimeout<StdError>>),

    #[error("MetricsError: {0}")]
    MetricsError(#[source] prometheus::Error),

    #[error("StillTerminating: {remaining} member pods left")]
    StillTerminating { remaining: usize },
}

/// Where an error sits in the operator's failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried within the pass or deferred to the next scheduled pass.
    Transient,
    /// A transient condition that outlived the pass deadline.
    Timeout,
    /// The spec itself is wrong; nothing changes until it is edited.
    Validation,
    /// Needs external intervention; drives the deployment to `Failed`.
    Fatal,
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let debug = format!("{self:?}");
        debug
            .split(|c: char| !c.is_alphanumeric())
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    /// Classifies a kube client error by its API status code.
    pub fn from_kube(kind: &'static str, name: &str, error: kube::Error) -> StdError {
        match error {
            kube::Error::Api(ref response) => match response.code {
                404 => StdError::NotFound {
                    kind,
                    name: name.to_string(),
                },
                409 if response.reason == "AlreadyExists" => StdError::AlreadyExists {
                    kind,
                    name: name.to_string(),
                },
                409 => StdError::Conflict {
                    kind,
                    name: name.to_string(),
                },
                401 | 403 => StdError::Forbidden(format!("{kind} '{name}': {}", response.message)),
                _ => StdError::KubeError(error),
            },
            _ => StdError::KubeError(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StdError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StdError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StdError::Conflict { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StdError::Timeout(_) => ErrorClass::Timeout,
            StdError::ValidationError(_) => ErrorClass::Validation,
            StdError::Forbidden(_)
            | StdError::AlreadyExists { .. }
            | StdError::InvalidArgument(_)
            | StdError::MetadataMissing(_)
            | StdError::MetricsError(_) => ErrorClass::Fatal,
            StdError::KubeError(_)
            | StdError::FinalizerError(_)
            | StdError::NotFound { .. }
            | StdError::Conflict { .. }
            | StdError::HttpError(_)
            | StdError::SerializationError(_)
            | StdError::JsonSerializationError(_)
            | StdError::TopologyMismatch(_)
            | StdError::StillTerminating { .. } => ErrorClass::Transient,
        }
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (requeue in {:?})", self.error, self.duration)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.std_error().class()
    }

    pub fn std_error(&self) -> &StdError {
        match self {
            Error::StdError(e) => e,
            Error::ErrorWithRequeue(e) => &e.error,
        }
    }
}

impl From<StdError> for Error {
    fn from(error: StdError) -> Self {
        Error::StdError(error)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
