//! Error taxonomy shared by the store client, the resolver and the propagator.
//!
//! Callers branch on the kind: `NotFound` becomes a 404-equivalent at the
//! boundary, `AccessDenied` is a configuration problem, and `Transient` is
//! eligible for a caller-level retry. Cache faults have their own type and
//! never leave `VisibilityCache`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("access to `{resource}` denied: {message}")]
    AccessDenied { resource: String, message: String },
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn access_denied(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AccessDenied {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// True for the 404 class only. Timeouts and throttling are never "missing".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::BucketNotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Raised by cache backends. Swallowed (and logged) by `VisibilityCache`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache circuit open")]
    CircuitOpen,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("package `{0}` not found")]
    PackageNotFound(String),
    #[error("catalog request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("catalog returned an error: {0}")]
    Api(String),
    #[error("catalog is not configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),
    #[error("job payload invalid: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Umbrella error for package-level operations that touch several collaborators.
#[derive(Debug, Error)]
pub enum FilestoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type FilestoreResult<T> = Result<T, FilestoreError>;
