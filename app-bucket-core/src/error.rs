//! Error types shared across the reconcilers.
//!
//! Collaborator errors (object storage, record store, bucket resolution, external
//! tools, package decoding) each get their own enum. [`ReconcileError`] is the
//! only error a reconciler hands back to the scheduler; everything terminal is
//! written into the record's status instead.

use std::time::Duration;

/// Errors from the pluggable object-storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("object storage I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound { key: key.into() };
        }
        Self::Io {
            key: key.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from the declarative record store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently (expected resource version {expected}, found {actual})")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("record store error: {0}")]
    Backend(String),
}

impl RecordError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors resolving a bucket record into an opened store.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid bucket spec: {0}")]
    InvalidSpec(String),

    #[error("get {kind} {name}: not found")]
    ReferenceNotFound { kind: &'static str, name: String },

    #[error("get key {key} in {kind} {name}: missing key")]
    MissingKey {
        kind: &'static str,
        name: String,
        key: String,
    },

    #[error("value of key {key} in {kind} {name} is not valid UTF-8")]
    InvalidValue {
        kind: &'static str,
        name: String,
        key: String,
    },

    #[error("unsupported storage URL scheme in {0}")]
    UnsupportedScheme(String),

    #[error("open bucket {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Record(#[from] RecordError),
}

impl GatewayError {
    /// True when the secret or config map the bucket points at does not exist yet.
    pub fn is_reference_not_found(&self) -> bool {
        matches!(self, Self::ReferenceNotFound { .. })
    }
}

/// Errors from invoking an external decoding tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

/// A failed decode step. `step` becomes the Condition reason.
#[derive(Debug, thiserror::Error)]
#[error("{step}: {message}")]
pub struct DecodeError {
    pub step: &'static str,
    pub message: String,
}

impl DecodeError {
    pub fn new(step: &'static str, message: impl std::fmt::Display) -> Self {
        Self {
            step,
            message: message.to_string(),
        }
    }
}

/// What a reconcile hands back to the scheduler when it cannot finish.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A bucket or credential source the record depends on is not available yet.
    #[error("waiting on dependency: {0}")]
    TransientDependency(String),

    /// The bucket reports Ready but an operation against it still failed.
    #[error("transient storage failure: {0}")]
    TransientStorage(String),

    /// Optimistic concurrency rejected a write; the record is re-enqueued.
    #[error("concurrent modification: {0}")]
    Conflict(RecordError),

    #[error(transparent)]
    Record(RecordError),

    #[error("reconcile cancelled")]
    Cancelled,
}

impl From<RecordError> for ReconcileError {
    fn from(e: RecordError) -> Self {
        if e.is_conflict() {
            ReconcileError::Conflict(e)
        } else {
            ReconcileError::Record(e)
        }
    }
}

impl ReconcileError {
    /// Delay before the scheduler retries, `None` meaning wait for a watch event.
    pub fn retry_after(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconcileError::Conflict(_) => Some(Duration::ZERO),
            ReconcileError::TransientStorage(_) | ReconcileError::Record(_) => {
                Some(Duration::from_secs(1) * 2u32.saturating_pow(attempt.min(8)))
            }
            ReconcileError::TransientDependency(_) | ReconcileError::Cancelled => None,
        }
    }
}
