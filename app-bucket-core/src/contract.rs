//! # contract: interfaces of the collaborators the reconcilers depend on
//!
//! The reconcilers never talk to a concrete storage backend, record store or
//! command-line tool directly. Everything external sits behind one of the traits
//! below so that production wiring, the in-process substrate and test mocks are
//! interchangeable.
//!
//! ## Collaborators
//! - [`ObjectStore`]: key/value blob storage (read, write, delete, list).
//! - [`StoreOpener`]: turns a resolved connection string into an [`ObjectStore`].
//! - [`Records`]: the declarative record store with optimistic concurrency and watches.
//! - [`UnpackTool`] / [`CertInspector`]: external tools used by the Android decoder.
//! - [`DeliveryProvisioner`]: publishes the rendered association documents for a host.
//!
//! ## Mocking & Testing
//! The non-generic traits are annotated for `mockall`, exported behind the
//! `test-export-mocks` feature so integration tests can build deterministic mocks.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::association::AssociationDocuments;
use crate::error::{GatewayError, RecordError, StoreError, ToolError};
use crate::records::{AppRecord, ObjectKey, Record, UniversalLinks};

/// Byte stream of a stored object.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Byte sink for a stored object. The object is committed on `shutdown`.
pub type ObjectWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Byte-addressable object storage.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens a stream over the object at `key`, or [`StoreError::NotFound`].
    async fn read(&self, key: &str) -> Result<ObjectReader, StoreError>;

    /// Opens a sink that replaces the object at `key` once shut down.
    async fn write(&self, key: &str, content_type: &str) -> Result<ObjectWriter, StoreError>;

    /// Deletes the object at `key`, or [`StoreError::NotFound`] if absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lazily lists keys starting with `prefix`.
    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, StoreError>>;
}

impl std::fmt::Debug for dyn ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ObjectStore")
    }
}

/// Opens an [`ObjectStore`] from a connection string such as `file:///srv/apps`.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait StoreOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn ObjectStore>, GatewayError>;
}

/// Change notification emitted by a [`Records`] store.
#[derive(Debug, Clone)]
pub enum WatchEvent<R> {
    Applied(R),
    Deleted(R),
}

impl<R: Record> WatchEvent<R> {
    pub fn record(&self) -> &R {
        match self {
            WatchEvent::Applied(r) | WatchEvent::Deleted(r) => r,
        }
    }
}

/// Declarative record store for one record kind.
///
/// `update` writes metadata and spec, `update_status` writes status only. Both
/// are rejected with [`RecordError::Conflict`] when the caller's
/// `resource_version` is stale. `delete` is soft while finalizers remain.
#[async_trait]
pub trait Records<R: Record>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<R, RecordError>;

    async fn list(&self, namespace: &str) -> Result<Vec<R>, RecordError>;

    async fn create(&self, record: R) -> Result<R, RecordError>;

    async fn update(&self, record: &R) -> Result<R, RecordError>;

    async fn update_status(&self, record: &R) -> Result<R, RecordError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), RecordError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<R>>;
}

/// External resource-unpacking tool (e.g. apktool) for Android packages.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait UnpackTool: Send + Sync {
    /// Unpacks `package` into `output_dir` without decompiling sources.
    async fn unpack(
        &self,
        package: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;
}

/// External certificate-inspection tool (e.g. keytool) for signed packages.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CertInspector: Send + Sync {
    /// Returns the textual report, which contains a `SHA256:` field.
    async fn inspect(&self, package: &Path, cancel: &CancellationToken)
        -> Result<String, ToolError>;
}

/// Delivers association documents for a universal-link host.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DeliveryProvisioner: Send + Sync {
    async fn provision(
        &self,
        app: &AppRecord,
        links: &UniversalLinks,
        documents: &AssociationDocuments,
    ) -> Result<(), RecordError>;

    /// Removes anything previously provisioned for `app`. Absence is not an error.
    async fn withdraw(&self, app: &AppRecord) -> Result<(), RecordError>;
}

/// Creates `desired`, or patches an existing record's labels, owner and spec to
/// match it. Returns the stored record, unchanged when nothing differed.
pub async fn create_or_patch<R: Record>(
    records: &dyn Records<R>,
    desired: R,
) -> Result<R, RecordError> {
    let existing = match records.get(&desired.key()).await {
        Ok(existing) => existing,
        Err(e) if e.is_not_found() => return records.create(desired).await,
        Err(e) => return Err(e),
    };

    let mut meta = existing.meta().clone();
    for (k, v) in &desired.meta().labels {
        meta.labels.insert(k.clone(), v.clone());
    }
    meta.owner = desired.meta().owner.clone();

    if meta == *existing.meta() && existing.same_spec(&desired) {
        return Ok(existing);
    }

    let mut next = desired;
    *next.meta_mut() = meta;
    next.take_status_from(&existing);
    records.update(&next).await
}
