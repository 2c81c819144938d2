//! Reconcilers, one per record kind.
//!
//! Each reconciler takes its collaborators through its constructor and
//! implements [`Reconcile`]; the [`crate::runtime`] scheduler decides when to
//! call it. Watch mappers next to each reconciler turn changes of related
//! records into keys to re-enqueue.

pub mod app;
pub mod artifact;
pub mod bucket;
pub mod ingestion;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ReconcileError;
use crate::records::ObjectKey;

pub use app::AppReconciler;
pub use artifact::ArtifactReconciler;
pub use bucket::BucketReconciler;
pub use ingestion::IngestionReconciler;

/// Default period after which a record is reconciled again without any change.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(9 * 60);

/// What the scheduler should do once a reconcile succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Nothing to do until a watched record changes.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }
}

#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError>;
}

/// Settings shared by reconcilers that touch local disk or resync.
#[derive(Debug, Clone)]
pub struct Settings {
    pub scratch_dir: PathBuf,
    pub resync_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            resync_interval: DEFAULT_RESYNC,
        }
    }
}
